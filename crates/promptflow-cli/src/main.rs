//! CLI binary for validating, inspecting and running markdown pipelines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use promptflow_llm::MockedEchoLlmTools;
use promptflow_markdown::parse_pipeline_source;
use promptflow_pipeline::{
    collection_to_json, compile_pipeline, compile_source, create_collection_from_directory,
    validate, AutoAnswerDialog, CancellationToken, CompiledPipeline, ConsoleDialog,
    ExecutionConfig, ExecutionLimits, ExecutionTools, JokerPolicy, PipelineCollection,
    PipelineExecutor, Registries, Severity,
};
use promptflow_scripting::ProcessScriptTools;

#[derive(Parser)]
#[command(name = "ptbk", version, about = "Markdown pipeline runner for LLM workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check pipeline files and print every finding
    Validate {
        /// Pipeline .md files
        #[arg(required = true)]
        pipelines: Vec<PathBuf>,
    },

    /// Show parameters and tasks of a pipeline
    Info {
        /// Path to the pipeline .md file
        pipeline: PathBuf,
    },

    /// Run a pipeline against the echo model
    Run {
        /// Path to the pipeline .md file
        pipeline: PathBuf,

        /// Input parameter as name=value; repeatable
        #[arg(short, long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,

        /// Directory with further pipelines, for `Pipeline` tasks
        #[arg(short, long)]
        collection: Option<PathBuf>,

        /// Attempts per task before falling back to jokers
        #[arg(long, default_value = "3")]
        max_attempts: usize,

        /// Tasks running at the same time
        #[arg(long, default_value = "5")]
        max_parallel: usize,

        /// Per-attempt tool timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// `retry-then-fallback` or `retry-every-candidate`
        #[arg(long, default_value = "retry-then-fallback")]
        joker_policy: String,

        /// Abort once this many tool calls have been made
        #[arg(long)]
        max_tool_calls: Option<u64>,

        /// Ask `Prompt dialog` questions on the console instead of taking defaults
        #[arg(long)]
        interactive: bool,

        /// Write the markdown execution report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Load a directory of pipelines as one collection
    Collection {
        /// Directory with .md pipelines
        dir: PathBuf,

        /// Write the collection as JSON here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { pipelines } => cmd_validate(&pipelines)?,
        Commands::Info { pipeline } => cmd_info(&pipeline)?,
        Commands::Run {
            pipeline,
            inputs,
            collection,
            max_attempts,
            max_parallel,
            timeout_secs,
            joker_policy,
            max_tool_calls,
            interactive,
            report,
        } => {
            let policy = JokerPolicy::from_name(&joker_policy)
                .ok_or_else(|| anyhow::anyhow!("unknown joker policy '{joker_policy}'"))?;
            let mut config = ExecutionConfig::default()
                .with_max_attempts(max_attempts)
                .with_max_parallel(max_parallel)
                .with_joker_policy(policy)
                .with_limits(ExecutionLimits {
                    max_tool_calls,
                    ..ExecutionLimits::default()
                });
            if let Some(secs) = timeout_secs {
                config = config.with_task_timeout(Duration::from_secs(secs));
            }
            let options = RunOptions {
                collection,
                config,
                interactive,
                report,
            };
            cmd_run(&pipeline, inputs.into_iter().collect(), options).await?;
        }
        Commands::Collection { dir, output } => cmd_collection(&dir, output.as_deref())?,
    }

    Ok(())
}

fn parse_input(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim().trim_start_matches('{').trim_end_matches('}');
    if name.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}

fn load_pipeline(path: &Path, registries: &Registries) -> anyhow::Result<CompiledPipeline> {
    let source = std::fs::read_to_string(path)?;
    Ok(compile_pipeline(&source, registries)?)
}

// ---------------------------------------------------------------------------
// validate / info
// ---------------------------------------------------------------------------

fn cmd_validate(paths: &[PathBuf]) -> anyhow::Result<()> {
    let registries = Registries::standard();
    let mut has_error = false;

    for path in paths {
        let source = std::fs::read_to_string(path)?;
        let pipeline = match parse_pipeline_source(&source, &registries.commands)
            .and_then(compile_source)
        {
            Ok(pipeline) => pipeline,
            Err(e) => {
                has_error = true;
                println!("{}: [ERROR] {}: {}", path.display(), e.kind(), e);
                continue;
            }
        };

        let diagnostics = validate(&pipeline, &registries);
        if diagnostics.is_empty() {
            println!("{}: valid", path.display());
            continue;
        }
        for diag in &diagnostics {
            let severity = match diag.severity {
                Severity::Error => {
                    has_error = true;
                    "ERROR"
                }
                Severity::Warning => "WARN",
                Severity::Info => "INFO",
            };
            match &diag.task {
                Some(task) => println!(
                    "{}: [{}] {} ({}): {}",
                    path.display(),
                    severity,
                    diag.rule,
                    task,
                    diag.message
                ),
                None => println!("{}: [{}] {}: {}", path.display(), severity, diag.rule, diag.message),
            }
            if let Some(fix) = &diag.fix {
                println!("    fix: {fix}");
            }
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path, &Registries::standard())?;

    println!("Pipeline: {}", pipeline.title);
    if let Some(url) = &pipeline.url {
        println!("URL: {url}");
    }
    if let Some(description) = &pipeline.description {
        println!("Description: {description}");
    }

    println!("\nParameters:");
    for param in &pipeline.parameters {
        let direction = match (param.is_input, param.is_output) {
            (true, true) => "input+output",
            (true, false) => "input",
            (false, true) => "output",
            (false, false) => "intermediate",
        };
        match &param.description {
            Some(d) => println!("  {{{}}} [{}] {}", param.name, direction, d),
            None => println!("  {{{}}} [{}]", param.name, direction),
        }
    }

    println!("\nTasks:");
    for task in &pipeline.tasks {
        let deps: Vec<&str> = task.dependent_parameters.iter().map(String::as_str).collect();
        println!(
            "  {} [{}] -> {{{}}} needs {:?}",
            task.name, task.block_type, task.result_parameter, deps
        );
        if !task.jokers.is_empty() {
            println!("    jokers: {}", task.jokers.join(", "));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    collection: Option<PathBuf>,
    config: ExecutionConfig,
    interactive: bool,
    report: Option<PathBuf>,
}

async fn cmd_run(
    path: &Path,
    inputs: BTreeMap<String, String>,
    options: RunOptions,
) -> anyhow::Result<()> {
    let registries = Registries::standard();
    let pipeline = load_pipeline(path, &registries)?;

    println!("Running pipeline: {}", pipeline.title);
    println!("(echo model -- no real LLM calls)");

    let mut tools = ExecutionTools::new()
        .with_llm(Arc::new(MockedEchoLlmTools))
        .with_script(Arc::new(ProcessScriptTools::current_dir()?));
    tools = if options.interactive {
        tools.with_user_interface(Arc::new(ConsoleDialog))
    } else {
        tools.with_user_interface(Arc::new(AutoAnswerDialog))
    };

    let mut executor = PipelineExecutor::new(tools)
        .with_config(options.config)
        .with_registries(registries.clone());
    if let Some(dir) = &options.collection {
        let collection = create_collection_from_directory(dir, &registries)?;
        println!("Collection: {} pipelines", collection.list_pipelines().len());
        executor = executor.with_collection(Arc::new(collection));
    }

    let mut events = executor.events().subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!(event = %json, "Execution event");
            }
        }
    });

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_ctrl_c.cancel();
        }
    });

    let outcome = executor
        .run_with_cancellation(&pipeline, inputs, &cancel)
        .await;
    drop(executor);
    event_log.abort();

    let result = outcome?;
    println!("\nPipeline completed");
    for (name, value) in &result.output_parameters {
        println!("\n{{{name}}}:\n{value}");
    }
    println!(
        "\nUsage: {} calls, {} tokens, ${:.4}",
        result.usage.calls,
        result.usage.total_tokens(),
        result.usage.price_usd
    );
    if result.report.failed_attempts() > 0 {
        println!("Failed attempts: {}", result.report.failed_attempts());
    }

    if let Some(report_path) = options.report {
        if let Some(parent) = report_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&report_path, result.report.to_markdown())?;
        println!("Report: {}", report_path.display());
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// collection
// ---------------------------------------------------------------------------

fn cmd_collection(dir: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let collection = create_collection_from_directory(dir, &Registries::standard())?;

    for url in collection.list_pipelines() {
        let pipeline = collection.get_pipeline_by_url(&url)?;
        println!("{url}  {} ({} tasks)", pipeline.title, pipeline.tasks.len());
    }

    if let Some(output) = output {
        let json = serde_json::to_string_pretty(&collection_to_json(&collection)?)?;
        std::fs::write(output, json)?;
        println!("Wrote {}", output.display());
    }
    Ok(())
}
