//! Pipeline execution engine.
//!
//! The scheduler runs every primary task once its parameters are published,
//! up to `max_parallel` at a time, and is the only writer of the run's
//! [`Parameters`]. Each task runs in a worker that walks its candidate plan
//! (the task, then its jokers) and reports back one [`TaskRun`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinSet;

use promptflow_llm::{LlmExecutionTools, Prompt, Usage};
use promptflow_markdown::BlockType;
use promptflow_scripting::{ScriptExecutionTools, ScriptRequest};
use promptflow_types::{Parameters, PromptflowError, Result};

use crate::cancel::CancellationToken;
use crate::collection::PipelineCollection;
use crate::config::ExecutionConfig;
use crate::dialog::{DialogRequest, UserInterfaceTools};
use crate::events::{EventEmitter, ExecutionEvent, TaskState};
use crate::expectations::check_expectations;
use crate::pipeline::{CompiledPipeline, Task};
use crate::prepare::{task_knowledge, task_model_requirements, task_template};
use crate::registries::Registries;
use crate::report::{AttemptError, AttemptRecord, ExecutionReport, PipelineResult};
use crate::retry::candidate_plan;
use crate::template::resolve_template;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

// ---------------------------------------------------------------------------
// ExecutionTools
// ---------------------------------------------------------------------------

/// Caller-supplied capabilities. The engine never constructs tools itself.
#[derive(Clone, Default)]
pub struct ExecutionTools {
    pub llm: Option<Arc<dyn LlmExecutionTools>>,
    /// Consulted in order; the first that supports the language runs it.
    pub script: Vec<Arc<dyn ScriptExecutionTools>>,
    pub user_interface: Option<Arc<dyn UserInterfaceTools>>,
}

impl ExecutionTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmExecutionTools>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_script(mut self, script: Arc<dyn ScriptExecutionTools>) -> Self {
        self.script.push(script);
        self
    }

    pub fn with_user_interface(mut self, user_interface: Arc<dyn UserInterfaceTools>) -> Self {
        self.user_interface = Some(user_interface);
        self
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

pub struct PipelineExecutor {
    tools: ExecutionTools,
    config: ExecutionConfig,
    registries: Registries,
    collection: Option<Arc<dyn PipelineCollection>>,
    events: EventEmitter,
}

impl PipelineExecutor {
    pub fn new(tools: ExecutionTools) -> Self {
        Self {
            tools,
            config: ExecutionConfig::default(),
            registries: Registries::standard(),
            collection: None,
            events: EventEmitter::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registries(mut self, registries: Registries) -> Self {
        self.registries = registries;
        self
    }

    /// Collection that pipeline-call tasks resolve their URLs against.
    pub fn with_collection(mut self, collection: Arc<dyn PipelineCollection>) -> Self {
        self.collection = Some(collection);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run `pipeline` to completion.
    ///
    /// The pipeline is trusted to be compiled and validated; inconsistencies
    /// found while running surface as `Unexpected` errors.
    pub async fn run(
        &self,
        pipeline: &CompiledPipeline,
        inputs: BTreeMap<String, String>,
    ) -> Result<PipelineResult> {
        self.run_with_cancellation(pipeline, inputs, &CancellationToken::new())
            .await
    }

    /// [`run`](Self::run), stopping early with `Cancelled` once `cancel` fires.
    pub async fn run_with_cancellation(
        &self,
        pipeline: &CompiledPipeline,
        inputs: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let context = Arc::new(RunContext {
            tools: self.tools.clone(),
            config: self.config.clone(),
            registries: self.registries.clone(),
            collection: self.collection.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            meter: Arc::new(Mutex::new(Meter::default())),
        });
        context
            .run_pipeline(Arc::new(pipeline.clone()), inputs, 0)
            .await
    }
}

/// Run `pipeline` with default configuration.
pub async fn run(
    pipeline: &CompiledPipeline,
    inputs: BTreeMap<String, String>,
    tools: ExecutionTools,
) -> Result<PipelineResult> {
    PipelineExecutor::new(tools).run(pipeline, inputs).await
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// Usage of the whole run, nested pipeline calls included.
#[derive(Debug, Default)]
struct Meter {
    usage: Usage,
    tool_calls: u64,
}

struct RunContext {
    tools: ExecutionTools,
    config: ExecutionConfig,
    registries: Registries,
    collection: Option<Arc<dyn PipelineCollection>>,
    events: EventEmitter,
    cancel: CancellationToken,
    meter: Arc<Mutex<Meter>>,
}

/// What a worker hands back to the scheduler.
struct TaskRun {
    result_parameter: String,
    outcome: Result<String>,
    records: Vec<AttemptRecord>,
}

/// Partial results of one attempt, kept even when it fails.
#[derive(Default)]
struct AttemptTrace {
    prompt: Option<String>,
    raw_result: Option<String>,
    usage: Usage,
}

fn inputs_error(message: String) -> PromptflowError {
    PromptflowError::PipelineExecution {
        task: "(inputs)".to_string(),
        message,
    }
}

impl RunContext {
    fn run_pipeline(
        self: Arc<Self>,
        pipeline: Arc<CompiledPipeline>,
        inputs: BTreeMap<String, String>,
        depth: usize,
    ) -> BoxFuture<Result<PipelineResult>> {
        Box::pin(async move { self.schedule(pipeline, inputs, depth).await })
    }

    async fn schedule(
        self: Arc<Self>,
        pipeline: Arc<CompiledPipeline>,
        inputs: BTreeMap<String, String>,
        depth: usize,
    ) -> Result<PipelineResult> {
        let mut parameters = Parameters::new();
        for input in pipeline.input_parameters() {
            let value = inputs
                .get(&input.name)
                .ok_or_else(|| inputs_error(format!("missing input parameter {{{}}}", input.name)))?;
            parameters.publish(input.name.clone(), value.clone())?;
        }
        for name in inputs.keys() {
            if !pipeline.parameter(name).is_some_and(|p| p.is_input) {
                tracing::warn!(parameter = %name, pipeline = %pipeline.title, "Ignoring undeclared input");
            }
        }

        let mut report = ExecutionReport::new(pipeline.url.clone(), pipeline.title.clone());
        let run_id = report.run_id.to_string();
        let mut pending: Vec<String> = pipeline.primary_tasks().map(|t| t.name.clone()).collect();
        self.events.emit(ExecutionEvent::RunStarted {
            run_id: run_id.clone(),
            title: pipeline.title.clone(),
            task_count: pending.len(),
        });
        tracing::info!(pipeline = %pipeline.title, run_id = %run_id, depth, tasks = pending.len(), "Run started");
        for name in &pending {
            self.state(name, name, TaskState::Pending);
        }

        let mut in_flight: JoinSet<TaskRun> = JoinSet::new();
        let outcome: Result<()> = loop {
            if !self.cancel.is_cancelled() {
                while in_flight.len() < self.config.parallelism() {
                    let ready = pending.iter().position(|name| {
                        pipeline.task(name).is_some_and(|task| {
                            pipeline
                                .scheduling_dependencies(task)
                                .iter()
                                .all(|p| parameters.contains(p))
                        })
                    });
                    let Some(index) = ready else { break };
                    let name = pending.remove(index);
                    tracing::debug!(task = %name, "Task scheduled");
                    in_flight.spawn(self.clone().run_task(
                        pipeline.clone(),
                        name,
                        parameters.clone(),
                        depth,
                    ));
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                if pending.is_empty() {
                    break Ok(());
                }
                if self.cancel.is_cancelled() {
                    break Err(PromptflowError::Cancelled);
                }
                break Err(PromptflowError::Unexpected(format!(
                    "tasks {} wait for parameters that are never published",
                    pending.join(", ")
                )));
            };
            let run = match joined {
                Ok(run) => run,
                Err(e) => break Err(PromptflowError::Unexpected(format!("task worker failed: {e}"))),
            };
            for record in run.records {
                report.push(record);
            }
            match run.outcome {
                Ok(value) => {
                    if let Err(e) = parameters.publish(run.result_parameter.clone(), value) {
                        break Err(e);
                    }
                    self.events.emit(ExecutionEvent::ParameterPublished {
                        name: run.result_parameter,
                    });
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(error) = outcome {
            in_flight.abort_all();
            if matches!(error, PromptflowError::Cancelled) {
                tracing::info!(pipeline = %pipeline.title, run_id = %run_id, "Run cancelled");
                self.events.emit(ExecutionEvent::RunCancelled {
                    run_id,
                    title: pipeline.title.clone(),
                });
            } else {
                tracing::error!(pipeline = %pipeline.title, run_id = %run_id, error = %error, "Run failed");
                self.events.emit(ExecutionEvent::RunFailed {
                    run_id,
                    title: pipeline.title.clone(),
                    error: error.to_string(),
                });
            }
            return Err(error);
        }

        let completed_at = Utc::now();
        report.completed_at = Some(completed_at);
        let duration_ms = (completed_at - report.started_at).num_milliseconds().max(0) as u64;
        let output_parameters: BTreeMap<String, String> = pipeline
            .output_parameters()
            .filter_map(|p| parameters.get(&p.name).map(|v| (p.name.clone(), v.to_string())))
            .collect();

        tracing::info!(
            pipeline = %pipeline.title,
            run_id = %run_id,
            duration_ms,
            calls = report.usage.calls,
            "Run completed"
        );
        self.events.emit(ExecutionEvent::RunCompleted {
            run_id,
            title: pipeline.title.clone(),
            duration_ms,
        });
        Ok(PipelineResult {
            usage: report.usage,
            report,
            output_parameters,
            parameters,
        })
    }

    fn state(&self, task: &str, candidate: &str, state: TaskState) {
        tracing::trace!(task = %task, candidate = %candidate, ?state, "Task state");
        self.events.emit(ExecutionEvent::TaskStateChanged {
            task: task.to_string(),
            candidate: candidate.to_string(),
            state,
        });
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    async fn run_task(
        self: Arc<Self>,
        pipeline: Arc<CompiledPipeline>,
        name: String,
        parameters: Parameters,
        depth: usize,
    ) -> TaskRun {
        let mut records = Vec::new();
        let Some(primary) = pipeline.task(&name) else {
            return TaskRun {
                result_parameter: String::new(),
                outcome: Err(PromptflowError::Unexpected(format!("task '{name}' disappeared"))),
                records,
            };
        };
        let outcome = self
            .run_candidates(&pipeline, primary, &parameters, depth, &mut records)
            .await;
        TaskRun {
            result_parameter: primary.result_parameter.clone(),
            outcome,
            records,
        }
    }

    async fn run_candidates(
        &self,
        pipeline: &CompiledPipeline,
        primary: &Task,
        parameters: &Parameters,
        depth: usize,
        records: &mut Vec<AttemptRecord>,
    ) -> Result<String> {
        let plan = candidate_plan(
            &primary.name,
            &primary.jokers,
            self.config.joker_policy,
            self.config.max_attempts,
        );
        let mut last_error = None;
        let mut failed = 0;

        for (index, candidate) in plan.iter().enumerate() {
            let task = pipeline.task(&candidate.task).ok_or_else(|| {
                PromptflowError::Unexpected(format!("joker task '{}' does not exist", candidate.task))
            })?;
            if index > 0 {
                let from = &plan[index - 1].task;
                tracing::info!(task = %primary.name, from = %from, to = %candidate.task, "Falling back to joker");
                self.state(&primary.name, &candidate.task, TaskState::FallingBackToJoker);
                self.events.emit(ExecutionEvent::JokerFallback {
                    task: primary.name.clone(),
                    from: from.clone(),
                    to: candidate.task.clone(),
                });
            }

            for attempt in 1..=candidate.attempts {
                if attempt > 1 {
                    self.state(&primary.name, &candidate.task, TaskState::Retrying);
                    let delay = self.config.backoff.delay_for_attempt(attempt - 2);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => return Err(PromptflowError::Cancelled),
                        }
                    }
                }

                let started_at = Utc::now();
                let mut trace = AttemptTrace::default();
                let result = self
                    .attempt(pipeline, &primary.name, task, parameters, depth, &mut trace)
                    .await;
                let mut record = AttemptRecord {
                    task: primary.name.clone(),
                    candidate: candidate.task.clone(),
                    is_joker: candidate.is_joker,
                    attempt,
                    prompt: trace.prompt,
                    raw_result: trace.raw_result,
                    result: None,
                    error: None,
                    usage: trace.usage,
                    started_at,
                    completed_at: Utc::now(),
                };

                match result {
                    Ok(value) => {
                        record.result = Some(value.clone());
                        records.push(record);
                        self.state(&primary.name, &candidate.task, TaskState::Done);
                        tracing::info!(task = %primary.name, candidate = %candidate.task, attempt, "Task done");
                        return Ok(value);
                    }
                    Err(error) if error.is_attempt_failure() => {
                        record.error = Some(AttemptError::from(&error));
                        records.push(record);
                        failed += 1;
                        tracing::warn!(
                            task = %primary.name,
                            candidate = %candidate.task,
                            attempt,
                            error = %error,
                            "Attempt failed"
                        );
                        self.events.emit(ExecutionEvent::AttemptFailed {
                            task: primary.name.clone(),
                            candidate: candidate.task.clone(),
                            attempt,
                            error: error.to_string(),
                        });
                        last_error = Some(error);
                    }
                    Err(error) => {
                        record.error = Some(AttemptError::from(&error));
                        records.push(record);
                        self.state(&primary.name, &candidate.task, TaskState::Failed);
                        return Err(match error {
                            PromptflowError::Tool { .. } | PromptflowError::Timeout { .. } => {
                                PromptflowError::PipelineExecution {
                                    task: primary.name.clone(),
                                    message: format!("unrecoverable tool failure: {error}"),
                                }
                            }
                            other => other,
                        });
                    }
                }
            }
        }

        self.state(&primary.name, &primary.name, TaskState::Failed);
        let last = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(PromptflowError::PipelineExecution {
            task: primary.name.clone(),
            message: format!("all {failed} attempts failed; last error: {last}"),
        })
    }

    async fn attempt(
        &self,
        pipeline: &CompiledPipeline,
        primary: &str,
        task: &Task,
        parameters: &Parameters,
        depth: usize,
        trace: &mut AttemptTrace,
    ) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(PromptflowError::Cancelled);
        }

        self.state(primary, &task.name, TaskState::ResolvingParameters);
        let mut values: BTreeMap<String, String> = parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        values.insert("currentDate".into(), Utc::now().format("%Y-%m-%d").to_string());
        values.insert("knowledge".into(), task_knowledge(pipeline, task));
        let content = resolve_template(&task.name, &task_template(task), &values)?;

        self.state(primary, &task.name, TaskState::BuildingPrompt);
        trace.prompt = Some(content.clone());

        self.state(primary, &task.name, TaskState::AwaitingToolResult);
        let raw = self
            .call_tool(pipeline, task, content, values, depth, trace)
            .await?;
        trace.raw_result = Some(raw.clone());

        self.state(primary, &task.name, TaskState::Validating);
        let mut value = raw;
        if let Some(tag) = &task.format {
            let format = self.registries.formats.get(tag).ok_or_else(|| {
                PromptflowError::Unexpected(format!("task '{}' expects unknown format {tag}", task.name))
            })?;
            if !format.is_valid(&value) {
                value = format.heal(&value).ok_or_else(|| PromptflowError::Expect {
                    task: task.name.clone(),
                    message: format!("result is not valid {tag} and cannot be healed"),
                })?;
                tracing::debug!(task = %task.name, format = %tag, "Result healed");
            }
        }
        check_expectations(&task.name, &value, &task.expectations)?;

        self.state(primary, &task.name, TaskState::Postprocessing);
        for name in &task.postprocessing {
            let function = self.registries.postprocessors.get(name).ok_or_else(|| {
                PromptflowError::Unexpected(format!(
                    "task '{}' uses unknown postprocessing function {name}",
                    task.name
                ))
            })?;
            value = function(&value);
        }
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Tool calls
    // -----------------------------------------------------------------------

    async fn call_tool(
        &self,
        pipeline: &CompiledPipeline,
        task: &Task,
        content: String,
        values: BTreeMap<String, String>,
        depth: usize,
        trace: &mut AttemptTrace,
    ) -> Result<String> {
        match task.block_type {
            BlockType::SimpleTemplate => Ok(content),
            BlockType::PromptTemplate => {
                let llm = self.tools.llm.as_ref().ok_or_else(|| {
                    PromptflowError::EnvironmentMismatch(
                        "prompt tasks need LLM execution tools, none were provided".into(),
                    )
                })?;
                self.reserve_tool_call()?;
                let prompt = Prompt {
                    title: task.title.clone(),
                    content,
                    parameters: values,
                    model_requirements: task_model_requirements(pipeline, task),
                    format: task.format.clone(),
                };
                let result = self.guarded(llm.title(), llm.execute(&prompt)).await?;
                trace.usage = result.usage;
                self.record_usage(result.usage);
                Ok(result.content)
            }
            BlockType::Script => {
                let language = task.content_language.clone().ok_or_else(|| {
                    PromptflowError::EnvironmentMismatch(format!(
                        "script task '{}' does not name its language",
                        task.name
                    ))
                })?;
                let tools = self
                    .tools
                    .script
                    .iter()
                    .find(|t| t.supports(&language))
                    .ok_or_else(|| {
                        PromptflowError::EnvironmentMismatch(format!(
                            "no script execution tools support {language}"
                        ))
                    })?;
                self.reserve_tool_call()?;
                let request = ScriptRequest {
                    language,
                    script: content,
                    parameters: values,
                    timeout: self.config.task_timeout,
                };
                let output = self.guarded(tools.title(), tools.execute(&request)).await?;
                trace.usage = Usage::call(0, 0, 0.0);
                self.record_usage(trace.usage);
                Ok(output)
            }
            BlockType::PromptDialog => {
                let ui = self.tools.user_interface.as_ref().ok_or_else(|| {
                    PromptflowError::EnvironmentMismatch(
                        "dialog tasks need user interface tools, none were provided".into(),
                    )
                })?;
                let request = DialogRequest {
                    task: task.name.clone(),
                    title: task.title.clone(),
                    question: content,
                    default_value: None,
                    placeholder: task.description.clone(),
                };
                self.guarded("user interface", ui.ask(&request)).await
            }
            BlockType::Pipeline => self.call_pipeline(task, &content, values, depth, trace).await,
        }
    }

    async fn call_pipeline(
        &self,
        task: &Task,
        content: &str,
        values: BTreeMap<String, String>,
        depth: usize,
        trace: &mut AttemptTrace,
    ) -> Result<String> {
        let collection = self.collection.clone().ok_or_else(|| {
            PromptflowError::EnvironmentMismatch(format!(
                "task '{}' calls another pipeline but no collection is attached",
                task.name
            ))
        })?;
        let url = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default();
        if depth + 1 > self.config.max_pipeline_depth {
            return Err(PromptflowError::LimitReached(format!(
                "pipeline calls nested deeper than {} levels",
                self.config.max_pipeline_depth
            )));
        }
        let callee = collection.get_pipeline_by_url(url)?;
        let inputs: BTreeMap<String, String> = values
            .into_iter()
            .filter(|(name, _)| task.dependent_parameters.contains(name))
            .collect();

        tracing::info!(task = %task.name, url = %url, depth = depth + 1, "Calling pipeline");
        let context = self.shared();
        let nested = context.run_pipeline(callee.clone(), inputs, depth + 1).await?;
        trace.usage = nested.usage;

        let output = nested
            .output_parameters
            .get(&task.result_parameter)
            .or_else(|| nested.output_parameters.values().next())
            .cloned()
            .ok_or_else(|| PromptflowError::PipelineExecution {
                task: task.name.clone(),
                message: format!("called pipeline {url} has no output parameters"),
            })?;
        Ok(output)
    }

    /// Context for a nested run; shares the meter and cancellation.
    fn shared(&self) -> Arc<RunContext> {
        Arc::new(RunContext {
            tools: self.tools.clone(),
            config: self.config.clone(),
            registries: self.registries.clone(),
            collection: self.collection.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            meter: self.meter.clone(),
        })
    }

    /// Apply the task timeout and cancellation to one tool call.
    async fn guarded<T>(&self, tool: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let timed = async {
            match self.config.task_timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(PromptflowError::Timeout {
                        tool: tool.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                },
                None => call.await,
            }
        };
        tokio::select! {
            result = timed => result,
            _ = self.cancel.cancelled() => Err(PromptflowError::Cancelled),
        }
    }

    fn meter(&self) -> std::sync::MutexGuard<'_, Meter> {
        self.meter.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count one tool call, failing if a limit is already reached.
    fn reserve_tool_call(&self) -> Result<()> {
        let limits = &self.config.limits;
        let mut meter = self.meter();
        if let Some(max) = limits.max_tool_calls {
            if meter.tool_calls >= max {
                return Err(PromptflowError::LimitReached(format!(
                    "tool call limit of {max} reached"
                )));
            }
        }
        if let Some(max) = limits.max_total_tokens {
            if meter.usage.total_tokens() >= max {
                return Err(PromptflowError::LimitReached(format!(
                    "token limit of {max} reached ({} used)",
                    meter.usage.total_tokens()
                )));
            }
        }
        if let Some(max) = limits.max_price_usd {
            if meter.usage.price_usd >= max {
                return Err(PromptflowError::LimitReached(format!(
                    "price limit of ${max} reached (${:.4} spent)",
                    meter.usage.price_usd
                )));
            }
        }
        meter.tool_calls += 1;
        Ok(())
    }

    fn record_usage(&self, usage: Usage) {
        self.meter().usage += usage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;
    use promptflow_llm::{AvailableModel, PromptResult};
    use promptflow_types::ErrorKind;

    use crate::compiler::compile_pipeline;
    use crate::config::ExecutionLimits;
    use crate::dialog::ScriptedDialog;
    use crate::retry::BackoffPolicy;

    /// Replies from a queue, then echoes the prompt.
    #[derive(Default)]
    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedLlm {
        fn replying(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LlmExecutionTools for ScriptedLlm {
        fn title(&self) -> &str {
            "scripted"
        }

        async fn list_models(&self) -> Result<Vec<AvailableModel>> {
            Ok(vec![])
        }

        async fn call_chat_model(&self, prompt: &Prompt) -> Result<PromptResult> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self.replies.lock().unwrap().pop_front();
            Ok(PromptResult {
                content: reply.unwrap_or_else(|| prompt.content.clone()),
                model_name: "scripted".into(),
                usage: Usage::call(1, 1, 0.01),
            })
        }
    }

    struct UppercaseScript;

    #[async_trait]
    impl ScriptExecutionTools for UppercaseScript {
        fn title(&self) -> &str {
            "uppercase"
        }

        fn supports(&self, language: &str) -> bool {
            language == "js"
        }

        async fn execute(&self, request: &ScriptRequest) -> Result<String> {
            Ok(request.script.to_uppercase())
        }
    }

    /// Always refuses with a non-retryable tool error.
    struct RefusingLlm;

    #[async_trait]
    impl LlmExecutionTools for RefusingLlm {
        fn title(&self) -> &str {
            "refusing"
        }

        async fn list_models(&self) -> Result<Vec<AvailableModel>> {
            Ok(vec![])
        }

        async fn call_chat_model(&self, _prompt: &Prompt) -> Result<PromptResult> {
            Err(PromptflowError::Tool {
                tool: "refusing".into(),
                message: "auth denied".into(),
                retryable: false,
            })
        }
    }

    /// Cancels the run from inside the tool call, then answers normally.
    struct CancellingScript {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl ScriptExecutionTools for CancellingScript {
        fn title(&self) -> &str {
            "cancelling"
        }

        fn supports(&self, language: &str) -> bool {
            language == "js"
        }

        async fn execute(&self, request: &ScriptRequest) -> Result<String> {
            self.cancel.cancel();
            Ok(request.script.clone())
        }
    }

    fn compile(source: &str) -> CompiledPipeline {
        compile_pipeline(source, &Registries::standard()).unwrap()
    }

    fn inputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn with_llm(llm: ScriptedLlm) -> ExecutionTools {
        ExecutionTools::new().with_llm(Arc::new(llm))
    }

    const TWO_STEPS: &str = r#"# Two steps

- INPUT PARAMETER {topic}
- OUTPUT PARAMETER {summary}

## Draft

```
Draft about {topic}
```

-> {draft}

## Summarize

```
Summarize {draft}
```

-> {summary}
"#;

    #[tokio::test]
    async fn dependent_tasks_see_published_values() {
        let pipeline = compile(TWO_STEPS);
        let result = run(&pipeline, inputs(&[("topic", "cats")]), with_llm(ScriptedLlm::default()))
            .await
            .unwrap();
        assert_eq!(result.output_parameters["summary"], "Summarize Draft about cats");
        assert_eq!(result.parameters.get("draft"), Some("Draft about cats"));
        let order: Vec<_> = result.report.records.iter().map(|r| r.task.as_str()).collect();
        assert_eq!(order, vec!["draft", "summarize"]);
        assert_eq!(result.usage.calls, 2);
        assert!(result.report.completed_at.is_some());
    }

    #[tokio::test]
    async fn missing_input_fails_fast() {
        let pipeline = compile(TWO_STEPS);
        let err = run(&pipeline, BTreeMap::new(), with_llm(ScriptedLlm::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PipelineExecution);
        assert!(err.to_string().contains("{topic}"), "{err}");
    }

    #[tokio::test]
    async fn retries_until_expectations_pass() {
        let pipeline = compile(
            "# Retry\n\n- INPUT PARAMETER {x}\n- OUTPUT PARAMETER {y}\n\n## Write\n\n- EXPECT min 3 words\n\n```\nWrite {x}\n```\n\n-> {y}\n",
        );
        let llm = ScriptedLlm::replying(&["too short", "now long enough"]);
        let result = run(&pipeline, inputs(&[("x", "it")]), with_llm(llm)).await.unwrap();
        assert_eq!(result.output_parameters["y"], "now long enough");
        let records = &result.report.records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].error.as_ref().map(|e| e.kind), Some(ErrorKind::Expect));
        assert_eq!(records[1].attempt, 2);
        // the failed attempt is still paid for
        assert_eq!(result.usage.calls, 2);
    }

    #[tokio::test]
    async fn invalid_format_is_healed() {
        let pipeline = compile(
            "# Json\n\n- INPUT PARAMETER {x}\n- OUTPUT PARAMETER {y}\n\n## Data\n\n- FORMAT JSON\n\n```\nGive {x} as JSON\n```\n\n-> {y}\n",
        );
        let llm = ScriptedLlm::replying(&["Sure:\n```json\n{\"a\": 1}\n```"]);
        let result = run(&pipeline, inputs(&[("x", "a")]), with_llm(llm)).await.unwrap();
        assert_eq!(result.output_parameters["y"], "{\"a\": 1}");
        assert_eq!(result.report.records.len(), 1);
    }

    #[tokio::test]
    async fn simple_template_is_postprocessed_without_tools() {
        let pipeline = compile(
            "# Simple\n\n- INPUT PARAMETER {name}\n- OUTPUT PARAMETER {greeting}\n\n## Greet\n\n- BLOCK Simple template\n- POSTPROCESS uppercase\n\n```\nhello {name}\n```\n\n-> {greeting}\n",
        );
        let result = run(&pipeline, inputs(&[("name", "Ann")]), ExecutionTools::new())
            .await
            .unwrap();
        assert_eq!(result.output_parameters["greeting"], "HELLO ANN");
        assert_eq!(result.report.records[0].raw_result.as_deref(), Some("hello Ann"));
        assert_eq!(result.usage.calls, 0);
    }

    #[tokio::test]
    async fn unknown_postprocessor_is_unexpected() {
        let mut pipeline = compile(
            "# Simple\n\n- INPUT PARAMETER {name}\n- OUTPUT PARAMETER {greeting}\n\n## Greet\n\n- BLOCK Simple template\n\n```\nhello {name}\n```\n\n-> {greeting}\n",
        );
        pipeline.tasks[0].postprocessing.push("reverse".into());
        let err = run(&pipeline, inputs(&[("name", "Ann")]), ExecutionTools::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
    }

    #[tokio::test]
    async fn prompt_task_without_llm_is_environment_mismatch() {
        let pipeline = compile(TWO_STEPS);
        let err = run(&pipeline, inputs(&[("topic", "cats")]), ExecutionTools::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentMismatch);
    }

    #[tokio::test]
    async fn timeouts_count_as_failed_attempts() {
        let pipeline = compile(TWO_STEPS);
        let executor = PipelineExecutor::new(with_llm(ScriptedLlm::slow(Duration::from_millis(500))))
            .with_config(
                ExecutionConfig::default()
                    .with_max_attempts(2)
                    .with_task_timeout(Duration::from_millis(20)),
            );
        let err = executor
            .run(&pipeline, inputs(&[("topic", "cats")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PipelineExecution);
        let message = err.to_string();
        assert!(message.contains("all 2 attempts failed"), "{message}");
        assert!(message.contains("timed out"), "{message}");
    }

    #[tokio::test]
    async fn tool_call_limit_stops_the_run() {
        let pipeline = compile(TWO_STEPS);
        let limits = ExecutionLimits {
            max_tool_calls: Some(1),
            ..ExecutionLimits::default()
        };
        let executor = PipelineExecutor::new(with_llm(ScriptedLlm::default()))
            .with_config(ExecutionConfig::default().with_limits(limits));
        let err = executor
            .run(&pipeline, inputs(&[("topic", "cats")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LimitReached);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let pipeline = compile(TWO_STEPS);
        let executor = PipelineExecutor::new(with_llm(ScriptedLlm::default()));
        let mut events = executor.events().subscribe();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .run_with_cancellation(&pipeline, inputs(&[("topic", "cats")]), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let mut saw_cancel = false;
        while let Ok(event) = events.try_recv() {
            saw_cancel |= matches!(event, ExecutionEvent::RunCancelled { .. });
        }
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn cancellation_interrupts_tool_call() {
        let pipeline = compile(TWO_STEPS);
        let executor = PipelineExecutor::new(with_llm(ScriptedLlm::slow(Duration::from_secs(10))));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            executor.run_with_cancellation(&pipeline, inputs(&[("topic", "cats")]), &cancel),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn unrecoverable_tool_error_fails_the_run() {
        let pipeline = compile(TWO_STEPS);
        let err = run(
            &pipeline,
            inputs(&[("topic", "cats")]),
            ExecutionTools::new().with_llm(Arc::new(RefusingLlm)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PipelineExecution);
        let message = err.to_string();
        assert!(message.contains("unrecoverable tool failure"), "{message}");
        assert!(message.contains("auth denied"), "{message}");
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_backoff() {
        let pipeline = compile(
            "# Retry\n\n- INPUT PARAMETER {x}\n- OUTPUT PARAMETER {y}\n\n## Write\n\n- EXPECT min 3 words\n\n```\nWrite {x}\n```\n\n-> {y}\n",
        );
        let executor = PipelineExecutor::new(with_llm(ScriptedLlm::replying(&["no"]))).with_config(
            ExecutionConfig {
                backoff: BackoffPolicy::Fixed(Duration::from_secs(5)),
                ..ExecutionConfig::default()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            executor.run_with_cancellation(&pipeline, inputs(&[("x", "it")]), &cancel),
        )
        .await
        .expect("run should stop before the backoff ends")
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn late_cancellation_keeps_finished_run() {
        let pipeline = compile(
            "# Script\n\n- INPUT PARAMETER {x}\n- OUTPUT PARAMETER {y}\n\n## Echo\n\n- BLOCK Script\n\n```js\nreturn '{x}'\n```\n\n-> {y}\n",
        );
        let cancel = CancellationToken::new();
        let tools = ExecutionTools::new().with_script(Arc::new(CancellingScript {
            cancel: cancel.clone(),
        }));
        let result = PipelineExecutor::new(tools)
            .run_with_cancellation(&pipeline, inputs(&[("x", "hi")]), &cancel)
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(result.output_parameters["y"], "return 'hi'");
    }

    #[tokio::test]
    async fn dialog_task_asks_user_interface() {
        let pipeline = compile(
            "# Ask\n\n- INPUT PARAMETER {who}\n- OUTPUT PARAMETER {answer}\n\n## Ask name\n\n- BLOCK Prompt dialog\n\n```\nWhat is the name of {who}?\n```\n\n-> {answer}\n",
        );
        let dialog = Arc::new(ScriptedDialog::new(["Rex"]));
        let tools = ExecutionTools::new().with_user_interface(dialog.clone());
        let result = run(&pipeline, inputs(&[("who", "the dog")]), tools).await.unwrap();
        assert_eq!(result.output_parameters["answer"], "Rex");
        assert_eq!(dialog.requests()[0].question, "What is the name of the dog?");
    }

    #[tokio::test]
    async fn script_task_uses_supporting_tools() {
        let pipeline = compile(
            "# Script\n\n- INPUT PARAMETER {x}\n- OUTPUT PARAMETER {y}\n\n## Shout\n\n- BLOCK Script\n\n```js\nreturn '{x}'\n```\n\n-> {y}\n",
        );
        let tools = ExecutionTools::new().with_script(Arc::new(UppercaseScript));
        let result = run(&pipeline, inputs(&[("x", "hi")]), tools).await.unwrap();
        assert_eq!(result.output_parameters["y"], "RETURN 'HI'");

        let err = run(&pipeline, inputs(&[("x", "hi")]), ExecutionTools::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentMismatch);
    }

    #[tokio::test]
    async fn joker_takes_over_after_budget() {
        let pipeline = compile(
            "# Joker\n\n- INPUT PARAMETER {x}\n- OUTPUT PARAMETER {y}\n\n## Main\n\n- EXPECT min 3 words\n- JOKER Fallback\n\n```\nMain {x}\n```\n\n-> {y}\n\n## Fallback\n\n- BLOCK Simple template\n\n```\nfallback value for {x}\n```\n",
        );
        let executor = PipelineExecutor::new(with_llm(ScriptedLlm::replying(&["no", "nope"])))
            .with_config(ExecutionConfig::default().with_max_attempts(2));
        let mut events = executor.events().subscribe();
        let result = executor.run(&pipeline, inputs(&[("x", "it")])).await.unwrap();
        assert_eq!(result.output_parameters["y"], "fallback value for it");

        let summary: Vec<_> = result
            .report
            .records
            .iter()
            .map(|r| (r.candidate.as_str(), r.is_success()))
            .collect();
        assert_eq!(summary, vec![("main", false), ("main", false), ("fallback", true)]);

        let mut fallbacks = 0;
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::JokerFallback { from, to, .. } = event {
                assert_eq!((from.as_str(), to.as_str()), ("main", "fallback"));
                fallbacks += 1;
            }
        }
        assert_eq!(fallbacks, 1);
    }
}
