//! Pipeline validation: lint rules and diagnostics.
//!
//! Call [`validate`] for every finding or [`validate_or_raise`] to turn
//! `Error`-severity findings into a `PipelineLogic` error.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use promptflow_markdown::{BlockType, CommandKind};
use promptflow_types::{PromptflowError, Result};

use crate::pipeline::CompiledPipeline;
use crate::registries::Registries;
use crate::template::{is_reserved, RESERVED_PARAMETERS};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub task: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    fn error(rule: &str, task: Option<&str>, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            task: task.map(String::from),
            fix: None,
        }
    }

    fn warning(rule: &str, task: Option<&str>, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, task, message)
        }
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &CompiledPipeline, registries: &Registries) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Result parameter → primary tasks publishing it.
fn producers(pipeline: &CompiledPipeline) -> BTreeMap<&str, Vec<&str>> {
    let mut map: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for task in pipeline.primary_tasks() {
        map.entry(task.result_parameter.as_str())
            .or_default()
            .push(task.name.as_str());
    }
    map
}

fn is_http_url(url: &str) -> bool {
    (url.starts_with("https://") || url.starts_with("http://"))
        && url.len() > "https://".len()
        && !url.contains(char::is_whitespace)
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct UniqueTaskNamesRule;
impl LintRule for UniqueTaskNamesRule {
    fn name(&self) -> &str {
        "unique_task_names"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let mut seen = BTreeSet::new();
        pipeline
            .tasks
            .iter()
            .filter(|t| !seen.insert(t.name.as_str()))
            .map(|t| {
                Diagnostic::error(
                    self.name(),
                    Some(&t.name),
                    format!("Task name '{}' is used by more than one section", t.name),
                )
                .with_fix("Rename one of the sections")
            })
            .collect()
    }
}

struct UniqueResultParametersRule;
impl LintRule for UniqueResultParametersRule {
    fn name(&self) -> &str {
        "unique_result_parameters"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        producers(pipeline)
            .into_iter()
            .filter(|(_, tasks)| tasks.len() > 1)
            .map(|(parameter, tasks)| {
                Diagnostic::error(
                    self.name(),
                    None,
                    format!(
                        "Parameter {{{parameter}}} is produced by more than one task: {}",
                        tasks.join(", ")
                    ),
                )
            })
            .collect()
    }
}

struct UndefinedParametersRule;
impl LintRule for UndefinedParametersRule {
    fn name(&self) -> &str {
        "undefined_parameters"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let produced = producers(pipeline);
        let mut diagnostics = Vec::new();
        for task in &pipeline.tasks {
            for parameter in &task.dependent_parameters {
                let is_input = pipeline.parameter(parameter).is_some_and(|p| p.is_input);
                if is_input || produced.contains_key(parameter.as_str()) || is_reserved(parameter)
                {
                    continue;
                }
                diagnostics.push(
                    Diagnostic::error(
                        self.name(),
                        Some(&task.name),
                        format!(
                            "Task '{}' references undefined parameter {{{parameter}}}",
                            task.name
                        ),
                    )
                    .with_fix(format!(
                        "Declare `- INPUT PARAMETER {{{parameter}}}` or produce it with `-> {{{parameter}}}`"
                    )),
                );
            }
        }
        diagnostics
    }
}

struct ReservedParameterNamesRule;
impl LintRule for ReservedParameterNamesRule {
    fn name(&self) -> &str {
        "reserved_parameter_names"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        pipeline
            .parameters
            .iter()
            .filter(|p| is_reserved(&p.name))
            .map(|p| {
                Diagnostic::error(
                    self.name(),
                    None,
                    format!("Parameter name {{{}}} is reserved", p.name),
                )
                .with_fix(format!(
                    "Rename it; reserved names are {}",
                    RESERVED_PARAMETERS.join(", ")
                ))
            })
            .collect()
    }
}

struct OutputsProducedRule;
impl LintRule for OutputsProducedRule {
    fn name(&self) -> &str {
        "outputs_produced"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let produced = producers(pipeline);
        pipeline
            .output_parameters()
            .filter(|p| !p.is_input && !produced.contains_key(p.name.as_str()))
            .map(|p| {
                Diagnostic::error(
                    self.name(),
                    None,
                    format!("Output parameter {{{}}} is never produced by a task", p.name),
                )
            })
            .collect()
    }
}

struct InputsNotProducedRule;
impl LintRule for InputsNotProducedRule {
    fn name(&self) -> &str {
        "inputs_not_produced"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let produced = producers(pipeline);
        pipeline
            .input_parameters()
            .filter_map(|p| produced.get(p.name.as_str()).map(|tasks| (p, tasks)))
            .map(|(p, tasks)| {
                Diagnostic::error(
                    self.name(),
                    tasks.first().copied(),
                    format!(
                        "Input parameter {{{}}} is also produced by task '{}'",
                        p.name,
                        tasks.join(", ")
                    ),
                )
            })
            .collect()
    }
}

struct CircularDependencyRule;
impl LintRule for CircularDependencyRule {
    fn name(&self) -> &str {
        "circular_dependency"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: BTreeMap<&str, NodeIndex> = BTreeMap::new();
        let primaries: Vec<_> = pipeline.primary_tasks().collect();
        for task in &primaries {
            nodes.insert(task.name.as_str(), graph.add_node(task.name.as_str()));
        }
        let produced = producers(pipeline);
        for task in &primaries {
            let consumer = nodes[task.name.as_str()];
            for parameter in pipeline.scheduling_dependencies(task) {
                for producer in produced.get(parameter.as_str()).into_iter().flatten() {
                    graph.update_edge(nodes[producer], consumer, ());
                }
            }
        }

        tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut names: Vec<&str> = scc.iter().map(|n| graph[*n]).collect();
                names.sort_unstable();
                Diagnostic::error(
                    self.name(),
                    names.first().copied(),
                    format!("Pipeline has a circular dependency between tasks {}", names.join(", ")),
                )
                .with_fix("Break the cycle so every parameter is produced before it is used")
            })
            .collect()
    }
}

struct JokerTargetsRule;
impl LintRule for JokerTargetsRule {
    fn name(&self) -> &str {
        "joker_targets"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let mut primaries_of: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for task in &pipeline.tasks {
            for joker in &task.jokers {
                let error = |message: String| Diagnostic::error(self.name(), Some(&task.name), message);
                if joker == &task.name {
                    diagnostics.push(error(format!("Task '{}' names itself as a joker", task.name)));
                    continue;
                }
                let Some(target) = pipeline.task(joker) else {
                    diagnostics.push(error(format!(
                        "Task '{}' names unknown joker task '{joker}'",
                        task.name
                    )));
                    continue;
                };
                primaries_of.entry(joker).or_default().push(&task.name);
                if !target.jokers.is_empty() {
                    diagnostics.push(error(format!(
                        "Joker task '{joker}' has jokers of its own; fallback chains cannot nest"
                    )));
                }
                if target.result_parameter != task.result_parameter {
                    diagnostics.push(error(format!(
                        "Joker task '{joker}' produces {{{}}} but '{}' produces {{{}}}",
                        target.result_parameter, task.name, task.result_parameter
                    )));
                }
            }
        }
        for (joker, primaries) in primaries_of {
            if primaries.len() > 1 {
                diagnostics.push(Diagnostic::error(
                    self.name(),
                    Some(joker),
                    format!(
                        "Joker task '{joker}' is shared by tasks {}; a joker serves one task",
                        primaries.join(", ")
                    ),
                ));
            }
        }
        diagnostics
    }
}

struct KnownFormatRule;
impl LintRule for KnownFormatRule {
    fn name(&self) -> &str {
        "known_format"
    }
    fn apply(&self, pipeline: &CompiledPipeline, registries: &Registries) -> Vec<Diagnostic> {
        pipeline
            .tasks
            .iter()
            .filter_map(|t| t.format.as_deref().map(|f| (t, f)))
            .filter(|(_, tag)| !registries.formats.contains(tag))
            .map(|(t, tag)| {
                Diagnostic::error(
                    self.name(),
                    Some(&t.name),
                    format!("Task '{}' expects unknown format {tag}", t.name),
                )
                .with_fix(format!("Use one of {}", registries.formats.tags().join(", ")))
            })
            .collect()
    }
}

struct KnownPostprocessRule;
impl LintRule for KnownPostprocessRule {
    fn name(&self) -> &str {
        "known_postprocess"
    }
    fn apply(&self, pipeline: &CompiledPipeline, registries: &Registries) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for task in &pipeline.tasks {
            for function in &task.postprocessing {
                if !registries.postprocessors.contains(function) {
                    diagnostics.push(Diagnostic::error(
                        self.name(),
                        Some(&task.name),
                        format!("Task '{}' uses unknown postprocess function '{function}'", task.name),
                    ));
                }
            }
        }
        diagnostics
    }
}

struct ExpectationBoundsRule;
impl LintRule for ExpectationBoundsRule {
    fn name(&self) -> &str {
        "expectation_bounds"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for task in &pipeline.tasks {
            for (unit, amount) in &task.expectations {
                if !amount.is_consistent() {
                    diagnostics.push(Diagnostic::error(
                        self.name(),
                        Some(&task.name),
                        format!(
                            "Task '{}' expects at least {} but at most {} {unit}",
                            task.name,
                            amount.min.unwrap_or(0),
                            amount.max.unwrap_or(0)
                        ),
                    ));
                }
            }
        }
        diagnostics
    }
}

struct PersonaDeclaredRule;
impl LintRule for PersonaDeclaredRule {
    fn name(&self) -> &str {
        "persona_declared"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        pipeline
            .tasks
            .iter()
            .filter_map(|t| t.persona.as_deref().map(|p| (t, p)))
            .filter(|(_, persona)| pipeline.persona(persona).is_none())
            .map(|(t, persona)| {
                Diagnostic::error(
                    self.name(),
                    Some(&t.name),
                    format!("Task '{}' uses undeclared persona '{persona}'", t.name),
                )
            })
            .collect()
    }
}

struct ScriptLanguageRule;
impl LintRule for ScriptLanguageRule {
    fn name(&self) -> &str {
        "script_language"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        pipeline
            .tasks
            .iter()
            .filter(|t| t.block_type == BlockType::Script && t.content_language.is_none())
            .map(|t| {
                Diagnostic::error(
                    self.name(),
                    Some(&t.name),
                    format!("Script task '{}' does not declare a language", t.name),
                )
                .with_fix("Add the language to the code fence, e.g. ```python")
            })
            .collect()
    }
}

struct PipelineUrlRule;
impl LintRule for PipelineUrlRule {
    fn name(&self) -> &str {
        "pipeline_url"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if let Some(url) = &pipeline.url {
            if !is_http_url(url) {
                diagnostics.push(Diagnostic::error(
                    self.name(),
                    None,
                    format!("Pipeline URL '{url}' is not an http(s) URL"),
                ));
            } else if url.contains('#') {
                diagnostics.push(Diagnostic::warning(
                    self.name(),
                    None,
                    format!("Pipeline URL '{url}' has a fragment; it is ignored for lookups"),
                ));
            }
        }
        for task in pipeline.tasks.iter().filter(|t| t.block_type == BlockType::Pipeline) {
            match task.called_pipeline_url() {
                Some(url) if is_http_url(url) => {}
                _ => diagnostics.push(
                    Diagnostic::error(
                        self.name(),
                        Some(&task.name),
                        format!("Pipeline task '{}' does not name a pipeline URL", task.name),
                    )
                    .with_fix("Put the called pipeline's URL on the first line of the code block"),
                ),
            }
        }
        diagnostics
    }
}

struct UnusedInputsRule;
impl LintRule for UnusedInputsRule {
    fn name(&self) -> &str {
        "unused_inputs"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        let used: BTreeSet<&str> = pipeline
            .tasks
            .iter()
            .flat_map(|t| t.dependent_parameters.iter().map(String::as_str))
            .collect();
        pipeline
            .input_parameters()
            .filter(|p| !p.is_output && !used.contains(p.name.as_str()))
            .map(|p| {
                Diagnostic::warning(
                    self.name(),
                    None,
                    format!("Input parameter {{{}}} is never used", p.name),
                )
            })
            .collect()
    }
}

struct ModelOnNonPromptRule;
impl LintRule for ModelOnNonPromptRule {
    fn name(&self) -> &str {
        "model_on_non_prompt"
    }
    fn apply(&self, pipeline: &CompiledPipeline, _: &Registries) -> Vec<Diagnostic> {
        pipeline
            .tasks
            .iter()
            .filter(|t| !t.block_type.uses_model())
            .filter(|t| t.commands.iter().any(|c| c.command.kind() == CommandKind::Model))
            .map(|t| {
                Diagnostic::warning(
                    self.name(),
                    Some(&t.name),
                    format!(
                        "Task '{}' is a {} block; its MODEL commands have no effect",
                        t.name, t.block_type
                    ),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(pipeline: &CompiledPipeline, registries: &Registries) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(UniqueTaskNamesRule),
        Box::new(UniqueResultParametersRule),
        Box::new(UndefinedParametersRule),
        Box::new(ReservedParameterNamesRule),
        Box::new(OutputsProducedRule),
        Box::new(InputsNotProducedRule),
        Box::new(CircularDependencyRule),
        Box::new(JokerTargetsRule),
        Box::new(KnownFormatRule),
        Box::new(KnownPostprocessRule),
        Box::new(ExpectationBoundsRule),
        Box::new(PersonaDeclaredRule),
        Box::new(ScriptLanguageRule),
        Box::new(PipelineUrlRule),
        Box::new(UnusedInputsRule),
        Box::new(ModelOnNonPromptRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(pipeline, registries));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(
    pipeline: &CompiledPipeline,
    registries: &Registries,
) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(pipeline, registries);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(PromptflowError::PipelineLogic(messages.join("; ")));
    }
    for warning in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
        tracing::warn!(rule = %warning.rule, pipeline = %pipeline.title, "{}", warning.message);
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use promptflow_markdown::{parse_pipeline_source, CommandRegistry};

    fn assemble(source: &str) -> CompiledPipeline {
        let parsed = parse_pipeline_source(source, &CommandRegistry::standard()).unwrap();
        compile_source(parsed).unwrap()
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    #[test]
    fn valid_pipeline_passes() {
        let pipeline = assemble(
            "# T\n\n- INPUT PARAMETER {x}\n- OUTPUT PARAMETER {y}\n\n## A\n\n```\n{x}\n```\n\n-> {y}\n",
        );
        let diags = validate(&pipeline, &Registries::standard());
        assert!(diags.is_empty(), "Expected no diagnostics, got: {diags:?}");
    }

    #[test]
    fn self_dependency_is_circular() {
        let pipeline = assemble("# T\n\n## A\n\n```\n{a}\n```\n\n-> {a}\n");
        let diags = validate(&pipeline, &Registries::standard());
        assert!(
            diags.iter().any(|d| d.rule == "circular_dependency"
                && d.message.contains("circular dependency")),
            "Expected circular_dependency, got: {diags:?}"
        );
    }

    #[test]
    fn duplicate_result_parameters() {
        let pipeline = assemble(
            "# T\n\n## A\n\n```\nx\n```\n\n-> {a}\n\n## B\n\n```\ny\n```\n\n-> {a}\n",
        );
        let diags = validate(&pipeline, &Registries::standard());
        assert!(has(&diags, "unique_result_parameters", Severity::Error), "{diags:?}");
    }

    #[test]
    fn duplicate_task_names() {
        let pipeline = assemble(
            "# T\n\n## Step\n\n```\nx\n```\n\n-> {a}\n\n## step!\n\n```\ny\n```\n\n-> {b}\n",
        );
        let diags = validate(&pipeline, &Registries::standard());
        assert!(has(&diags, "unique_task_names", Severity::Error), "{diags:?}");
    }

    #[test]
    fn joker_problems() {
        let pipeline = assemble(
            "# T\n\n## A\n\n- JOKER A\n- JOKER Missing\n\n```\nx\n```\n\n-> {a}\n\n## B\n\n- JOKER C\n\n```\ny\n```\n\n-> {b}\n\n## C\n\n```\nz\n```\n\n-> {c}\n",
        );
        let diags = validate(&pipeline, &Registries::standard());
        let messages: Vec<_> = diags
            .iter()
            .filter(|d| d.rule == "joker_targets")
            .map(|d| d.message.as_str())
            .collect();
        assert!(messages.iter().any(|m| m.contains("names itself")), "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("unknown joker")), "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("produces {c}")), "{messages:?}");
    }

    #[test]
    fn inputs_and_outputs() {
        let pipeline = assemble(
            "# T\n\n- INPUT PARAMETER {a}\n- INPUT PARAMETER {unused}\n- OUTPUT PARAMETER {never}\n\n## A\n\n```\nx\n```\n\n-> {a}\n",
        );
        let diags = validate(&pipeline, &Registries::standard());
        assert!(has(&diags, "inputs_not_produced", Severity::Error), "{diags:?}");
        assert!(has(&diags, "outputs_produced", Severity::Error), "{diags:?}");
        assert!(has(&diags, "unused_inputs", Severity::Warning), "{diags:?}");
    }

    #[test]
    fn reserved_and_script_and_model_rules() {
        let pipeline = assemble(
            "# T\n\n## A\n\n- BLOCK Script\n- MODEL NAME gpt-4\n\n```\necho hi\n```\n\n-> {knowledge}\n",
        );
        let diags = validate(&pipeline, &Registries::standard());
        assert!(has(&diags, "reserved_parameter_names", Severity::Error), "{diags:?}");
        assert!(has(&diags, "script_language", Severity::Error), "{diags:?}");
        assert!(has(&diags, "model_on_non_prompt", Severity::Warning), "{diags:?}");
    }

    #[test]
    fn unknown_postprocess_and_bad_bounds() {
        let pipeline = assemble(
            "# T\n\n## A\n\n- POSTPROCESS reverse\n- EXPECT min 10 words\n- EXPECT max 2 words\n\n```\nx\n```\n\n-> {a}\n",
        );
        let diags = validate(&pipeline, &Registries::standard());
        assert!(has(&diags, "known_postprocess", Severity::Error), "{diags:?}");
        assert!(has(&diags, "expectation_bounds", Severity::Error), "{diags:?}");
    }

    #[test]
    fn pipeline_call_needs_url() {
        let pipeline = assemble("# T\n\n## A\n\n- BLOCK Pipeline\n\n```\nnot a url\n```\n\n-> {a}\n");
        let diags = validate(&pipeline, &Registries::standard());
        assert!(has(&diags, "pipeline_url", Severity::Error), "{diags:?}");
    }

    #[test]
    fn validate_or_raise_joins_messages() {
        let pipeline = assemble("# T\n\n## A\n\n```\n{p} {q}\n```\n\n-> {a}\n");
        let err = validate_or_raise(&pipeline, &Registries::standard()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("{p}") && message.contains("{q}") && message.contains("; "));
    }
}
