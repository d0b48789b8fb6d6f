//! Markdown source → [`CompiledPipeline`].
//!
//! Compilation is synchronous and all-or-nothing: either a validated
//! pipeline comes back or the first structural error does.

use std::collections::BTreeSet;

use promptflow_llm::ModelRequirements;
use promptflow_markdown::{
    parse_pipeline_source, BlockType, Command, KnowledgeSource, ParameterDirection, ParsedCommand,
    PipelineSource, SourceSection,
};
use promptflow_types::{PromptflowError, Result};

use crate::expectations::{merge_expectation, Expectations};
use crate::pipeline::{
    CompiledPipeline, KnowledgeSourceDeclaration, ParameterDeclaration, PersonaDeclaration, Task,
};
use crate::prepare::prepare_pipeline;
use crate::registries::Registries;
use crate::template::{extract_parameters, is_reserved};
use crate::validation::validate_or_raise;

/// Parse, assemble and validate `source`.
pub fn compile_pipeline(source: &str, registries: &Registries) -> Result<CompiledPipeline> {
    let parsed = parse_pipeline_source(source, &registries.commands)?;
    let pipeline = compile_source(parsed)?;
    validate_or_raise(&pipeline, registries)?;
    tracing::info!(
        title = %pipeline.title,
        url = pipeline.url.as_deref().unwrap_or("-"),
        tasks = pipeline.tasks.len(),
        "Pipeline compiled"
    );
    Ok(pipeline)
}

/// [`compile_pipeline`] followed by [`prepare_pipeline`].
pub fn compile_pipeline_prepared(source: &str, registries: &Registries) -> Result<CompiledPipeline> {
    Ok(prepare_pipeline(&compile_pipeline(source, registries)?))
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

fn misplaced(command: &ParsedCommand, place: &str) -> PromptflowError {
    PromptflowError::PipelineLogic(format!(
        "{} command is not allowed in {place} (line {}: \"{}\")",
        command.command.kind(),
        command.line,
        command.raw
    ))
}

/// Head-level commands that act as defaults for prompt tasks.
#[derive(Default)]
struct HeadDefaults {
    model: ModelRequirements,
    persona: Option<String>,
    knowledge: Vec<String>,
    actions: Vec<String>,
    instruments: Vec<String>,
}

#[derive(Default)]
struct Declarations {
    parameters: Vec<ParameterDeclaration>,
    personas: Vec<PersonaDeclaration>,
    knowledge_sources: Vec<KnowledgeSourceDeclaration>,
}

impl Declarations {
    fn parameter(&mut self, name: &str, description: Option<&str>, direction: ParameterDirection) {
        let index = match self.parameters.iter().position(|p| p.name == name) {
            Some(index) => index,
            None => {
                self.parameters.push(ParameterDeclaration {
                    name: name.to_string(),
                    description: None,
                    is_input: false,
                    is_output: false,
                });
                self.parameters.len() - 1
            }
        };
        let declaration = &mut self.parameters[index];
        if declaration.description.is_none() {
            declaration.description = description.map(String::from);
        }
        match direction {
            ParameterDirection::Input => declaration.is_input = true,
            ParameterDirection::Output => declaration.is_output = true,
            ParameterDirection::Intermediate => {}
        }
    }

    fn persona(&mut self, name: &str, description: Option<&str>) -> String {
        match self.personas.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                if existing.description.is_none() {
                    existing.description = description.map(String::from);
                }
            }
            None => self.personas.push(PersonaDeclaration {
                name: name.to_string(),
                description: description.map(String::from),
                model_requirements: None,
            }),
        }
        name.to_string()
    }

    fn knowledge(&mut self, source: &KnowledgeSource) -> String {
        if let Some(existing) = self.knowledge_sources.iter().find(|k| &k.source == source) {
            return existing.name.clone();
        }
        let name = format!("knowledge-{}", self.knowledge_sources.len() + 1);
        self.knowledge_sources.push(KnowledgeSourceDeclaration {
            name: name.clone(),
            source: source.clone(),
        });
        name
    }
}

fn push_unique(target: &mut Vec<String>, value: String) {
    if !target.contains(&value) {
        target.push(value);
    }
}

/// Assemble a parsed source into a pipeline without running the lint rules.
pub fn compile_source(source: PipelineSource) -> Result<CompiledPipeline> {
    let mut declarations = Declarations::default();
    let mut defaults = HeadDefaults::default();
    let mut url = None;
    let mut book_version = None;

    for parsed in &source.head {
        if !parsed.command.kind().allowed_in_head() {
            return Err(misplaced(parsed, "the pipeline head"));
        }
        match &parsed.command {
            Command::PipelineUrl { url: value } => {
                if url.replace(value.trim().to_string()).is_some() {
                    return Err(PromptflowError::PipelineLogic(
                        "Pipeline URL is declared more than once".into(),
                    ));
                }
            }
            Command::BookVersion { version } => {
                if book_version.replace(version.clone()).is_some() {
                    return Err(PromptflowError::PipelineLogic(
                        "Book version is declared more than once".into(),
                    ));
                }
            }
            Command::ModelVariant { variant } => defaults.model.model_variant = *variant,
            Command::ModelName { name } => defaults.model.model_name = Some(name.clone()),
            Command::Parameter {
                name,
                description,
                direction,
            } => declarations.parameter(name, description.as_deref(), *direction),
            Command::Persona { name, description } => {
                if defaults.persona.is_some() {
                    return Err(PromptflowError::PipelineLogic(
                        "The pipeline head declares more than one persona".into(),
                    ));
                }
                defaults.persona = Some(declarations.persona(name, description.as_deref()));
            }
            Command::Knowledge { source } => {
                let name = declarations.knowledge(source);
                push_unique(&mut defaults.knowledge, name);
            }
            Command::Action { text } => defaults.actions.push(text.clone()),
            Command::Instrument { text } => defaults.instruments.push(text.clone()),
            _ => {}
        }
    }

    let mut tasks = Vec::with_capacity(source.sections.len());
    let mut result_parameters = Vec::with_capacity(source.sections.len());
    for section in source.sections {
        let (task, result_parameter) = compile_section(section, &defaults, &mut declarations)?;
        tasks.push(task);
        result_parameters.push(result_parameter);
    }

    // Joker targets without their own `-> {name}` publish under the primary's.
    for index in 0..tasks.len() {
        let Some(primary_result) = result_parameters[index].clone() else {
            continue;
        };
        for joker in tasks[index].jokers.clone() {
            if let Some(target) = tasks.iter().position(|t| t.name == joker) {
                if result_parameters[target].is_none() {
                    result_parameters[target] = Some(primary_result.clone());
                }
            }
        }
    }

    for (task, result_parameter) in tasks.iter_mut().zip(result_parameters) {
        task.result_parameter = result_parameter.ok_or_else(|| {
            PromptflowError::PipelineLogic(format!(
                "Task \"{}\" has no result parameter (`-> {{name}}`)",
                task.title
            ))
        })?;
        declarations.parameter(&task.result_parameter, None, ParameterDirection::Intermediate);
    }

    Ok(CompiledPipeline {
        url,
        title: source.title,
        description: source.description,
        book_version,
        parameters: declarations.parameters,
        tasks,
        personas: declarations.personas,
        knowledge_sources: declarations.knowledge_sources,
        knowledge_pieces: Vec::new(),
        preparations: Vec::new(),
    })
}

fn compile_section(
    section: SourceSection,
    defaults: &HeadDefaults,
    declarations: &mut Declarations,
) -> Result<(Task, Option<String>)> {
    let place = format!("task \"{}\"", section.title);
    let mut block_type = None;
    let mut model = defaults.model.clone();
    let mut persona = None;
    let mut knowledge = Vec::new();
    let mut expectations = Expectations::new();
    let mut format: Option<String> = None;
    let mut postprocessing = Vec::new();
    let mut jokers = Vec::new();
    let mut actions = Vec::new();
    let mut instruments = Vec::new();

    for parsed in &section.commands {
        if !parsed.command.kind().allowed_in_task() {
            return Err(misplaced(parsed, &place));
        }
        match &parsed.command {
            Command::Block { block_type: value } => {
                if block_type.replace(*value).is_some() {
                    return Err(PromptflowError::PipelineLogic(format!(
                        "Task \"{}\" declares more than one BLOCK",
                        section.title
                    )));
                }
            }
            Command::ModelVariant { variant } => model.model_variant = *variant,
            Command::ModelName { name } => model.model_name = Some(name.clone()),
            Command::Parameter {
                name,
                description,
                direction,
            } => declarations.parameter(name, description.as_deref(), *direction),
            Command::Persona { name, description } => {
                if persona.is_some() {
                    return Err(PromptflowError::PipelineLogic(format!(
                        "Task \"{}\" has more than one persona",
                        section.title
                    )));
                }
                persona = Some(declarations.persona(name, description.as_deref()));
            }
            Command::Knowledge { source } => {
                let name = declarations.knowledge(source);
                push_unique(&mut knowledge, name);
            }
            Command::Joker { task } => push_unique(&mut jokers, task.clone()),
            Command::Postprocess { function } => postprocessing.push(function.clone()),
            Command::ExpectFormat { format: tag } => {
                if format.replace(tag.clone()).is_some() {
                    return Err(PromptflowError::PipelineLogic(format!(
                        "Task \"{}\" expects more than one format",
                        section.title
                    )));
                }
            }
            Command::ExpectAmount {
                unit,
                comparison,
                amount,
            } => merge_expectation(&mut expectations, *unit, *comparison, *amount),
            Command::Action { text } => actions.push(text.clone()),
            Command::Instrument { text } => instruments.push(text.clone()),
            _ => {}
        }
    }

    let block_type = block_type.unwrap_or_default();
    if block_type == BlockType::PromptTemplate {
        persona = persona.or_else(|| defaults.persona.clone());
        let mut merged = defaults.knowledge.clone();
        for name in knowledge {
            push_unique(&mut merged, name);
        }
        knowledge = merged;
        actions = defaults.actions.iter().cloned().chain(actions).collect();
        instruments = defaults.instruments.iter().cloned().chain(instruments).collect();
    }

    let content = section.content.ok_or_else(|| {
        PromptflowError::PipelineLogic(format!(
            "Task \"{}\" has no content code block",
            section.title
        ))
    })?;
    let dependent_parameters: BTreeSet<String> = extract_parameters(&content)
        .into_iter()
        .filter(|p| !is_reserved(p))
        .collect();

    let task = Task {
        name: section.name,
        title: section.title,
        description: section.description,
        block_type,
        content,
        content_language: section.content_language,
        result_parameter: String::new(),
        dependent_parameters,
        model_requirements: model,
        persona,
        knowledge,
        expectations,
        format,
        postprocessing,
        jokers,
        actions,
        instruments,
        commands: section.commands,
        prepared_content: None,
    };
    Ok((task, section.result_parameter))
}
