//! The compiled pipeline value.
//!
//! A [`CompiledPipeline`] is plain data: tasks and parameters reference each
//! other by name, never by pointer. It is never mutated after compilation;
//! preparation and unpreparation build new values.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use promptflow_llm::ModelRequirements;
use promptflow_markdown::{BlockType, KnowledgeSource, ParsedCommand};

use crate::expectations::Expectations;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_input: bool,
    #[serde(default)]
    pub is_output: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Filled by preparation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_requirements: Option<ModelRequirements>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeSourceDeclaration {
    pub name: String,
    pub source: KnowledgeSource,
}

/// One chunk of knowledge, produced by preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgePiece {
    /// Name of the [`KnowledgeSourceDeclaration`] it came from.
    pub source: String,
    pub index: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preparation {
    pub id: String,
    pub promptflow_version: String,
    pub persona_count: usize,
    pub knowledge_piece_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Slug of the section title; unique within the pipeline.
    pub name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub block_type: BlockType,
    /// Template with `{parameter}` placeholders.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    pub result_parameter: String,
    pub dependent_parameters: BTreeSet<String>,
    #[serde(default)]
    pub model_requirements: ModelRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    /// Names of attached knowledge sources.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge: Vec<String>,
    #[serde(default, skip_serializing_if = "Expectations::is_empty")]
    pub expectations: Expectations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postprocessing: Vec<String>,
    /// Fallback task names, tried in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jokers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instruments: Vec<String>,
    /// The commands the task was compiled from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<ParsedCommand>,
    /// Template with persona and knowledge folded in. Filled by preparation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepared_content: Option<String>,
}

impl Task {
    /// URL named on the first content line of a pipeline-call task.
    pub fn called_pipeline_url(&self) -> Option<&str> {
        if self.block_type != BlockType::Pipeline {
            return None;
        }
        self.content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPipeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_version: Option<String>,
    pub parameters: Vec<ParameterDeclaration>,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub personas: Vec<PersonaDeclaration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge_sources: Vec<KnowledgeSourceDeclaration>,
    /// Filled by preparation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge_pieces: Vec<KnowledgePiece>,
    /// Filled by preparation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preparations: Vec<Preparation>,
}

impl CompiledPipeline {
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDeclaration> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn persona(&self, name: &str) -> Option<&PersonaDeclaration> {
        self.personas.iter().find(|p| p.name == name)
    }

    pub fn knowledge_source(&self, name: &str) -> Option<&KnowledgeSourceDeclaration> {
        self.knowledge_sources.iter().find(|k| k.name == name)
    }

    pub fn input_parameters(&self) -> impl Iterator<Item = &ParameterDeclaration> {
        self.parameters.iter().filter(|p| p.is_input)
    }

    pub fn output_parameters(&self) -> impl Iterator<Item = &ParameterDeclaration> {
        self.parameters.iter().filter(|p| p.is_output)
    }

    /// Tasks named by some `JOKER`; they only run as fallbacks.
    pub fn joker_targets(&self) -> BTreeSet<&str> {
        self.tasks
            .iter()
            .flat_map(|t| t.jokers.iter().map(String::as_str))
            .collect()
    }

    /// Tasks the scheduler runs on their own, in source order.
    pub fn primary_tasks(&self) -> impl Iterator<Item = &Task> {
        let targets = self.joker_targets();
        self.tasks
            .iter()
            .filter(move |t| !targets.contains(t.name.as_str()))
    }

    /// Parameters a primary task waits for: its own plus those of its jokers.
    pub fn scheduling_dependencies(&self, task: &Task) -> BTreeSet<String> {
        let mut deps = task.dependent_parameters.clone();
        for joker in &task.jokers {
            if let Some(fallback) = self.task(joker) {
                deps.extend(fallback.dependent_parameters.iter().cloned());
            }
        }
        deps
    }

    /// Name by which the pipeline can be looked up besides its URL: the
    /// last URL path segment without extensions.
    pub fn url_stem(&self) -> Option<&str> {
        let url = self.url.as_deref()?;
        let segment = url.trim_end_matches('/').rsplit('/').next()?;
        let stem = segment.split('.').next()?;
        (!stem.is_empty()).then_some(stem)
    }
}
