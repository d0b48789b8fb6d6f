use serde::{Deserialize, Serialize};
use std::fmt;

use promptflow_types::ModelVariant;

/// One parsed directive from a markdown list item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    PipelineUrl { url: String },
    BookVersion { version: String },
    Block { block_type: BlockType },
    ModelVariant { variant: ModelVariant },
    ModelName { name: String },
    Parameter {
        name: String,
        description: Option<String>,
        direction: ParameterDirection,
    },
    Persona {
        name: String,
        description: Option<String>,
    },
    Knowledge { source: KnowledgeSource },
    Joker { task: String },
    Postprocess { function: String },
    ExpectFormat { format: String },
    ExpectAmount {
        unit: ExpectationUnit,
        comparison: Comparison,
        amount: usize,
    },
    Action { text: String },
    Instrument { text: String },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::PipelineUrl { .. } => CommandKind::PipelineUrl,
            Command::BookVersion { .. } => CommandKind::BookVersion,
            Command::Block { .. } => CommandKind::Block,
            Command::ModelVariant { .. } | Command::ModelName { .. } => CommandKind::Model,
            Command::Parameter { .. } => CommandKind::Parameter,
            Command::Persona { .. } => CommandKind::Persona,
            Command::Knowledge { .. } => CommandKind::Knowledge,
            Command::Joker { .. } => CommandKind::Joker,
            Command::Postprocess { .. } => CommandKind::Postprocess,
            Command::ExpectFormat { .. } => CommandKind::ExpectFormat,
            Command::ExpectAmount { .. } => CommandKind::ExpectAmount,
            Command::Action { .. } => CommandKind::Action,
            Command::Instrument { .. } => CommandKind::Instrument,
        }
    }
}

/// Tag of a [`Command`], used for registry lookups and placement rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    PipelineUrl,
    BookVersion,
    Block,
    Model,
    Parameter,
    Persona,
    Knowledge,
    Joker,
    Postprocess,
    ExpectFormat,
    ExpectAmount,
    Action,
    Instrument,
}

impl CommandKind {
    /// Whether the command may appear before the first section.
    pub fn allowed_in_head(&self) -> bool {
        !matches!(
            self,
            CommandKind::Block
                | CommandKind::Joker
                | CommandKind::Postprocess
                | CommandKind::ExpectFormat
                | CommandKind::ExpectAmount
        )
    }

    /// Whether the command may appear inside a section.
    pub fn allowed_in_task(&self) -> bool {
        !matches!(self, CommandKind::PipelineUrl | CommandKind::BookVersion)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::PipelineUrl => "PIPELINE URL",
            CommandKind::BookVersion => "BOOK VERSION",
            CommandKind::Block => "BLOCK",
            CommandKind::Model => "MODEL",
            CommandKind::Parameter => "PARAMETER",
            CommandKind::Persona => "PERSONA",
            CommandKind::Knowledge => "KNOWLEDGE",
            CommandKind::Joker => "JOKER",
            CommandKind::Postprocess => "POSTPROCESS",
            CommandKind::ExpectFormat => "FORMAT",
            CommandKind::ExpectAmount => "EXPECT",
            CommandKind::Action => "ACTION",
            CommandKind::Instrument => "INSTRUMENT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockType {
    #[default]
    PromptTemplate,
    SimpleTemplate,
    Script,
    PromptDialog,
    Pipeline,
}

impl BlockType {
    /// Case-insensitive lookup; accepts the words with or without a separator.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "PROMPTTEMPLATE" | "PROMPT" => Some(BlockType::PromptTemplate),
            "SIMPLETEMPLATE" | "SIMPLE" => Some(BlockType::SimpleTemplate),
            "SCRIPT" => Some(BlockType::Script),
            "PROMPTDIALOG" | "DIALOG" => Some(BlockType::PromptDialog),
            "PIPELINE" | "PIPELINECALL" => Some(BlockType::Pipeline),
            _ => None,
        }
    }

    /// Whether tasks of this type call an LLM.
    pub fn uses_model(&self) -> bool {
        matches!(self, BlockType::PromptTemplate)
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::PromptTemplate => "Prompt template",
            BlockType::SimpleTemplate => "Simple template",
            BlockType::Script => "Script",
            BlockType::PromptDialog => "Prompt dialog",
            BlockType::Pipeline => "Pipeline",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterDirection {
    Input,
    Output,
    Intermediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KnowledgeSource {
    Url(String),
    File(String),
    Inline(String),
}

impl KnowledgeSource {
    /// Classify a raw KNOWLEDGE payload.
    pub fn classify(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return KnowledgeSource::Url(raw.to_string());
        }
        let single_token = !raw.contains(char::is_whitespace);
        let looks_like_path = raw.starts_with("./")
            || raw.starts_with("../")
            || raw.starts_with('/')
            || [".md", ".txt", ".pdf", ".docx", ".json", ".csv"]
                .iter()
                .any(|ext| raw.to_ascii_lowercase().ends_with(ext));
        if single_token && looks_like_path {
            KnowledgeSource::File(raw.to_string())
        } else {
            KnowledgeSource::Inline(raw.to_string())
        }
    }
}

/// Measured quantity of an expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectationUnit {
    Characters,
    Words,
    Sentences,
    Lines,
    Paragraphs,
    Pages,
}

impl ExpectationUnit {
    pub const ALL: [ExpectationUnit; 6] = [
        ExpectationUnit::Characters,
        ExpectationUnit::Words,
        ExpectationUnit::Sentences,
        ExpectationUnit::Lines,
        ExpectationUnit::Paragraphs,
        ExpectationUnit::Pages,
    ];

    /// Case-insensitive lookup accepting singular, plural and a few short forms.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "character" | "characters" | "char" | "chars" => Some(ExpectationUnit::Characters),
            "word" | "words" => Some(ExpectationUnit::Words),
            "sentence" | "sentences" => Some(ExpectationUnit::Sentences),
            "line" | "lines" => Some(ExpectationUnit::Lines),
            "paragraph" | "paragraphs" => Some(ExpectationUnit::Paragraphs),
            "page" | "pages" => Some(ExpectationUnit::Pages),
            _ => None,
        }
    }
}

impl fmt::Display for ExpectationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExpectationUnit::Characters => "characters",
            ExpectationUnit::Words => "words",
            ExpectationUnit::Sentences => "sentences",
            ExpectationUnit::Lines => "lines",
            ExpectationUnit::Paragraphs => "paragraphs",
            ExpectationUnit::Pages => "pages",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Minimum,
    Maximum,
    Exactly,
}
