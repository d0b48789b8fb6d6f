//! Shared types and errors for the promptflow pipeline engine.
//!
//! This crate provides the foundational types used across all other promptflow crates:
//! - `PromptflowError`: unified error taxonomy, tagged by [`ErrorKind`]
//! - `Parameters`: append-only parameter map shared by the tasks of one run
//! - `ModelVariant`: chat, completion or embedding model call

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unified error type for all promptflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PromptflowError {
    // === Compile-time Errors ===
    #[error("Parsing error{}: {message}", .line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    Parsing {
        message: String,
        line: Option<usize>,
        snippet: Option<String>,
    },

    #[error("Pipeline logic error: {0}")]
    PipelineLogic(String),

    #[error("Reference error: {0}")]
    Reference(String),

    #[error("Collection error: {0}")]
    Collection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Run-time Errors ===
    #[error("Template error in task '{task}': {message}")]
    Template { task: String, message: String },

    #[error("Expectation failed in task '{task}': {message}")]
    Expect { task: String, message: String },

    #[error("Pipeline execution failed in task '{task}': {message}")]
    PipelineExecution { task: String, message: String },

    #[error("Environment mismatch: {0}")]
    EnvironmentMismatch(String),

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Execution cancelled")]
    Cancelled,

    // === Tool Errors ===
    #[error("Tool '{tool}' error: {message}")]
    Tool {
        tool: String,
        message: String,
        retryable: bool,
    },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed set of error kinds, one per [`PromptflowError`] family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parsing,
    PipelineLogic,
    Reference,
    Collection,
    NotFound,
    Template,
    Expect,
    PipelineExecution,
    EnvironmentMismatch,
    LimitReached,
    Unexpected,
    Cancelled,
    Tool,
    Timeout,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Parsing => "ParsingError",
            ErrorKind::PipelineLogic => "PipelineLogicError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Collection => "CollectionError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Template => "TemplateError",
            ErrorKind::Expect => "ExpectError",
            ErrorKind::PipelineExecution => "PipelineExecutionError",
            ErrorKind::EnvironmentMismatch => "EnvironmentMismatchError",
            ErrorKind::LimitReached => "LimitReachedError",
            ErrorKind::Unexpected => "UnexpectedError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Tool => "ToolError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

impl PromptflowError {
    /// Shorthand for a parsing error without position information.
    pub fn parsing(message: impl Into<String>) -> Self {
        PromptflowError::Parsing {
            message: message.into(),
            line: None,
            snippet: None,
        }
    }

    /// The kind tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PromptflowError::Parsing { .. } => ErrorKind::Parsing,
            PromptflowError::PipelineLogic(_) => ErrorKind::PipelineLogic,
            PromptflowError::Reference(_) => ErrorKind::Reference,
            PromptflowError::Collection(_) => ErrorKind::Collection,
            PromptflowError::NotFound(_) => ErrorKind::NotFound,
            PromptflowError::Template { .. } => ErrorKind::Template,
            PromptflowError::Expect { .. } => ErrorKind::Expect,
            PromptflowError::PipelineExecution { .. } => ErrorKind::PipelineExecution,
            PromptflowError::EnvironmentMismatch(_) => ErrorKind::EnvironmentMismatch,
            PromptflowError::LimitReached(_) => ErrorKind::LimitReached,
            PromptflowError::Unexpected(_) => ErrorKind::Unexpected,
            PromptflowError::Cancelled => ErrorKind::Cancelled,
            PromptflowError::Tool { .. } => ErrorKind::Tool,
            PromptflowError::Timeout { .. } => ErrorKind::Timeout,
            PromptflowError::Io(_) | PromptflowError::Json(_) => ErrorKind::Io,
        }
    }

    /// Returns `true` for errors raised while parsing, compiling or building
    /// a collection. These never occur once a run has started.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Parsing | ErrorKind::PipelineLogic | ErrorKind::Reference | ErrorKind::Collection
        )
    }

    /// Returns `true` if the error is a failed attempt that the retry and
    /// joker machinery may recover from.
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            PromptflowError::Expect { .. }
                | PromptflowError::Timeout { .. }
                | PromptflowError::Tool { retryable: true, .. }
        )
    }

    /// Returns `true` if the error is transient and the same call may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PromptflowError::Timeout { .. } | PromptflowError::Tool { retryable: true, .. }
        )
    }
}

/// A convenience alias for `Result<T, PromptflowError>`.
pub type Result<T> = std::result::Result<T, PromptflowError>;

// ---------------------------------------------------------------------------
// Parameters: append-only map of published parameter values
// ---------------------------------------------------------------------------

/// Parameter values of one run.
///
/// Keys are published once and never overwritten. Readers work on a
/// cloned snapshot; the run scheduler is the single writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    values: BTreeMap<String, String>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new value. Publishing an existing key is an invariant
    /// violation and returns `Unexpected`.
    pub fn publish(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.values.contains_key(&name) {
            return Err(PromptflowError::Unexpected(format!(
                "parameter {{{name}}} is already published"
            )));
        }
        tracing::trace!(parameter = %name, "Parameter published");
        self.values.insert(name, value.into());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of the subset of parameters named in `names`.
    pub fn select<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Parameters {
        let values = names
            .into_iter()
            .filter_map(|n| self.values.get(n).map(|v| (n.to_string(), v.clone())))
            .collect();
        Parameters { values }
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.values
    }
}

impl FromIterator<(String, String)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Parameters {
            values: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelVariant: which kind of model call a prompt task makes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelVariant {
    #[default]
    Chat,
    Completion,
    Embedding,
}

impl ModelVariant {
    /// Case-insensitive lookup by name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "CHAT" => Some(ModelVariant::Chat),
            "COMPLETION" => Some(ModelVariant::Completion),
            "EMBEDDING" => Some(ModelVariant::Embedding),
            _ => None,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::Chat => f.write_str("CHAT"),
            ModelVariant::Completion => f.write_str("COMPLETION"),
            ModelVariant::Embedding => f.write_str("EMBEDDING"),
        }
    }
}
