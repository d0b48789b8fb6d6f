//! User interface tools for `Prompt dialog` tasks.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use promptflow_types::{PromptflowError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogRequest {
    pub task: String,
    pub title: String,
    /// The resolved task content.
    pub question: String,
    pub default_value: Option<String>,
    pub placeholder: Option<String>,
}

#[async_trait]
pub trait UserInterfaceTools: Send + Sync {
    async fn ask(&self, request: &DialogRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// AutoAnswerDialog
// ---------------------------------------------------------------------------

/// Answers with the default value, or an empty string.
pub struct AutoAnswerDialog;

#[async_trait]
impl UserInterfaceTools for AutoAnswerDialog {
    async fn ask(&self, request: &DialogRequest) -> Result<String> {
        Ok(request.default_value.clone().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// ConsoleDialog
// ---------------------------------------------------------------------------

/// Asks on stdout and reads one line from stdin. An empty line takes the default.
pub struct ConsoleDialog;

#[async_trait]
impl UserInterfaceTools for ConsoleDialog {
    async fn ask(&self, request: &DialogRequest) -> Result<String> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut stdout = std::io::stdout();
            writeln!(stdout, "\n{}\n\n{}", request.title, request.question)?;
            if let Some(placeholder) = &request.placeholder {
                write!(stdout, "({placeholder}) ")?;
            }
            write!(stdout, "> ")?;
            stdout.flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            let answer = input.trim_end_matches(['\r', '\n']).to_string();
            Ok(match request.default_value {
                Some(default) if answer.trim().is_empty() => default,
                _ => answer,
            })
        })
        .await
        .map_err(|e| PromptflowError::Unexpected(format!("console dialog task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// ScriptedDialog
// ---------------------------------------------------------------------------

/// Plays back queued answers and records every request. Falls back to the
/// default value once the queue is empty.
pub struct ScriptedDialog {
    answers: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<DialogRequest>>,
}

impl ScriptedDialog {
    pub fn new(answers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DialogRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl UserInterfaceTools for ScriptedDialog {
    async fn ask(&self, request: &DialogRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let answer = self
            .answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(answer
            .or_else(|| request.default_value.clone())
            .unwrap_or_default())
    }
}
