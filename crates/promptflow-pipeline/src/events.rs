//! Execution events for observability.
//!
//! Emits [`ExecutionEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (loggers, progress bars, UIs) can follow a run without coupling
//! to the executor.

use serde::{Deserialize, Serialize};

/// Per-task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    ResolvingParameters,
    BuildingPrompt,
    AwaitingToolResult,
    Validating,
    Postprocessing,
    Done,
    Retrying,
    FallingBackToJoker,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: String,
        title: String,
        task_count: usize,
    },
    RunCompleted {
        run_id: String,
        title: String,
        duration_ms: u64,
    },
    RunFailed {
        run_id: String,
        title: String,
        error: String,
    },
    RunCancelled {
        run_id: String,
        title: String,
    },
    TaskStateChanged {
        task: String,
        /// Task whose template is being tried; differs from `task` for jokers.
        candidate: String,
        state: TaskState,
    },
    AttemptFailed {
        task: String,
        candidate: String,
        attempt: usize,
        error: String,
    },
    JokerFallback {
        task: String,
        from: String,
        to: String,
    },
    ParameterPublished {
        name: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Dropped silently when nobody listens.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
