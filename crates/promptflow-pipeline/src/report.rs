//! Execution report: one record per attempt, in completion order.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use promptflow_llm::Usage;
use promptflow_types::{ErrorKind, Parameters, PromptflowError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PromptflowError> for AttemptError {
    fn from(error: &PromptflowError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// One attempt of one candidate of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Primary task the attempt belongs to.
    pub task: String,
    /// Task whose template was tried.
    pub candidate: String,
    pub is_joker: bool,
    /// 1-based, per candidate.
    pub attempt: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_result: Option<String>,
    /// Published value; set on success only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_url: Option<String>,
    pub title: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub records: Vec<AttemptRecord>,
    /// Total of every attempt, failed ones and nested runs included.
    pub usage: Usage,
}

impl ExecutionReport {
    pub fn new(pipeline_url: Option<String>, title: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            pipeline_url,
            title: title.into(),
            started_at: Utc::now(),
            completed_at: None,
            records: Vec::new(),
            usage: Usage::ZERO,
        }
    }

    pub fn push(&mut self, record: AttemptRecord) {
        self.usage += record.usage;
        self.records.push(record);
    }

    /// Records of one primary task, in order.
    pub fn records_for<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a AttemptRecord> {
        self.records.iter().filter(move |r| r.task == task)
    }

    pub fn failed_attempts(&self) -> usize {
        self.records.iter().filter(|r| !r.is_success()).count()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Execution report: {}\n", self.title);
        let _ = writeln!(out, "- Run: `{}`", self.run_id);
        if let Some(url) = &self.pipeline_url {
            let _ = writeln!(out, "- Pipeline: {url}");
        }
        let _ = writeln!(out, "- Started: {}", self.started_at.to_rfc3339());
        if let Some(completed) = self.completed_at {
            let duration = completed - self.started_at;
            let _ = writeln!(
                out,
                "- Completed: {} ({} ms)",
                completed.to_rfc3339(),
                duration.num_milliseconds()
            );
        }
        let _ = writeln!(
            out,
            "- Usage: {} calls, {} input tokens, {} output tokens, ${:.4}",
            self.usage.calls, self.usage.input_tokens, self.usage.output_tokens, self.usage.price_usd
        );

        for record in &self.records {
            let status = if record.is_success() { "ok" } else { "failed" };
            let _ = write!(out, "\n## {} #{} ({status})", record.task, record.attempt);
            if record.is_joker {
                let _ = write!(out, " via joker {}", record.candidate);
            }
            out.push_str("\n\n");
            if let Some(prompt) = &record.prompt {
                let _ = writeln!(out, "### Prompt\n\n```\n{prompt}\n```\n");
            }
            if let Some(raw) = &record.raw_result {
                let _ = writeln!(out, "### Raw result\n\n```\n{raw}\n```\n");
            }
            if let Some(result) = &record.result {
                if record.raw_result.as_ref() != Some(result) {
                    let _ = writeln!(out, "### Result\n\n```\n{result}\n```\n");
                }
            }
            if let Some(error) = &record.error {
                let _ = writeln!(out, "> {}: {}\n", error.kind, error.message);
            }
        }
        out
    }
}

/// What [`run`](crate::engine::run) returns on success.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub report: ExecutionReport,
    /// Declared output parameters and their values.
    pub output_parameters: BTreeMap<String, String>,
    /// Every parameter of the run: inputs, intermediates and outputs.
    pub parameters: Parameters,
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task: &str, candidate: &str, error: Option<PromptflowError>, usage: Usage) -> AttemptRecord {
        let now = Utc::now();
        AttemptRecord {
            task: task.into(),
            candidate: candidate.into(),
            is_joker: task != candidate,
            attempt: 1,
            prompt: Some("Write about cats".into()),
            raw_result: Some("Cats.".into()),
            result: error.is_none().then(|| "Cats.".to_string()),
            error: error.as_ref().map(AttemptError::from),
            usage,
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn push_accumulates_usage_of_failures_too() {
        let mut report = ExecutionReport::new(None, "Test");
        let expect = PromptflowError::Expect {
            task: "a".into(),
            message: "too short".into(),
        };
        report.push(record("a", "a", Some(expect), Usage::call(3, 2, 0.01)));
        report.push(record("a", "b", None, Usage::call(4, 4, 0.02)));
        assert_eq!(report.usage.calls, 2);
        assert_eq!(report.usage.total_tokens(), 13);
        assert_eq!(report.failed_attempts(), 1);
        assert_eq!(report.records_for("a").count(), 2);
    }

    #[test]
    fn markdown_lists_attempts() {
        let mut report = ExecutionReport::new(Some("https://x.com/p".into()), "Test");
        let expect = PromptflowError::Expect {
            task: "a".into(),
            message: "too short".into(),
        };
        report.push(record("a", "a", Some(expect), Usage::ZERO));
        report.push(record("a", "b", None, Usage::ZERO));
        report.completed_at = Some(Utc::now());

        let md = report.to_markdown();
        assert!(md.starts_with("# Execution report: Test"));
        assert!(md.contains("- Pipeline: https://x.com/p"));
        assert!(md.contains("## a #1 (failed)"));
        assert!(md.contains("## a #1 (ok) via joker b"));
        assert!(md.contains("> ExpectError:"));
    }
}
