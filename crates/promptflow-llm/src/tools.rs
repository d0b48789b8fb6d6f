use async_trait::async_trait;
use std::sync::Arc;

use promptflow_types::{ModelVariant, PromptflowError, Result};

use crate::{AvailableModel, EmbeddingResult, Prompt, PromptResult, Usage};

// ---------------------------------------------------------------------------
// LlmExecutionTools
// ---------------------------------------------------------------------------

/// Caller-supplied model access. Implementations override the call methods
/// for the variants they support; the rest report an environment mismatch.
#[async_trait]
pub trait LlmExecutionTools: Send + Sync {
    fn title(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn list_models(&self) -> Result<Vec<AvailableModel>>;

    async fn call_chat_model(&self, _prompt: &Prompt) -> Result<PromptResult> {
        Err(unsupported(self.title(), ModelVariant::Chat))
    }

    async fn call_completion_model(&self, _prompt: &Prompt) -> Result<PromptResult> {
        Err(unsupported(self.title(), ModelVariant::Completion))
    }

    async fn call_embedding_model(&self, _prompt: &Prompt) -> Result<EmbeddingResult> {
        Err(unsupported(self.title(), ModelVariant::Embedding))
    }

    /// Dispatch on the prompt's model variant. Embeddings come back as a JSON
    /// array in [`PromptResult::content`].
    async fn execute(&self, prompt: &Prompt) -> Result<PromptResult> {
        match prompt.model_requirements.model_variant {
            ModelVariant::Chat => self.call_chat_model(prompt).await,
            ModelVariant::Completion => self.call_completion_model(prompt).await,
            ModelVariant::Embedding => Ok(self.call_embedding_model(prompt).await?.into_prompt_result()),
        }
    }
}

fn unsupported(title: &str, variant: ModelVariant) -> PromptflowError {
    PromptflowError::EnvironmentMismatch(format!(
        "LLM tools \"{title}\" do not support {variant} models"
    ))
}

// ---------------------------------------------------------------------------
// MultipleLlmTools
// ---------------------------------------------------------------------------

/// Tries each inner tool set in order and returns the first success.
///
/// Routing happens in [`LlmExecutionTools::execute`]. Only environment
/// mismatches and tool errors move on to the next tool; anything else is
/// returned immediately.
pub struct MultipleLlmTools {
    title: String,
    tools: Vec<Arc<dyn LlmExecutionTools>>,
}

impl MultipleLlmTools {
    pub fn new(tools: Vec<Arc<dyn LlmExecutionTools>>) -> Self {
        let title = tools
            .iter()
            .map(|t| t.title().to_string())
            .collect::<Vec<_>>()
            .join(" + ");
        Self { title, tools }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl LlmExecutionTools for MultipleLlmTools {
    fn title(&self) -> &str {
        &self.title
    }

    fn description(&self) -> &str {
        "First tool set that can answer wins"
    }

    async fn list_models(&self) -> Result<Vec<AvailableModel>> {
        let mut models = Vec::new();
        for tools in &self.tools {
            models.extend(tools.list_models().await?);
        }
        Ok(models)
    }

    async fn execute(&self, prompt: &Prompt) -> Result<PromptResult> {
        if self.tools.is_empty() {
            return Err(PromptflowError::EnvironmentMismatch(
                "no LLM execution tools configured".into(),
            ));
        }
        let mut failures = Vec::new();
        let mut retryable = false;
        let mut all_mismatched = true;
        for tools in &self.tools {
            match tools.execute(prompt).await {
                Ok(result) => return Ok(result),
                Err(e @ PromptflowError::EnvironmentMismatch(_)) => {
                    failures.push(format!("{}: {e}", tools.title()));
                }
                Err(e @ PromptflowError::Tool { .. }) => {
                    all_mismatched = false;
                    retryable |= e.is_retryable();
                    tracing::warn!(tools = %tools.title(), error = %e, "LLM tools failed, trying next");
                    failures.push(format!("{}: {e}", tools.title()));
                }
                Err(e) => return Err(e),
            }
        }
        if all_mismatched {
            return Err(PromptflowError::EnvironmentMismatch(failures.join("; ")));
        }
        Err(PromptflowError::Tool {
            tool: self.title.clone(),
            message: failures.join("; "),
            retryable,
        })
    }
}

// ---------------------------------------------------------------------------
// MockedEchoLlmTools
// ---------------------------------------------------------------------------

/// Answers every prompt with its own content. Useful for dry runs.
#[derive(Debug, Clone, Default)]
pub struct MockedEchoLlmTools;

fn rough_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

impl MockedEchoLlmTools {
    fn echo(&self, prompt: &Prompt, model_name: &str) -> PromptResult {
        let tokens = rough_tokens(&prompt.content);
        PromptResult {
            content: prompt.content.clone(),
            model_name: model_name.to_string(),
            usage: Usage::call(tokens, tokens, 0.0),
        }
    }
}

#[async_trait]
impl LlmExecutionTools for MockedEchoLlmTools {
    fn title(&self) -> &str {
        "Mocked echo"
    }

    fn description(&self) -> &str {
        "Echoes the prompt back without calling any model"
    }

    async fn list_models(&self) -> Result<Vec<AvailableModel>> {
        Ok(vec![
            AvailableModel {
                model_name: "mocked-echo".into(),
                model_variant: ModelVariant::Chat,
                title: "Echo chat".into(),
            },
            AvailableModel {
                model_name: "mocked-echo".into(),
                model_variant: ModelVariant::Completion,
                title: "Echo completion".into(),
            },
            AvailableModel {
                model_name: "mocked-embedding".into(),
                model_variant: ModelVariant::Embedding,
                title: "Byte histogram embedding".into(),
            },
        ])
    }

    async fn call_chat_model(&self, prompt: &Prompt) -> Result<PromptResult> {
        Ok(self.echo(prompt, "mocked-echo"))
    }

    async fn call_completion_model(&self, prompt: &Prompt) -> Result<PromptResult> {
        Ok(self.echo(prompt, "mocked-echo"))
    }

    async fn call_embedding_model(&self, prompt: &Prompt) -> Result<EmbeddingResult> {
        let mut vector = vec![0.0f32; 8];
        for byte in prompt.content.bytes() {
            vector[(byte % 8) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(EmbeddingResult {
            vector,
            model_name: "mocked-embedding".into(),
            usage: Usage::call(rough_tokens(&prompt.content), 0, 0.0),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
