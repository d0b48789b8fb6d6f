use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

use promptflow_types::ModelVariant;

// ---------------------------------------------------------------------------
// Role / ChatMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ModelRequirements
// ---------------------------------------------------------------------------

/// What a prompt needs from the model that answers it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelRequirements {
    pub model_variant: ModelVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ModelRequirements {
    pub fn variant(model_variant: ModelVariant) -> Self {
        Self {
            model_variant,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// A fully resolved prompt, ready for a model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub title: String,
    /// Template with every placeholder substituted.
    pub content: String,
    /// Parameter values the content was resolved from.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub model_requirements: ModelRequirements,
    /// Expected output format tag, if the task declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Prompt {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            parameters: BTreeMap::new(),
            model_requirements: ModelRequirements::default(),
            format: None,
        }
    }

    pub fn with_requirements(mut self, requirements: ModelRequirements) -> Self {
        self.model_requirements = requirements;
        self
    }

    /// Messages for a chat model: optional system message, then the content.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.model_requirements.system_message {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(self.content.clone()));
        messages
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Token and price accounting of one or more calls.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub price_usd: f64,
    pub calls: u64,
}

impl Usage {
    pub const ZERO: Usage = Usage {
        input_tokens: 0,
        output_tokens: 0,
        price_usd: 0.0,
        calls: 0,
    };

    /// Usage of a single call.
    pub fn call(input_tokens: u64, output_tokens: u64, price_usd: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            price_usd,
            calls: 1,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            price_usd: self.price_usd + rhs.price_usd,
            calls: self.calls + rhs.calls,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Usage {
        iter.fold(Usage::ZERO, Add::add)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResult {
    pub content: String,
    pub model_name: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub model_name: String,
    pub usage: Usage,
}

impl EmbeddingResult {
    /// Text form of the embedding: the vector as a JSON array.
    pub fn into_prompt_result(self) -> PromptResult {
        let content = serde_json::to_string(&self.vector).unwrap_or_else(|_| "[]".to_string());
        PromptResult {
            content,
            model_name: self.model_name,
            usage: self.usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModel {
    pub model_name: String,
    pub model_variant: ModelVariant,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_sums_across_calls() {
        let total: Usage = [
            Usage::call(10, 5, 0.01),
            Usage::call(3, 2, 0.02),
            Usage::ZERO,
        ]
        .into_iter()
        .sum();
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.calls, 2);
        assert_eq!(total.total_tokens(), 20);
        assert!((total.price_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn chat_messages_include_system() {
        let prompt = Prompt::new("t", "Hello").with_requirements(ModelRequirements {
            system_message: Some("You are Jane".into()),
            ..ModelRequirements::default()
        });
        let messages = prompt.chat_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ChatMessage::system("You are Jane"));
        assert_eq!(messages[1], ChatMessage::user("Hello"));
    }

    #[test]
    fn embedding_renders_as_json_array() {
        let result = EmbeddingResult {
            vector: vec![0.5, -1.0],
            model_name: "e".into(),
            usage: Usage::ZERO,
        }
        .into_prompt_result();
        assert_eq!(result.content, "[0.5,-1.0]");
    }

    #[test]
    fn requirements_serde_defaults() {
        let req: ModelRequirements = serde_json::from_str(r#"{"model_variant":"COMPLETION"}"#).unwrap();
        assert_eq!(req.model_variant, ModelVariant::Completion);
        assert_eq!(req.model_name, None);
    }
}
