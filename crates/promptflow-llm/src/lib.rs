//! LLM side of the promptflow execution tools boundary.
//!
//! Provides the `LlmExecutionTools` trait the engine calls, the prompt,
//! result and usage types that cross it, `MultipleLlmTools` for ordered
//! fallback between tool sets, and `MockedEchoLlmTools` for dry runs.

mod tools;
mod types;

pub use tools::*;
pub use types::*;
