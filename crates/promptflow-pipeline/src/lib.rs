//! Pipeline compiler, collections and execution engine.
//!
//! This crate turns parsed markdown into a [`CompiledPipeline`], checks it with
//! the lint rules in [`validation`], groups pipelines into collections and runs
//! them: dependency-ordered scheduling, retries and joker fallbacks, format
//! healing, expectations and postprocessing.

pub mod cancel;
pub mod collection;
pub mod compiler;
pub mod config;
pub mod dialog;
pub mod duration_serde;
pub mod engine;
pub mod events;
pub mod expectations;
pub mod formats;
pub mod pipeline;
pub mod postprocess;
pub mod prepare;
pub mod registries;
pub mod report;
pub mod retry;
pub mod template;
pub mod validation;

pub use cancel::CancellationToken;
pub use collection::{
    collection_to_json, create_collection_from_directory, create_collection_from_json,
    create_collection_from_json_str, create_collection_from_markdown, create_subcollection,
    PipelineCollection, SimplePipelineCollection, Subcollection,
};
pub use compiler::{compile_pipeline, compile_pipeline_prepared, compile_source};
pub use config::{ExecutionConfig, ExecutionLimits};
pub use dialog::{AutoAnswerDialog, ConsoleDialog, DialogRequest, ScriptedDialog, UserInterfaceTools};
pub use engine::{run, ExecutionTools, PipelineExecutor};
pub use events::{EventEmitter, ExecutionEvent, TaskState};
pub use expectations::{
    check_expectations, count, count_characters, count_lines, count_pages, count_paragraphs,
    count_sentences, count_words, ExpectationAmount, Expectations,
};
pub use formats::{
    CsvFormat, FormatDefinition, FormatRegistry, JsonFormat, ListFormat, TextFormat, XmlFormat,
};
pub use pipeline::{
    CompiledPipeline, KnowledgePiece, KnowledgeSourceDeclaration, ParameterDeclaration,
    PersonaDeclaration, Preparation, Task,
};
pub use postprocess::{PostprocessFn, PostprocessRegistry};
pub use prepare::{is_pipeline_prepared, prepare_pipeline, unprepare_pipeline};
pub use registries::Registries;
pub use report::{AttemptError, AttemptRecord, ExecutionReport, PipelineResult};
pub use retry::{BackoffPolicy, JokerPolicy};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
