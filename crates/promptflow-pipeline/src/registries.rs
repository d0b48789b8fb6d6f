use std::sync::Arc;

use promptflow_markdown::CommandRegistry;

use crate::formats::FormatRegistry;
use crate::postprocess::PostprocessRegistry;

/// The read-only lookup tables shared by compiler, collection and executor.
#[derive(Debug, Clone)]
pub struct Registries {
    pub commands: Arc<CommandRegistry>,
    pub formats: Arc<FormatRegistry>,
    pub postprocessors: Arc<PostprocessRegistry>,
}

impl Registries {
    pub fn standard() -> Self {
        Self {
            commands: Arc::new(CommandRegistry::standard()),
            formats: Arc::new(FormatRegistry::standard()),
            postprocessors: Arc::new(PostprocessRegistry::standard()),
        }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::standard()
    }
}
