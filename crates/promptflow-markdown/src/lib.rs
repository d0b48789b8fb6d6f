//! Markdown front end for promptflow pipelines.
//!
//! Splits a pipeline document into its head and sections and parses every
//! top-level list item into a typed [`Command`] through a [`CommandRegistry`].
//!
//! # Example
//! ```
//! let source = "# Hello\n\n- INPUT PARAMETER {name}\n\n## Greet\n\n```\nHi {name}\n```\n\n-> {greeting}\n";
//! let registry = promptflow_markdown::CommandRegistry::standard();
//! let parsed = promptflow_markdown::parse_pipeline_source(source, &registry).unwrap();
//! assert_eq!(parsed.title, "Hello");
//! assert_eq!(parsed.sections[0].name, "greet");
//! ```

pub mod command;
pub mod document;
mod payload;
pub mod registry;

pub use command::*;
pub use document::{split_document, ListItem, MarkdownDocument, RawSection};
pub use registry::{CommandRegistry, Recognizer};

use promptflow_types::{PromptflowError, Result};
use serde::{Deserialize, Serialize};

/// A command together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCommand {
    pub command: Command,
    pub line: usize,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSection {
    pub title: String,
    /// Slug of the title; the task name.
    pub name: String,
    pub line: usize,
    pub description: Option<String>,
    pub commands: Vec<ParsedCommand>,
    pub content: Option<String>,
    pub content_language: Option<String>,
    pub result_parameter: Option<String>,
}

/// A pipeline document with every list item parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSource {
    pub title: String,
    pub description: Option<String>,
    pub head: Vec<ParsedCommand>,
    pub sections: Vec<SourceSection>,
}

/// Lower-case, dash-separated form of a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn parse_items(items: &[ListItem], registry: &CommandRegistry) -> Result<Vec<ParsedCommand>> {
    items
        .iter()
        .map(|item| {
            let command = registry.parse_command(&item.text).map_err(|e| match e {
                PromptflowError::Parsing { message, .. } => PromptflowError::Parsing {
                    message,
                    line: Some(item.line),
                    snippet: Some(item.text.chars().take(40).collect()),
                },
                other => other,
            })?;
            Ok(ParsedCommand {
                command,
                line: item.line,
                raw: item.text.clone(),
            })
        })
        .collect()
}

/// Split `source` and parse all of its commands.
pub fn parse_pipeline_source(source: &str, registry: &CommandRegistry) -> Result<PipelineSource> {
    let doc = split_document(source)?;
    let title = doc
        .title
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PromptflowError::parsing("Pipeline has no `#` title"))?;

    let head = parse_items(&doc.head_items, registry)?;
    let sections = doc
        .sections
        .into_iter()
        .map(|raw| {
            let commands = parse_items(&raw.items, registry)?;
            let name = slugify(&raw.title);
            if name.is_empty() {
                return Err(PromptflowError::Parsing {
                    message: format!("Section title \"{}\" has no letters or digits", raw.title),
                    line: Some(raw.line),
                    snippet: None,
                });
            }
            Ok(SourceSection {
                name,
                title: raw.title,
                line: raw.line,
                description: raw.description,
                commands,
                content: raw.content,
                content_language: raw.content_language,
                result_parameter: raw.result_parameter,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(title = %title, sections = sections.len(), "Pipeline source parsed");
    Ok(PipelineSource {
        title,
        description: doc.description,
        head,
        sections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_titles() {
        assert_eq!(slugify("Write the article"), "write-the-article");
        assert_eq!(slugify("  Step #2: Polish!  "), "step-2-polish");
        assert_eq!(slugify("Übersicht"), "übersicht");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let src = "# T\n\n## Task\n\n- afasf ddd\n";
        let err = parse_pipeline_source(src, &CommandRegistry::standard()).unwrap_err();
        match err {
            PromptflowError::Parsing { message, line, .. } => {
                assert!(message.contains("Unknown command"));
                assert_eq!(line, Some(5));
            }
            other => panic!("expected Parsing, got {other:?}"),
        }
    }

    #[test]
    fn missing_title_fails() {
        let err = parse_pipeline_source("## Only a section\n", &CommandRegistry::standard())
            .unwrap_err();
        assert!(err.to_string().contains("no `#` title"));
    }

    #[test]
    fn sections_get_slug_names() {
        let src = "# T\n\n## First Step\n\n- BLOCK Simple template\n\n```\nhello\n```\n\n-> {a}\n";
        let parsed = parse_pipeline_source(src, &CommandRegistry::standard()).unwrap();
        assert_eq!(parsed.sections.len(), 1);
        let section = &parsed.sections[0];
        assert_eq!(section.name, "first-step");
        assert_eq!(
            section.commands[0].command,
            Command::Block {
                block_type: BlockType::SimpleTemplate
            }
        );
        assert_eq!(section.commands[0].line, 5);
    }
}
