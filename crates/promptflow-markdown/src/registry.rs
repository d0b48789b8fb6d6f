//! Ordered command recognizers.
//!
//! A [`CommandRegistry`] is consulted top to bottom; the first recognizer whose
//! keyword (and optional shape guard) matches owns the list item. Payload
//! parsing errors are reported against that recognizer and never fall through
//! to later ones.

use promptflow_types::{ModelVariant, PromptflowError, Result};

use crate::command::*;
use crate::payload;

type PayloadResult = std::result::Result<Command, String>;

/// One entry of the command table.
#[derive(Clone)]
pub struct Recognizer {
    pub kind: CommandKind,
    /// Keyword sequences, tried in order. Matching is case-insensitive and
    /// word-aligned.
    pub keywords: &'static [&'static str],
    /// Extra shape check over `(keyword, payload)`; a failing guard lets the
    /// next recognizer try.
    pub guard: Option<fn(&str, &str) -> bool>,
    pub parse: fn(&str, &str) -> PayloadResult,
}

impl std::fmt::Debug for Recognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recognizer")
            .field("kind", &self.kind)
            .field("keywords", &self.keywords)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    recognizers: Vec<Recognizer>,
}

impl CommandRegistry {
    pub fn new(recognizers: Vec<Recognizer>) -> Self {
        Self { recognizers }
    }

    /// The standard command table.
    pub fn standard() -> Self {
        Self::new(vec![
            Recognizer {
                kind: CommandKind::PipelineUrl,
                keywords: &["PIPELINE URL", "PTBK URL", "BOOK URL", "URL"],
                guard: None,
                parse: parse_pipeline_url,
            },
            Recognizer {
                kind: CommandKind::BookVersion,
                keywords: &["BOOK VERSION", "PROMPTBOOK VERSION", "PTBK VERSION"],
                guard: None,
                parse: parse_book_version,
            },
            Recognizer {
                kind: CommandKind::Block,
                keywords: &["BLOCK", "EXECUTE"],
                guard: None,
                parse: parse_block,
            },
            Recognizer {
                kind: CommandKind::Block,
                keywords: &["PROMPT TEMPLATE", "SIMPLE TEMPLATE", "PROMPT DIALOG", "SCRIPT"],
                guard: Some(payload_is_empty),
                parse: parse_bare_block,
            },
            Recognizer {
                kind: CommandKind::Model,
                keywords: &["MODEL VARIANT", "MODEL NAME"],
                guard: None,
                parse: parse_model,
            },
            Recognizer {
                kind: CommandKind::Parameter,
                keywords: &[
                    "INPUT PARAMETER",
                    "OUTPUT PARAMETER",
                    "INPUT PARAM",
                    "OUTPUT PARAM",
                    "PARAMETER",
                    "PARAM",
                ],
                guard: None,
                parse: parse_parameter,
            },
            Recognizer {
                kind: CommandKind::Persona,
                keywords: &["PERSONA"],
                guard: None,
                parse: parse_persona,
            },
            Recognizer {
                kind: CommandKind::Knowledge,
                keywords: &["KNOWLEDGE"],
                guard: None,
                parse: parse_knowledge,
            },
            Recognizer {
                kind: CommandKind::Joker,
                keywords: &["JOKER"],
                guard: None,
                parse: parse_joker,
            },
            Recognizer {
                kind: CommandKind::Postprocess,
                keywords: &["POSTPROCESS", "POST PROCESS", "POSTPROCESSING"],
                guard: None,
                parse: parse_postprocess,
            },
            // Must stay ahead of EXPECT amounts: `EXPECT JSON` vs `EXPECT 5 words`.
            Recognizer {
                kind: CommandKind::ExpectFormat,
                keywords: &["EXPECT FORMAT", "FORMAT", "EXPECT"],
                guard: Some(names_a_format),
                parse: parse_expect_format,
            },
            Recognizer {
                kind: CommandKind::ExpectAmount,
                keywords: &["EXPECT"],
                guard: None,
                parse: parse_expect_amount,
            },
            Recognizer {
                kind: CommandKind::Action,
                keywords: &["ACTION"],
                guard: None,
                parse: parse_action,
            },
            Recognizer {
                kind: CommandKind::Instrument,
                keywords: &["INSTRUMENT"],
                guard: None,
                parse: parse_instrument,
            },
        ])
    }

    pub fn recognizers(&self) -> &[Recognizer] {
        &self.recognizers
    }

    /// Parse one list item into a command.
    pub fn parse_command(&self, text: &str) -> Result<Command> {
        let text = text.trim();
        for recognizer in &self.recognizers {
            for keyword in recognizer.keywords {
                let Some(payload) = strip_keyword(text, keyword) else {
                    continue;
                };
                if let Some(guard) = recognizer.guard {
                    if !guard(keyword, payload) {
                        continue;
                    }
                }
                tracing::debug!(kind = %recognizer.kind, keyword = *keyword, "Command recognized");
                return (recognizer.parse)(keyword, payload).map_err(|detail| {
                    PromptflowError::parsing(format!(
                        "Invalid {} command \"{text}\": {detail}",
                        recognizer.kind
                    ))
                });
            }
        }
        Err(PromptflowError::parsing(format!("Unknown command \"{text}\"")))
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Match `keyword` word by word at the start of `text`, returning the
/// trimmed remainder. A trailing colon on a keyword word is tolerated.
fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let mut rest = text.trim_start();
    for word in keyword.split(' ') {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (head, tail) = rest.split_at(end);
        if !head.trim_end_matches(':').eq_ignore_ascii_case(word) {
            return None;
        }
        rest = tail.trim_start();
    }
    Some(rest.trim_end())
}

fn payload_is_empty(_keyword: &str, payload: &str) -> bool {
    payload.is_empty()
}

fn names_a_format(keyword: &str, payload: &str) -> bool {
    keyword != "EXPECT" || !payload::starts_like_amount(payload)
}

fn strip_backticks(s: &str) -> &str {
    s.trim().trim_matches('`').trim()
}

fn free_text(payload: &str) -> std::result::Result<String, String> {
    if payload.is_empty() {
        Err("text is empty".into())
    } else {
        Ok(payload.to_string())
    }
}

// ---------------------------------------------------------------------------
// Payload parsers
// ---------------------------------------------------------------------------

fn parse_pipeline_url(_keyword: &str, payload: &str) -> PayloadResult {
    let url = strip_backticks(payload);
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(format!("\"{url}\" is not an http(s) URL"));
    }
    if url.contains(char::is_whitespace) {
        return Err("URL must not contain whitespace".into());
    }
    Ok(Command::PipelineUrl {
        url: url.to_string(),
    })
}

fn parse_book_version(_keyword: &str, payload: &str) -> PayloadResult {
    let version = payload::semver(strip_backticks(payload))?;
    Ok(Command::BookVersion { version })
}

fn parse_block(_keyword: &str, payload: &str) -> PayloadResult {
    BlockType::from_name(payload)
        .map(|block_type| Command::Block { block_type })
        .ok_or_else(|| {
            format!(
                "unknown block type \"{payload}\", expected one of: Prompt template, Simple template, Script, Prompt dialog, Pipeline"
            )
        })
}

fn parse_bare_block(keyword: &str, _payload: &str) -> PayloadResult {
    BlockType::from_name(keyword)
        .map(|block_type| Command::Block { block_type })
        .ok_or_else(|| format!("unknown block type \"{keyword}\""))
}

fn parse_model(keyword: &str, payload: &str) -> PayloadResult {
    if payload.is_empty() {
        return Err("missing value".into());
    }
    if keyword == "MODEL VARIANT" {
        ModelVariant::from_name(payload)
            .map(|variant| Command::ModelVariant { variant })
            .ok_or_else(|| {
                format!("unknown model variant \"{payload}\", expected Chat, Completion or Embedding")
            })
    } else {
        Ok(Command::ModelName {
            name: strip_backticks(payload).to_string(),
        })
    }
}

fn parse_parameter(keyword: &str, payload: &str) -> PayloadResult {
    let (name, description) = payload::parameter(payload)?;
    let direction = if keyword.starts_with("INPUT") {
        ParameterDirection::Input
    } else if keyword.starts_with("OUTPUT") {
        ParameterDirection::Output
    } else {
        ParameterDirection::Intermediate
    };
    Ok(Command::Parameter {
        name,
        description,
        direction,
    })
}

fn parse_persona(_keyword: &str, payload: &str) -> PayloadResult {
    if payload.is_empty() {
        return Err("persona is empty".into());
    }
    let (name, description) = match payload.split_once(',') {
        Some((name, description)) => (name.trim(), Some(description.trim())),
        None => (payload, None),
    };
    if name.is_empty() {
        return Err("persona name is empty".into());
    }
    Ok(Command::Persona {
        name: name.to_string(),
        description: description.filter(|d| !d.is_empty()).map(String::from),
    })
}

fn parse_knowledge(_keyword: &str, payload: &str) -> PayloadResult {
    if payload.is_empty() {
        return Err("knowledge source is empty".into());
    }
    Ok(Command::Knowledge {
        source: KnowledgeSource::classify(payload),
    })
}

fn parse_joker(_keyword: &str, payload: &str) -> PayloadResult {
    let target = strip_backticks(payload);
    let slug = crate::slugify(target);
    if slug.is_empty() {
        return Err("joker must name a task".into());
    }
    Ok(Command::Joker { task: slug })
}

fn parse_postprocess(_keyword: &str, payload: &str) -> PayloadResult {
    let function = strip_backticks(payload);
    if function.is_empty() || function.contains(char::is_whitespace) {
        return Err(format!("\"{function}\" is not a function name"));
    }
    Ok(Command::Postprocess {
        function: function.to_string(),
    })
}

fn parse_expect_format(_keyword: &str, payload: &str) -> PayloadResult {
    let tag = strip_backticks(payload);
    if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("\"{tag}\" is not a format tag"));
    }
    Ok(Command::ExpectFormat {
        format: tag.to_ascii_uppercase(),
    })
}

fn parse_action(_keyword: &str, payload: &str) -> PayloadResult {
    free_text(payload).map(|text| Command::Action { text })
}

fn parse_instrument(_keyword: &str, payload: &str) -> PayloadResult {
    free_text(payload).map(|text| Command::Instrument { text })
}

fn parse_expect_amount(_keyword: &str, payload: &str) -> PayloadResult {
    let (comparison, amount, unit) = payload::expect_amount(payload)?;
    Ok(Command::ExpectAmount {
        unit,
        comparison,
        amount,
    })
}
