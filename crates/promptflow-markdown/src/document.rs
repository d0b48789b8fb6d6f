//! Structural split of a pipeline markdown document.
//!
//! The splitter only knows about markdown shapes: the `#` title, the head
//! list, one `##` section per task with its list, fenced block and `-> {name}`
//! paragraph. Interpreting list items as commands happens in
//! [`crate::parse_pipeline_source`].

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};

use promptflow_types::{PromptflowError, Result};

/// A top-level list item with its 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawSection {
    pub title: String,
    pub line: usize,
    pub description: Option<String>,
    pub items: Vec<ListItem>,
    pub content: Option<String>,
    pub content_language: Option<String>,
    pub result_parameter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarkdownDocument {
    pub title: Option<String>,
    pub description: Option<String>,
    pub head_items: Vec<ListItem>,
    pub sections: Vec<RawSection>,
}

struct LineIndex {
    newlines: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        Self {
            newlines: source.match_indices('\n').map(|(i, _)| i).collect(),
        }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.newlines.partition_point(|&nl| nl < offset) + 1
    }
}

fn parse_error(message: impl Into<String>, line: usize, snippet: &str) -> PromptflowError {
    let snippet: String = snippet.chars().take(40).collect();
    PromptflowError::Parsing {
        message: message.into(),
        line: Some(line),
        snippet: (!snippet.is_empty()).then_some(snippet),
    }
}

fn append_paragraph(target: &mut Option<String>, text: &str) {
    match target {
        Some(existing) => {
            existing.push_str("\n\n");
            existing.push_str(text);
        }
        None => *target = Some(text.to_string()),
    }
}

/// Split markdown into title, head list and sections.
pub fn split_document(source: &str) -> Result<MarkdownDocument> {
    let lines = LineIndex::new(source);
    let mut doc = MarkdownDocument::default();
    let mut section: Option<RawSection> = None;

    let mut list_depth = 0usize;
    let mut item: Option<ListItem> = None;
    let mut heading: Option<(HeadingLevel, String, usize)> = None;
    let mut paragraph: Option<(String, usize)> = None;
    let mut code: Option<(Option<String>, String, usize)> = None;

    for (event, range) in Parser::new_ext(source, Options::empty()).into_offset_iter() {
        let line = lines.line_of(range.start);
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                heading = Some((level, String::new(), line));
            }
            Event::End(TagEnd::Heading(_)) => {
                let Some((level, text, line)) = heading.take() else {
                    continue;
                };
                let text = text.trim().to_string();
                match level {
                    HeadingLevel::H1 => {
                        if doc.title.is_some() || section.is_some() || !doc.sections.is_empty() {
                            return Err(parse_error(
                                "Pipeline must have exactly one top-level `#` heading, placed first",
                                line,
                                &text,
                            ));
                        }
                        doc.title = Some(text);
                    }
                    HeadingLevel::H2 => {
                        if let Some(done) = section.take() {
                            doc.sections.push(done);
                        }
                        section = Some(RawSection {
                            title: text,
                            line,
                            ..RawSection::default()
                        });
                    }
                    // Deeper headings are commentary.
                    _ => {}
                }
            }
            Event::Start(Tag::List(_)) => list_depth += 1,
            Event::End(TagEnd::List(_)) => list_depth = list_depth.saturating_sub(1),
            Event::Start(Tag::Item) if list_depth == 1 => {
                item = Some(ListItem {
                    text: String::new(),
                    line,
                });
            }
            Event::End(TagEnd::Item) if list_depth == 1 => {
                if let Some(mut done) = item.take() {
                    done.text = done.text.trim().to_string();
                    if done.text.is_empty() {
                        continue;
                    }
                    match section.as_mut() {
                        Some(s) => s.items.push(done),
                        None => doc.head_items.push(done),
                    }
                }
            }
            Event::Start(Tag::Paragraph) if list_depth == 0 => {
                paragraph = Some((String::new(), line));
            }
            Event::End(TagEnd::Paragraph) if list_depth == 0 => {
                let Some((text, line)) = paragraph.take() else {
                    continue;
                };
                let text = text.trim();
                if let Some(name) = crate::payload::result_arrow(text) {
                    let Some(s) = section.as_mut() else {
                        return Err(parse_error(
                            "Result parameter `-> {name}` outside of a section",
                            line,
                            text,
                        ));
                    };
                    if s.result_parameter.is_some() {
                        return Err(parse_error(
                            format!("Section \"{}\" declares more than one result parameter", s.title),
                            line,
                            text,
                        ));
                    }
                    s.result_parameter = Some(name);
                } else if !text.is_empty() {
                    match section.as_mut() {
                        Some(s) => append_paragraph(&mut s.description, text),
                        None => append_paragraph(&mut doc.description, text),
                    }
                }
            }
            Event::Start(Tag::CodeBlock(kind)) if list_depth == 0 => {
                let language = match kind {
                    CodeBlockKind::Fenced(info) => info
                        .split_whitespace()
                        .next()
                        .map(|l| l.to_ascii_lowercase()),
                    CodeBlockKind::Indented => None,
                };
                code = Some((language, String::new(), line));
            }
            Event::End(TagEnd::CodeBlock) => {
                let Some((language, mut content, line)) = code.take() else {
                    continue;
                };
                if content.ends_with('\n') {
                    content.pop();
                }
                let Some(s) = section.as_mut() else {
                    return Err(parse_error("Code block outside of a section", line, &content));
                };
                if s.content.is_some() {
                    return Err(parse_error(
                        format!("Section \"{}\" has more than one code block", s.title),
                        line,
                        &content,
                    ));
                }
                s.content = Some(content);
                s.content_language = language;
            }
            Event::Text(text) => {
                if let Some((_, buf, _)) = code.as_mut() {
                    buf.push_str(&text);
                } else if let Some((_, buf, _)) = heading.as_mut() {
                    buf.push_str(&text);
                } else if list_depth == 1 {
                    if let Some(i) = item.as_mut() {
                        i.text.push_str(&text);
                    }
                } else if let Some((buf, _)) = paragraph.as_mut() {
                    buf.push_str(&text);
                }
            }
            Event::Code(text) => {
                let quoted = format!("`{text}`");
                if let Some((_, buf, _)) = heading.as_mut() {
                    buf.push_str(&text);
                } else if list_depth == 1 {
                    if let Some(i) = item.as_mut() {
                        i.text.push_str(&quoted);
                    }
                } else if let Some((buf, _)) = paragraph.as_mut() {
                    buf.push_str(&quoted);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if list_depth == 1 {
                    if let Some(i) = item.as_mut() {
                        i.text.push(' ');
                    }
                } else if let Some((buf, _)) = paragraph.as_mut() {
                    buf.push('\n');
                }
            }
            _ => {}
        }
    }

    if let Some(done) = section.take() {
        doc.sections.push(done);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTICLE: &str = r#"# Article writer

Writes short articles.

- PIPELINE URL https://example.com/article.ptbk.md
- INPUT PARAMETER {topic}

## Write the article

Main drafting step.

- EXPECT min 5 words
  - nested notes are ignored

```markdown
Write about {topic}.
```

-> {article}

## Polish

- BLOCK Script

```python
print(article)
```

-> {polished}
"#;

    #[test]
    fn splits_title_head_and_sections() {
        let doc = split_document(ARTICLE).unwrap();
        assert_eq!(doc.title.as_deref(), Some("Article writer"));
        assert_eq!(doc.description.as_deref(), Some("Writes short articles."));
        assert_eq!(doc.head_items.len(), 2);
        assert_eq!(doc.head_items[0].line, 5);
        assert_eq!(doc.sections.len(), 2);

        let first = &doc.sections[0];
        assert_eq!(first.title, "Write the article");
        assert_eq!(first.description.as_deref(), Some("Main drafting step."));
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].text, "EXPECT min 5 words");
        assert_eq!(first.content.as_deref(), Some("Write about {topic}."));
        assert_eq!(first.content_language.as_deref(), Some("markdown"));
        assert_eq!(first.result_parameter.as_deref(), Some("article"));

        let second = &doc.sections[1];
        assert_eq!(second.content_language.as_deref(), Some("python"));
        assert_eq!(second.result_parameter.as_deref(), Some("polished"));
    }

    #[test]
    fn inline_code_keeps_backticks_in_items() {
        let doc = split_document("# T\n\n## S\n\n- POSTPROCESS `trim`\n").unwrap();
        assert_eq!(doc.sections[0].items[0].text, "POSTPROCESS `trim`");
    }

    #[test]
    fn two_code_blocks_in_one_section_fail() {
        let src = "# T\n\n## S\n\n```\na\n```\n\n```\nb\n```\n";
        let err = split_document(src).unwrap_err();
        assert!(err.to_string().contains("more than one code block"));
    }

    #[test]
    fn code_block_in_head_fails() {
        let err = split_document("# T\n\n```\nx\n```\n").unwrap_err();
        assert!(err.to_string().contains("outside of a section"));
    }

    #[test]
    fn second_title_fails() {
        let err = split_document("# A\n\n# B\n").unwrap_err();
        match err {
            PromptflowError::Parsing { line, .. } => assert_eq!(line, Some(3)),
            other => panic!("expected Parsing, got {other:?}"),
        }
    }
}
