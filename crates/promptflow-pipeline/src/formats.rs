//! Output format definitions (`EXPECT JSON`, `FORMAT CSV`, ...).
//!
//! A [`FormatDefinition`] validates, repairs and extracts values from one
//! output shape. Definitions are stateless; the [`FormatRegistry`] holding
//! them is built once and shared read-only.
//!
//! `heal` contract: a returned value is always valid, and a valid input is
//! returned unchanged. Healing is therefore idempotent.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

pub type ExtractedValues = BTreeMap<String, Vec<String>>;

pub trait FormatDefinition: Send + Sync {
    /// Upper-case tag used by `EXPECT <TAG>`.
    fn tag(&self) -> &'static str;

    fn mime_type(&self) -> &'static str;

    fn is_valid(&self, value: &str) -> bool;

    /// Whether `partial` could still become valid as more output arrives.
    fn can_be_valid(&self, partial: &str) -> bool;

    /// Repair `value`, or `None` when it cannot be repaired.
    fn heal(&self, value: &str) -> Option<String>;

    /// Pull the values named in `schema` out of a valid `value`.
    /// An empty schema extracts everything the format can name.
    fn extract_values(&self, value: &str, schema: &[String]) -> Option<ExtractedValues>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Body of the first fenced code block in `value`, if any.
fn fenced_body(value: &str) -> Option<&str> {
    let start = value.find("```")?;
    let after = &value[start + 3..];
    let newline = after.find('\n')?;
    let body = &after[newline + 1..];
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].trim_end())
}

/// Candidate payloads in the order a repair should try them.
fn heal_candidates(value: &str) -> Vec<&str> {
    let mut candidates = Vec::with_capacity(2);
    if let Some(body) = fenced_body(value) {
        candidates.push(body.trim());
    }
    candidates.push(value.trim());
    candidates
}

fn wanted<'a>(schema: &'a [String], available: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    if schema.is_empty() {
        available.collect()
    } else {
        schema.iter().map(String::as_str).collect()
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormat;

fn trailing_comma_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r",(\s*[}\]])").expect("trailing comma pattern is valid"))
}

/// From the first opening bracket to the last bracket of the same kind.
fn outermost_json(value: &str) -> Option<&str> {
    let start = value.find(['{', '['])?;
    let close = if value[start..].starts_with('{') { '}' } else { ']' };
    let end = value.rfind(close)?;
    (end > start).then(|| &value[start..=end])
}

fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FormatDefinition for JsonFormat {
    fn tag(&self) -> &'static str {
        "JSON"
    }

    fn mime_type(&self) -> &'static str {
        "application/json"
    }

    fn is_valid(&self, value: &str) -> bool {
        serde_json::from_str::<serde_json::Value>(value).is_ok()
    }

    fn can_be_valid(&self, partial: &str) -> bool {
        let trimmed = partial.trim_start();
        let Some(first) = trimmed.chars().next() else {
            return true;
        };
        if !matches!(first, '{' | '[' | '"' | '-' | '0'..='9' | 't' | 'f' | 'n') {
            return false;
        }
        let mut depth = 0i64;
        let mut in_string = false;
        let mut escaped = false;
        for c in trimmed.chars() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    depth -= 1;
                    if depth < 0 {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }

    fn heal(&self, value: &str) -> Option<String> {
        if self.is_valid(value) {
            return Some(value.to_string());
        }
        for candidate in heal_candidates(value) {
            if self.is_valid(candidate) {
                return Some(candidate.to_string());
            }
            let Some(slice) = outermost_json(candidate) else {
                continue;
            };
            if self.is_valid(slice) {
                return Some(slice.to_string());
            }
            let fixed = trailing_comma_pattern().replace_all(slice, "$1");
            if self.is_valid(&fixed) {
                return Some(fixed.into_owned());
            }
        }
        None
    }

    fn extract_values(&self, value: &str, schema: &[String]) -> Option<ExtractedValues> {
        let parsed: serde_json::Value = serde_json::from_str(value).ok()?;
        let objects: Vec<&serde_json::Map<String, serde_json::Value>> = match &parsed {
            serde_json::Value::Object(map) => vec![map],
            serde_json::Value::Array(items) => items.iter().filter_map(|v| v.as_object()).collect(),
            _ => Vec::new(),
        };
        let mut keys: Vec<&str> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !keys.contains(&key.as_str()) {
                    keys.push(key.as_str());
                }
            }
        }
        let mut out = ExtractedValues::new();
        for field in wanted(schema, keys.into_iter()) {
            let values: Vec<String> = objects
                .iter()
                .filter_map(|o| o.get(field))
                .map(json_scalar)
                .collect();
            out.insert(field.to_string(), values);
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct XmlFormat;

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

/// Tag balance check: one root element, matching close tags, no stray
/// text outside the root.
fn xml_is_well_formed(value: &str) -> bool {
    let mut rest = value.trim();
    let mut stack: Vec<&str> = Vec::new();
    let mut roots = 0;
    while !rest.is_empty() {
        let Some(open) = rest.find('<') else {
            return false;
        };
        if stack.is_empty() && !rest[..open].trim().is_empty() {
            return false;
        }
        rest = &rest[open..];
        let (skip_to, terminator) = if rest.starts_with("<?") {
            (2, "?>")
        } else if rest.starts_with("<!--") {
            (4, "-->")
        } else if rest.starts_with("<![CDATA[") {
            if stack.is_empty() {
                return false;
            }
            (9, "]]>")
        } else if rest.starts_with("<!") {
            (2, ">")
        } else {
            (0, "")
        };
        if !terminator.is_empty() {
            let Some(end) = rest[skip_to..].find(terminator) else {
                return false;
            };
            rest = &rest[skip_to + end + terminator.len()..];
            continue;
        }
        let Some(close) = rest.find('>') else {
            return false;
        };
        let body = &rest[1..close];
        rest = &rest[close + 1..];
        if let Some(name) = body.strip_prefix('/') {
            if stack.pop() != Some(name.trim()) {
                return false;
            }
            continue;
        }
        let self_closing = body.ends_with('/');
        let name = body
            .trim_end_matches('/')
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("");
        if !is_xml_name(name) {
            return false;
        }
        if stack.is_empty() {
            roots += 1;
            if roots > 1 {
                return false;
            }
        }
        if !self_closing {
            stack.push(name);
        }
    }
    stack.is_empty() && roots == 1
}

impl FormatDefinition for XmlFormat {
    fn tag(&self) -> &'static str {
        "XML"
    }

    fn mime_type(&self) -> &'static str {
        "application/xml"
    }

    fn is_valid(&self, value: &str) -> bool {
        xml_is_well_formed(value)
    }

    fn can_be_valid(&self, partial: &str) -> bool {
        let trimmed = partial.trim_start();
        trimmed.is_empty() || trimmed.starts_with('<')
    }

    fn heal(&self, value: &str) -> Option<String> {
        if self.is_valid(value) {
            return Some(value.to_string());
        }
        for candidate in heal_candidates(value) {
            if self.is_valid(candidate) {
                return Some(candidate.to_string());
            }
            let (Some(start), Some(end)) = (candidate.find('<'), candidate.rfind('>')) else {
                continue;
            };
            if end > start && self.is_valid(&candidate[start..=end]) {
                return Some(candidate[start..=end].to_string());
            }
        }
        None
    }

    fn extract_values(&self, value: &str, schema: &[String]) -> Option<ExtractedValues> {
        if !self.is_valid(value) {
            return None;
        }
        let mut out = ExtractedValues::new();
        for field in schema {
            let pattern = format!(
                r"(?s)<{name}(?:\s[^>]*)?>(.*?)</{name}\s*>",
                name = regex::escape(field)
            );
            let re = Regex::new(&pattern).ok()?;
            let values = re
                .captures_iter(value)
                .map(|c| c[1].trim().to_string())
                .collect();
            out.insert(field.clone(), values);
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct CsvFormat;

/// Split CSV into rows of fields. `None` on an unterminated quote unless
/// `allow_open_quote` is set.
fn parse_csv(value: &str, allow_open_quote: bool) -> Option<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => row.push(std::mem::take(&mut field)),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            other => field.push(other),
        }
    }
    if in_quotes && !allow_open_quote {
        return None;
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Some(rows)
}

fn is_blank_row(row: &[String]) -> bool {
    row.len() == 1 && row[0].trim().is_empty()
}

impl FormatDefinition for CsvFormat {
    fn tag(&self) -> &'static str {
        "CSV"
    }

    fn mime_type(&self) -> &'static str {
        "text/csv"
    }

    fn is_valid(&self, value: &str) -> bool {
        let Some(rows) = parse_csv(value, false) else {
            return false;
        };
        let Some(width) = rows.first().map(Vec::len) else {
            return false;
        };
        rows.iter().all(|r| !is_blank_row(r) && r.len() == width)
    }

    fn can_be_valid(&self, partial: &str) -> bool {
        let Some(rows) = parse_csv(partial, true) else {
            return false;
        };
        let complete = rows.len().saturating_sub(1);
        let Some(width) = rows.first().map(Vec::len) else {
            return true;
        };
        rows[..complete].iter().all(|r| r.len() == width)
    }

    fn heal(&self, value: &str) -> Option<String> {
        if self.is_valid(value) {
            return Some(value.to_string());
        }
        for candidate in heal_candidates(value) {
            let compact = candidate
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            if self.is_valid(&compact) {
                return Some(compact);
            }
        }
        None
    }

    fn extract_values(&self, value: &str, schema: &[String]) -> Option<ExtractedValues> {
        if !self.is_valid(value) {
            return None;
        }
        let rows = parse_csv(value, false)?;
        let (header, data) = rows.split_first()?;
        let mut out = ExtractedValues::new();
        for field in wanted(schema, header.iter().map(String::as_str)) {
            let Some(column) = header.iter().position(|h| h.trim() == field) else {
                continue;
            };
            let values = data.iter().map(|r| r[column].clone()).collect();
            out.insert(field.to_string(), values);
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// LIST
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct ListFormat;

fn list_item_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(\S.*)$").expect("list item pattern is valid")
    })
}

impl FormatDefinition for ListFormat {
    fn tag(&self) -> &'static str {
        "LIST"
    }

    fn mime_type(&self) -> &'static str {
        "text/markdown"
    }

    fn is_valid(&self, value: &str) -> bool {
        let mut lines = value.lines().filter(|l| !l.trim().is_empty()).peekable();
        lines.peek().is_some() && lines.all(|l| list_item_pattern().is_match(l))
    }

    fn can_be_valid(&self, partial: &str) -> bool {
        match partial.lines().find(|l| !l.trim().is_empty()) {
            None => true,
            Some(first) => {
                let first = first.trim_start();
                list_item_pattern().is_match(first)
                    || matches!(first, "-" | "*" | "+")
                    || first.chars().all(|c| c.is_ascii_digit() || c == '.')
            }
        }
    }

    fn heal(&self, value: &str) -> Option<String> {
        if self.is_valid(value) {
            return Some(value.to_string());
        }
        let candidate = heal_candidates(value).into_iter().next()?;
        let healed = candidate
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                if list_item_pattern().is_match(l) {
                    l.to_string()
                } else {
                    format!("- {l}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.is_valid(&healed).then_some(healed)
    }

    fn extract_values(&self, value: &str, schema: &[String]) -> Option<ExtractedValues> {
        if !self.is_valid(value) {
            return None;
        }
        let items = value
            .lines()
            .filter_map(|l| list_item_pattern().captures(l))
            .map(|c| c[1].trim().to_string())
            .collect();
        let key = schema.first().cloned().unwrap_or_else(|| "items".to_string());
        Some(ExtractedValues::from([(key, items)]))
    }
}

// ---------------------------------------------------------------------------
// TEXT
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormat;

impl FormatDefinition for TextFormat {
    fn tag(&self) -> &'static str {
        "TEXT"
    }

    fn mime_type(&self) -> &'static str {
        "text/plain"
    }

    fn is_valid(&self, _value: &str) -> bool {
        true
    }

    fn can_be_valid(&self, _partial: &str) -> bool {
        true
    }

    fn heal(&self, value: &str) -> Option<String> {
        Some(value.to_string())
    }

    fn extract_values(&self, value: &str, schema: &[String]) -> Option<ExtractedValues> {
        let key = schema.first().cloned().unwrap_or_else(|| "text".to_string());
        Some(ExtractedValues::from([(key, vec![value.to_string()])]))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Format definitions keyed by exact tag.
#[derive(Clone)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn FormatDefinition>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// JSON, XML, CSV, LIST and TEXT.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonFormat));
        registry.register(Arc::new(XmlFormat));
        registry.register(Arc::new(CsvFormat));
        registry.register(Arc::new(ListFormat));
        registry.register(Arc::new(TextFormat));
        registry
    }

    /// Add a definition, replacing any with the same tag.
    pub fn register(&mut self, format: Arc<dyn FormatDefinition>) {
        self.formats.retain(|f| f.tag() != format.tag());
        self.formats.push(format);
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn FormatDefinition>> {
        self.formats.iter().find(|f| f.tag() == tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.tag()).collect()
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_heal_idempotent(format: &dyn FormatDefinition, inputs: &[&str]) {
        for input in inputs {
            if let Some(once) = format.heal(input) {
                assert!(format.is_valid(&once), "{} healed to invalid: {once:?}", format.tag());
                assert_eq!(format.heal(&once).as_deref(), Some(once.as_str()), "{input:?}");
            }
        }
    }

    #[test]
    fn registry_resolves_exact_tags() {
        let registry = FormatRegistry::standard();
        assert_eq!(registry.tags(), vec!["JSON", "XML", "CSV", "LIST", "TEXT"]);
        assert!(registry.contains("JSON"));
        assert!(!registry.contains("json"));
        assert!(!registry.contains("YAML"));
    }

    #[test]
    fn json_validity() {
        assert!(JsonFormat.is_valid(r#"{"a": [1, 2]}"#));
        assert!(JsonFormat.is_valid("42"));
        assert!(!JsonFormat.is_valid("{a: 1}"));
        assert!(JsonFormat.can_be_valid(r#"{"a": [1, "#));
        assert!(JsonFormat.can_be_valid(""));
        assert!(!JsonFormat.can_be_valid("Sure! {"));
        assert!(!JsonFormat.can_be_valid("{]]"));
    }

    #[test]
    fn json_heals_fences_chatter_and_trailing_commas() {
        let fenced = "Here you go:\n```json\n{\"a\": 1}\n```\nEnjoy!";
        assert_eq!(JsonFormat.heal(fenced).as_deref(), Some("{\"a\": 1}"));

        let chatter = "The answer is {\"a\": [1, 2,], } as requested";
        let healed = JsonFormat.heal(chatter).unwrap();
        let value: serde_json::Value = serde_json::from_str(&healed).unwrap();
        assert_eq!(value["a"][1], 2);

        assert_eq!(JsonFormat.heal("no json here"), None);
    }

    #[test]
    fn valid_values_heal_unchanged() {
        let valid = "  {\"a\": 1}  ";
        assert_eq!(JsonFormat.heal(valid).as_deref(), Some(valid));
        assert_eq!(TextFormat.heal("anything").as_deref(), Some("anything"));
    }

    #[test]
    fn heal_is_idempotent() {
        let inputs = [
            "```json\n[1, 2,]\n```",
            "text {\"a\": 1,} text",
            "<a><b>1</b></a>",
            "Result: <root>x</root> done",
            "a,b\n\n1,2\n",
            "apples\n- pears\n* plums",
            "nothing useful",
            "",
        ];
        let registry = FormatRegistry::standard();
        for tag in registry.tags() {
            let format = registry.get(tag).unwrap();
            assert_heal_idempotent(format.as_ref(), &inputs);
        }
    }

    #[test]
    fn json_extracts_fields() {
        let values = JsonFormat
            .extract_values(r#"[{"name": "a", "n": 1}, {"name": "b"}]"#, &["name".into()])
            .unwrap();
        assert_eq!(values["name"], vec!["a", "b"]);

        let all = JsonFormat.extract_values(r#"{"x": true, "y": "z"}"#, &[]).unwrap();
        assert_eq!(all["x"], vec!["true"]);
        assert_eq!(all["y"], vec!["z"]);
    }

    #[test]
    fn xml_well_formedness() {
        assert!(XmlFormat.is_valid("<?xml version=\"1.0\"?><a x=\"1\"><b/><c>t</c></a>"));
        assert!(XmlFormat.is_valid("<a><!-- note --><![CDATA[<raw>]]></a>"));
        assert!(!XmlFormat.is_valid("<a><b></a></b>"));
        assert!(!XmlFormat.is_valid("<a/><b/>"));
        assert!(!XmlFormat.is_valid("text <a/>"));
        assert!(!XmlFormat.is_valid(""));
    }

    #[test]
    fn xml_heals_and_extracts() {
        let healed = XmlFormat.heal("Sure: <list><item>1</item><item>2</item></list>!").unwrap();
        assert_eq!(healed, "<list><item>1</item><item>2</item></list>");
        let values = XmlFormat.extract_values(&healed, &["item".into()]).unwrap();
        assert_eq!(values["item"], vec!["1", "2"]);
    }

    #[test]
    fn csv_validity_and_healing() {
        assert!(CsvFormat.is_valid("a,b\n1,2\n\"x,y\",3"));
        assert!(!CsvFormat.is_valid("a,b\n1,2,3"));
        assert!(!CsvFormat.is_valid("a,b\n\n1,2"));
        assert!(!CsvFormat.is_valid("a,\"b"));
        assert!(CsvFormat.can_be_valid("a,b\n1,\"par"));

        assert_eq!(CsvFormat.heal("a,b\n\n1,2\n").as_deref(), Some("a,b\n1,2"));
    }

    #[test]
    fn csv_extracts_columns() {
        let values = CsvFormat
            .extract_values("name,age\nann,31\nbob,40", &["age".into(), "missing".into()])
            .unwrap();
        assert_eq!(values["age"], vec!["31", "40"]);
        assert!(!values.contains_key("missing"));
    }

    #[test]
    fn list_heals_plain_lines_into_bullets() {
        assert!(ListFormat.is_valid("- a\n* b\n1. c"));
        assert!(!ListFormat.is_valid("a\n- b"));
        assert!(!ListFormat.is_valid("\n"));
        assert_eq!(ListFormat.heal("apples\n\n- pears").as_deref(), Some("- apples\n- pears"));
        let values = ListFormat.extract_values("- a\n- b", &[]).unwrap();
        assert_eq!(values["items"], vec!["a", "b"]);
    }
}
