//! Named string transforms applied by `POSTPROCESS`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

pub type PostprocessFn = fn(&str) -> String;

/// Postprocessing functions keyed by name.
#[derive(Debug, Clone)]
pub struct PostprocessRegistry {
    functions: BTreeMap<String, PostprocessFn>,
}

impl PostprocessRegistry {
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("trim", trim);
        registry.register("spaceTrim", space_trim);
        registry.register("removeQuotes", remove_quotes);
        registry.register("unwrapResult", unwrap_result);
        registry.register("trimCodeBlock", trim_code_block);
        registry.register("trimEndOfCodeBlock", trim_end_of_code_block);
        registry.register("removeMarkdownFormatting", remove_markdown_formatting);
        registry.register("capitalize", capitalize);
        registry.register("decapitalize", decapitalize);
        registry.register("uppercase", uppercase);
        registry.register("lowercase", lowercase);
        registry.register("normalizeTo_snake_case", normalize_to_snake_case);
        registry.register("normalizeTo_camelCase", normalize_to_camel_case);
        registry.register("normalizeTo_PascalCase", normalize_to_pascal_case);
        registry.register("normalizeTo_SCREAMING_CASE", normalize_to_screaming_case);
        registry.register("normalizeToKebabCase", normalize_to_kebab_case);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, function: PostprocessFn) {
        self.functions.insert(name.into(), function);
    }

    pub fn get(&self, name: &str) -> Option<PostprocessFn> {
        self.functions.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl Default for PostprocessRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

pub fn trim(value: &str) -> String {
    value.trim().to_string()
}

/// Trim blank lines at both ends and remove the common indentation.
pub fn space_trim(value: &str) -> String {
    let lines: Vec<&str> = value.lines().collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    let (Some(first), Some(last)) = (first, last) else {
        return String::new();
    };
    let body = &lines[first..=last];
    let indent = body
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.chars().take_while(|c| c.is_whitespace()).count())
        .min()
        .unwrap_or(0);
    body.iter()
        .map(|l| {
            let start = l.char_indices().nth(indent).map_or(l.len(), |(i, _)| i);
            l[start..].trim_end()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

const QUOTE_PAIRS: &[(char, char)] = &[
    ('"', '"'),
    ('\'', '\''),
    ('`', '`'),
    ('\u{201C}', '\u{201D}'),
    ('\u{2018}', '\u{2019}'),
    ('\u{00AB}', '\u{00BB}'),
    ('\u{201E}', '\u{201C}'),
];

/// Drop one pair of matching quotes around the whole value.
pub fn remove_quotes(value: &str) -> String {
    let trimmed = value.trim();
    for (open, close) in QUOTE_PAIRS {
        if let Some(inner) = trimmed
            .strip_prefix(*open)
            .and_then(|rest| rest.strip_suffix(*close))
        {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

fn result_prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(?:the\s+)?(?:result|answer|output|response)\s*(?:is)?\s*:\s*")
            .expect("result prefix pattern is valid")
    })
}

/// Strip the chatter a model wraps around a single answer: an introducing
/// line ending in a colon, a `Result:` prefix and surrounding quotes.
pub fn unwrap_result(value: &str) -> String {
    let mut text = value.trim();
    if let Some((first, rest)) = text.split_once('\n') {
        if first.trim_end().ends_with(':') && !rest.trim().is_empty() {
            text = rest.trim();
        }
    }
    let text = result_prefix_pattern().replace(text, "");
    remove_quotes(&text)
}

/// Remove a fence that wraps the whole value.
pub fn trim_code_block(value: &str) -> String {
    let trimmed = value.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let Some(inner) = after_open.strip_suffix("```") else {
        return trimmed.to_string();
    };
    match inner.split_once('\n') {
        Some((_language, body)) => body.trim_end_matches('\n').to_string(),
        None => inner.trim().to_string(),
    }
}

/// Remove a dangling closing fence at the end of the value.
pub fn trim_end_of_code_block(value: &str) -> String {
    let trimmed = value.trim_end();
    match trimmed.strip_suffix("```") {
        Some(rest) => rest.trim_end().to_string(),
        None => trimmed.to_string(),
    }
}

fn markdown_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?m)^\s{0,3}#{1,6}\s+", ""),
            (r"\[([^\]]*)\]\([^)]*\)", "$1"),
            (r"(\*\*|__)(.+?)(\*\*|__)", "$2"),
            (r"(\*|_)([^*_\s][^*_]*?)(\*|_)", "$2"),
            (r"`([^`]*)`", "$1"),
        ]
        .into_iter()
        .map(|(p, r)| (Regex::new(p).expect("markdown pattern is valid"), r))
        .collect()
    })
}

pub fn remove_markdown_formatting(value: &str) -> String {
    markdown_patterns()
        .iter()
        .fold(value.to_string(), |text, (re, replacement)| {
            re.replace_all(&text, *replacement).into_owned()
        })
}

pub fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn decapitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn uppercase(value: &str) -> String {
    value.to_uppercase()
}

pub fn lowercase(value: &str) -> String {
    value.to_lowercase()
}

/// Lower-case words split on non-alphanumerics and on lower→upper case
/// boundaries.
fn words(value: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;
    for c in value.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if c.is_uppercase() && previous_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub fn normalize_to_snake_case(value: &str) -> String {
    words(value).join("_")
}

pub fn normalize_to_kebab_case(value: &str) -> String {
    words(value).join("-")
}

pub fn normalize_to_screaming_case(value: &str) -> String {
    words(value).join("_").to_uppercase()
}

pub fn normalize_to_pascal_case(value: &str) -> String {
    words(value).iter().map(|w| capitalize(w)).collect()
}

pub fn normalize_to_camel_case(value: &str) -> String {
    decapitalize(&normalize_to_pascal_case(value))
}
