//! `{parameter}` placeholders in task templates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};

use promptflow_types::{PromptflowError, Result};

/// Names the engine fills in itself; pipelines may reference but never
/// declare or produce them.
pub const RESERVED_PARAMETERS: &[&str] = &["currentDate", "knowledge"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_PARAMETERS.contains(&name)
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Every distinct placeholder name in `template`, in sorted order.
pub fn extract_parameters(template: &str) -> BTreeSet<String> {
    placeholder_pattern()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute every placeholder in one pass. Substituted values are not
/// scanned again, so a value containing `{x}` stays literal.
pub fn resolve_template(
    task: &str,
    template: &str,
    values: &BTreeMap<String, String>,
) -> Result<String> {
    let mut missing = BTreeSet::new();
    let resolved = placeholder_pattern().replace_all(template, |caps: &Captures<'_>| {
        match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                missing.insert(caps[1].to_string());
                caps[0].to_string()
            }
        }
    });
    if !missing.is_empty() {
        let names: Vec<_> = missing.iter().map(|n| format!("{{{n}}}")).collect();
        return Err(PromptflowError::Template {
            task: task.to_string(),
            message: format!("unresolved parameters {}", names.join(", ")),
        });
    }
    Ok(resolved.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_names_once() {
        let names = extract_parameters("Hi {name}, {greeting} {name}! {\"json\": 1} {9bad}");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["greeting".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn resolves_all_placeholders() {
        let out = resolve_template(
            "t",
            "Write about {topic} in {style}.",
            &values(&[("topic", "cats"), ("style", "haiku")]),
        )
        .unwrap();
        assert_eq!(out, "Write about cats in haiku.");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let out = resolve_template("t", "{a}", &values(&[("a", "{b}")])).unwrap();
        assert_eq!(out, "{b}");
    }

    #[test]
    fn missing_parameters_are_template_errors() {
        let err = resolve_template("draft", "{a} {b} {c}", &values(&[("b", "x")])).unwrap_err();
        match err {
            PromptflowError::Template { task, message } => {
                assert_eq!(task, "draft");
                assert!(message.contains("{a}"));
                assert!(message.contains("{c}"));
            }
            other => panic!("Expected Template, got: {other:?}"),
        }
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved("currentDate"));
        assert!(is_reserved("knowledge"));
        assert!(!is_reserved("topic"));
    }
}
