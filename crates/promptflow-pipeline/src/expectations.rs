//! Count-based output constraints (`EXPECT min 100 words`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use promptflow_markdown::{Comparison, ExpectationUnit};
use promptflow_types::{PromptflowError, Result};

/// Lines on one page.
pub const LINES_PER_PAGE: usize = 44;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

pub fn count_characters(text: &str) -> usize {
    text.chars().count()
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

pub fn count_sentences(text: &str) -> usize {
    text.split(['.', '!', '?'])
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .count()
}

pub fn count_lines(text: &str) -> usize {
    text.lines().count()
}

pub fn count_paragraphs(text: &str) -> usize {
    let mut count = 0;
    let mut in_paragraph = false;
    for line in text.lines() {
        if line.trim().is_empty() {
            in_paragraph = false;
        } else if !in_paragraph {
            in_paragraph = true;
            count += 1;
        }
    }
    count
}

pub fn count_pages(text: &str) -> usize {
    count_lines(text).div_ceil(LINES_PER_PAGE)
}

pub fn count(unit: ExpectationUnit, text: &str) -> usize {
    match unit {
        ExpectationUnit::Characters => count_characters(text),
        ExpectationUnit::Words => count_words(text),
        ExpectationUnit::Sentences => count_sentences(text),
        ExpectationUnit::Lines => count_lines(text),
        ExpectationUnit::Paragraphs => count_paragraphs(text),
        ExpectationUnit::Pages => count_pages(text),
    }
}

// ---------------------------------------------------------------------------
// Expectations
// ---------------------------------------------------------------------------

/// Inclusive bounds on one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpectationAmount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<usize>,
}

impl ExpectationAmount {
    pub fn accepts(&self, amount: usize) -> bool {
        self.min.map_or(true, |min| amount >= min) && self.max.map_or(true, |max| amount <= max)
    }

    pub fn is_consistent(&self) -> bool {
        match (self.min, self.max) {
            (Some(min), Some(max)) => min <= max,
            _ => true,
        }
    }
}

pub type Expectations = BTreeMap<ExpectationUnit, ExpectationAmount>;

/// Fold one `EXPECT` command into `expectations`. Repeated bounds keep the
/// stricter value.
pub fn merge_expectation(
    expectations: &mut Expectations,
    unit: ExpectationUnit,
    comparison: Comparison,
    amount: usize,
) {
    let entry = expectations.entry(unit).or_default();
    match comparison {
        Comparison::Minimum => entry.min = Some(entry.min.map_or(amount, |m| m.max(amount))),
        Comparison::Maximum => entry.max = Some(entry.max.map_or(amount, |m| m.min(amount))),
        Comparison::Exactly => {
            entry.min = Some(entry.min.map_or(amount, |m| m.max(amount)));
            entry.max = Some(entry.max.map_or(amount, |m| m.min(amount)));
        }
    }
}

fn describe(unit: ExpectationUnit, amount: &ExpectationAmount) -> String {
    match (amount.min, amount.max) {
        (Some(min), Some(max)) if min == max => format!("exactly {min} {unit}"),
        (Some(min), Some(max)) => format!("between {min} and {max} {unit}"),
        (Some(min), None) => format!("at least {min} {unit}"),
        (None, Some(max)) => format!("at most {max} {unit}"),
        (None, None) => format!("any number of {unit}"),
    }
}

/// Check `content` against every bound; all violations are reported at once.
pub fn check_expectations(task: &str, content: &str, expectations: &Expectations) -> Result<()> {
    let violations: Vec<String> = expectations
        .iter()
        .filter_map(|(unit, amount)| {
            let actual = count(*unit, content);
            (!amount.accepts(actual))
                .then(|| format!("expected {}, got {actual}", describe(*unit, amount)))
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(PromptflowError::Expect {
            task: task.to_string(),
            message: violations.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_counts_zero() {
        for unit in ExpectationUnit::ALL {
            assert_eq!(count(unit, ""), 0, "{unit}");
        }
    }

    #[test]
    fn counters_are_deterministic() {
        let text = "Hello world. How are you?\n\nFine!\n";
        assert_eq!(count_words(text), 6);
        assert_eq!(count_words(text), count_words(text));
        assert_eq!(count_characters("héllo"), 5);
        assert_eq!(count_sentences(text), 3);
        assert_eq!(count_lines(text), 3);
        assert_eq!(count_paragraphs(text), 2);
        assert_eq!(count_pages(text), 1);
    }

    #[test]
    fn words_ignore_bare_punctuation() {
        assert_eq!(count_words("one - two -- three"), 3);
    }

    #[test]
    fn pages_round_up() {
        let text = "line\n".repeat(45);
        assert_eq!(count_lines(&text), 45);
        assert_eq!(count_pages(&text), 2);
        assert_eq!(count_pages(&"line\n".repeat(44)), 1);
    }

    #[test]
    fn merge_keeps_stricter_bounds() {
        let mut e = Expectations::new();
        merge_expectation(&mut e, ExpectationUnit::Words, Comparison::Minimum, 5);
        merge_expectation(&mut e, ExpectationUnit::Words, Comparison::Minimum, 10);
        merge_expectation(&mut e, ExpectationUnit::Words, Comparison::Maximum, 50);
        merge_expectation(&mut e, ExpectationUnit::Words, Comparison::Maximum, 20);
        assert_eq!(
            e[&ExpectationUnit::Words],
            ExpectationAmount {
                min: Some(10),
                max: Some(20)
            }
        );

        merge_expectation(&mut e, ExpectationUnit::Lines, Comparison::Exactly, 3);
        assert_eq!(e[&ExpectationUnit::Lines].min, Some(3));
        assert_eq!(e[&ExpectationUnit::Lines].max, Some(3));
    }

    #[test]
    fn exactly_intersects_with_earlier_bounds() {
        let mut e = Expectations::new();
        merge_expectation(&mut e, ExpectationUnit::Words, Comparison::Maximum, 5);
        merge_expectation(&mut e, ExpectationUnit::Words, Comparison::Exactly, 8);
        let words = e[&ExpectationUnit::Words];
        assert_eq!(words, ExpectationAmount { min: Some(8), max: Some(5) });
        assert!(!words.is_consistent());

        merge_expectation(&mut e, ExpectationUnit::Lines, Comparison::Minimum, 2);
        merge_expectation(&mut e, ExpectationUnit::Lines, Comparison::Exactly, 4);
        assert_eq!(
            e[&ExpectationUnit::Lines],
            ExpectationAmount { min: Some(4), max: Some(4) }
        );
    }

    #[test]
    fn inconsistent_bounds_are_detected() {
        let amount = ExpectationAmount {
            min: Some(10),
            max: Some(2),
        };
        assert!(!amount.is_consistent());
        assert!(ExpectationAmount::default().is_consistent());
    }

    #[test]
    fn violations_become_expect_errors() {
        let mut e = Expectations::new();
        merge_expectation(&mut e, ExpectationUnit::Words, Comparison::Minimum, 3);
        assert!(check_expectations("t", "one two three", &e).is_ok());

        let err = check_expectations("t", "one two", &e).unwrap_err();
        assert!(err.is_attempt_failure());
        assert!(err.to_string().contains("at least 3 words, got 2"), "{err}");
    }
}
