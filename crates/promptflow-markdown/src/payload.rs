//! winnow grammars for the structured command payloads.

use winnow::ascii::{digit1, space0, space1, Caseless};
use winnow::combinator::{alt, delimited, opt, preceded, terminated};
use winnow::error::{ContextError, StrContext, StrContextValue};
use winnow::token::{literal, rest, take_while};
use winnow::{ModalResult, Parser};

use crate::command::{Comparison, ExpectationUnit};

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
pub(crate) fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Parse a `{name}` placeholder, returning the name.
pub(crate) fn placeholder<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    delimited('{', identifier, '}')
        .context(StrContext::Expected(StrContextValue::Description(
            "parameter in braces, e.g. {name}",
        )))
        .parse_next(input)
}

fn comparison(input: &mut &str) -> ModalResult<Comparison> {
    alt((
        (literal(Caseless("at")), space1, literal(Caseless("least"))).value(Comparison::Minimum),
        (literal(Caseless("at")), space1, literal(Caseless("most"))).value(Comparison::Maximum),
        literal(Caseless("minimum")).value(Comparison::Minimum),
        literal(Caseless("min")).value(Comparison::Minimum),
        literal(Caseless("maximum")).value(Comparison::Maximum),
        literal(Caseless("max")).value(Comparison::Maximum),
        literal(Caseless("exactly")).value(Comparison::Exactly),
    ))
    .parse_next(input)
}

fn unit(input: &mut &str) -> ModalResult<ExpectationUnit> {
    take_while(1.., |c: char| c.is_ascii_alphabetic())
        .verify_map(ExpectationUnit::from_name)
        .context(StrContext::Expected(StrContextValue::Description(
            "unit: characters, words, sentences, lines, paragraphs or pages",
        )))
        .parse_next(input)
}

fn amount(input: &mut &str) -> ModalResult<(Comparison, usize, ExpectationUnit)> {
    let comparison = opt(terminated(comparison, space1))
        .parse_next(input)?
        .unwrap_or(Comparison::Exactly);
    let amount = digit1.try_map(str::parse::<usize>).parse_next(input)?;
    let unit = preceded(space1, unit).parse_next(input)?;
    let _ = (space0, opt('.'), space0).parse_next(input)?;
    Ok((comparison, amount, unit))
}

fn render_error(e: winnow::error::ParseError<&str, ContextError>) -> String {
    let detail = e.inner().to_string();
    if detail.is_empty() {
        format!("unexpected input at offset {}", e.offset())
    } else {
        detail.replace('\n', "; ")
    }
}

/// `[min|max|exactly|at least|at most] N unit`
pub(crate) fn expect_amount(
    payload: &str,
) -> std::result::Result<(Comparison, usize, ExpectationUnit), String> {
    amount.parse(payload).map_err(render_error)
}

/// Whether the payload reads like a numeric expectation rather than a format tag.
pub(crate) fn starts_like_amount(payload: &str) -> bool {
    let mut input = payload;
    let probe: ModalResult<_> =
        (opt(terminated(comparison, space1)), digit1).parse_next(&mut input);
    probe.is_ok()
}

/// `{name} optional description`
pub(crate) fn parameter(payload: &str) -> std::result::Result<(String, Option<String>), String> {
    let (name, description) = (placeholder, rest)
        .parse(payload)
        .map_err(render_error)?;
    let description = description
        .trim()
        .trim_start_matches(['-', ':'])
        .trim();
    Ok((
        name.to_string(),
        (!description.is_empty()).then(|| description.to_string()),
    ))
}

fn arrow<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let _ = ("->", space0).parse_next(input)?;
    let name = placeholder.parse_next(input)?;
    let _ = space0.parse_next(input)?;
    Ok(name)
}

/// `-> {name}` result-parameter paragraph.
pub(crate) fn result_arrow(text: &str) -> Option<String> {
    arrow.parse(text).ok().map(String::from)
}

fn version<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        digit1,
        '.',
        digit1,
        '.',
        digit1,
        opt(preceded(
            '-',
            take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-'),
        )),
    )
        .take()
        .parse_next(input)
}

/// `MAJOR.MINOR.PATCH[-pre]`
pub(crate) fn semver(payload: &str) -> std::result::Result<String, String> {
    version
        .parse(payload)
        .map(String::from)
        .map_err(|_| format!("\"{payload}\" is not a semantic version"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_with_comparisons() {
        assert_eq!(
            expect_amount("at least 3 sentences").unwrap(),
            (Comparison::Minimum, 3, ExpectationUnit::Sentences)
        );
        assert_eq!(
            expect_amount("MAX 20 Words.").unwrap(),
            (Comparison::Maximum, 20, ExpectationUnit::Words)
        );
        assert_eq!(
            expect_amount("minimum 2 pages").unwrap(),
            (Comparison::Minimum, 2, ExpectationUnit::Pages)
        );
    }

    #[test]
    fn amount_errors_are_descriptive() {
        let err = expect_amount("min lots of words").unwrap_err();
        assert!(!err.is_empty());
        assert!(expect_amount("5 words and more").is_err());
    }

    #[test]
    fn amount_detection() {
        assert!(starts_like_amount("5 words"));
        assert!(starts_like_amount("min 5 words"));
        assert!(!starts_like_amount("JSON"));
        assert!(!starts_like_amount(""));
    }

    #[test]
    fn parameter_with_description_separator() {
        assert_eq!(
            parameter("{title} - the title").unwrap(),
            ("title".to_string(), Some("the title".to_string()))
        );
        assert_eq!(parameter("{x}").unwrap(), ("x".to_string(), None));
        assert!(parameter("{1x}").is_err());
        assert!(parameter("x").is_err());
    }

    #[test]
    fn result_arrow_forms() {
        assert_eq!(result_arrow("-> {article}").as_deref(), Some("article"));
        assert_eq!(result_arrow("->{x} ").as_deref(), Some("x"));
        assert_eq!(result_arrow("-> {x} and more"), None);
        assert_eq!(result_arrow("Some prose"), None);
    }

    #[test]
    fn semver_forms() {
        assert_eq!(semver("1.0.0").unwrap(), "1.0.0");
        assert_eq!(semver("2.10.3-beta.1").unwrap(), "2.10.3-beta.1");
        assert!(semver("1.0").is_err());
    }
}
