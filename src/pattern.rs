//! Regular expression literals in rule documents.
//!
//! YAML has no regex type, so rule documents spell a pattern as a string
//! wrapped in slashes, optionally followed by flags: `/wheel\s*chair/i`.

use regex::{Regex, RegexBuilder};

use crate::error::ConfigurationError;

/// Splits `/pattern/flags` into its parts. Returns `None` for plain strings.
pub fn regex_literal(input: &str) -> Option<(&str, &str)> {
    let rest = input.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let (pattern, flags) = (&rest[..end], &rest[end + 1..]);
    if flags.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'x')) {
        Some((pattern, flags))
    } else {
        None
    }
}

/// Compiles `/pattern/flags`, or `None` if `input` is not a regex literal.
pub fn parse_literal(field: &str, input: &str) -> Result<Option<Regex>, ConfigurationError> {
    match regex_literal(input) {
        Some((pattern, flags)) => build(field, pattern, flags).map(Some),
        None => Ok(None),
    }
}

/// Compiles `input` as a regex, accepting both `/pattern/flags` and a bare pattern.
pub fn parse_pattern(field: &str, input: &str) -> Result<Regex, ConfigurationError> {
    match regex_literal(input) {
        Some((pattern, flags)) => build(field, pattern, flags),
        None => build(field, input, ""),
    }
}

fn build(field: &str, pattern: &str, flags: &str) -> Result<Regex, ConfigurationError> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'))
        .build()
        .map_err(|source| ConfigurationError::InvalidPattern {
            field: field.to_string(),
            pattern: pattern.to_string(),
            source,
        })
}
