//! Cache-inclusion pattern matching.
//!
//! A pattern is either an exact key or a prefix followed by a single trailing
//! [`WILDCARD`]. Anything else is a configuration mistake and is reported as
//! [`PatternError::InvalidPattern`] instead of silently never matching.

use crate::error::PatternError;

/// Wildcard marker. Only valid as the final character of a pattern.
pub const WILDCARD: char = '*';

/// Check whether `value` matches `pattern`.
///
/// - No wildcard: exact equality.
/// - One wildcard as the final character: `value` starts with the prefix
///   before it.
/// - A wildcard anywhere else: [`PatternError::InvalidPattern`].
pub fn matches(value: &str, pattern: &str) -> Result<bool, PatternError> {
    match pattern.find(WILDCARD) {
        None => Ok(value == pattern),
        Some(position) if position + WILDCARD.len_utf8() == pattern.len() => {
            Ok(value.starts_with(&pattern[..position]))
        }
        Some(position) => Err(PatternError::InvalidPattern {
            pattern: pattern.to_string(),
            position,
        }),
    }
}

/// Validate a pattern without matching anything against it.
pub fn validate(pattern: &str) -> Result<(), PatternError> {
    matches("", pattern).map(|_| ())
}
