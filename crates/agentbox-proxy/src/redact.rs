//! Masking of secret-shaped substrings before they are persisted.
//!
//! Patterns are applied one after another in configuration order. Matches
//! from different patterns over the same span are not reconciled: a later
//! pattern sees the output of the earlier ones, masks included.

use regex::{Captures, Regex};
use tracing::debug;

/// Marker appended to every masked match.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Matches at or below this many characters are replaced entirely.
const FULL_MASK_MAX_CHARS: usize = 8;

/// Characters kept at each end of a longer match.
const KEPT_CHARS: usize = 4;

/// Replaces matches of the configured patterns with a partial mask.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Compile the given patterns. Patterns that fail to compile are dropped.
    #[must_use]
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p.as_ref()) {
                Ok(re) => Some(re),
                Err(e) => {
                    debug!("Dropping invalid redaction pattern {:?}: {}", p.as_ref(), e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Number of patterns that compiled.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Mask every match of every pattern in `text`.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.patterns {
            out = re
                .replace_all(&out, |caps: &Captures<'_>| mask(&caps[0]))
                .into_owned();
        }
        out
    }
}

/// `abcd...wxyz[REDACTED]` for long matches, `[REDACTED]` otherwise.
fn mask(matched: &str) -> String {
    let len = matched.chars().count();
    if len <= FULL_MASK_MAX_CHARS {
        return REDACTION_MARKER.to_string();
    }
    let head: String = matched.chars().take(KEPT_CHARS).collect();
    let tail: String = matched.chars().skip(len - KEPT_CHARS).collect();
    format!("{}...{}{}", head, tail, REDACTION_MARKER)
}
