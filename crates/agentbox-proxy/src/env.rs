//! Environment sanitization for processes spawned into the sandbox.
//!
//! The sanitizer must run before every child spawn: it is the last barrier
//! between the operator's credentials and a less-trusted process inheriting
//! them. Matching entries are removed outright, never blanked.
//!
//! Credentials reach the network only through the proxy. A name on the
//! passthrough list that also matches a block pattern is refused, never
//! re-added.

use crate::config::EnvConfig;
use std::process::Command;
use tracing::{debug, warn};

/// A pattern starting with this character is matched against the end of
/// the variable name. The marker stays part of the suffix.
pub const SUFFIX_MARKER: char = '_';

/// Block patterns applied when the configuration does not override them.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    // Cloud credentials
    "AWS_",
    "GOOGLE_",
    "GCLOUD_",
    "CLOUDSDK_",
    "AZURE_",
    // Agents
    "SSH_",
    "GPG_",
    // Package managers
    "HOMEBREW_",
    "NPM_",
    "TWINE_",
    // Model providers
    "ANTHROPIC_",
    "OPENAI_",
    // Naming conventions
    "_TOKEN",
    "_SECRET",
    "_KEY",
    "_PASSWORD",
    "_CREDENTIAL",
    "_CREDENTIALS",
    "_API_KEY",
];

/// A single environment variable name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPattern {
    /// Blocks names starting with the string.
    Prefix(String),
    /// Blocks names ending with the string.
    Suffix(String),
}

impl BlockPattern {
    /// Parse a configured pattern string.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        if pattern.starts_with(SUFFIX_MARKER) {
            BlockPattern::Suffix(pattern.to_string())
        } else {
            BlockPattern::Prefix(pattern.to_string())
        }
    }

    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            BlockPattern::Prefix(p) => name.starts_with(p.as_str()),
            BlockPattern::Suffix(s) => name.ends_with(s.as_str()),
        }
    }
}

/// Remove every `NAME=VALUE` entry whose name matches any pattern.
///
/// Entries without `=` are dropped as well. Order of the surviving entries
/// is preserved.
#[must_use]
pub fn filter_env(env: &[String], patterns: &[BlockPattern]) -> Vec<String> {
    env.iter()
        .filter(|entry| match entry.split_once('=') {
            Some((name, _)) => !patterns.iter().any(|p| p.matches(name)),
            None => false,
        })
        .cloned()
        .collect()
}

/// Applies the block list and the explicit passthrough list to a child's
/// environment.
#[derive(Debug, Clone)]
pub struct EnvSanitizer {
    patterns: Vec<BlockPattern>,
    allowed: Vec<String>,
}

impl Default for EnvSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_PATTERNS, &[] as &[&str])
    }
}

impl EnvSanitizer {
    /// Build a sanitizer from pattern strings and passthrough variable names.
    ///
    /// Passthrough names that match a block pattern are dropped with a
    /// warning.
    #[must_use]
    pub fn new<P: AsRef<str>, A: AsRef<str>>(patterns: &[P], allowed: &[A]) -> Self {
        let patterns: Vec<BlockPattern> = patterns
            .iter()
            .map(|p| BlockPattern::parse(p.as_ref()))
            .collect();
        let allowed = allowed
            .iter()
            .map(|a| a.as_ref())
            .filter(|name| {
                let blocked = patterns.iter().any(|p| p.matches(name));
                if blocked {
                    warn!(
                        "Refusing to pass {} to the sandbox: it matches a block pattern",
                        name
                    );
                }
                !blocked
            })
            .map(str::to_string)
            .collect();
        Self { patterns, allowed }
    }

    #[must_use]
    pub fn from_config(config: &EnvConfig) -> Self {
        Self::new(&config.blocked_env_patterns, &config.allowed_env_vars)
    }

    /// Whether `name` would be removed from a child's environment.
    #[must_use]
    pub fn is_blocked(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// Filter a `NAME=VALUE` list against the block patterns.
    #[must_use]
    pub fn filter(&self, env: &[String]) -> Vec<String> {
        filter_env(env, &self.patterns)
    }

    /// Replace `cmd`'s environment with a sanitized snapshot of ours.
    ///
    /// The inherited environment is cleared first, so nothing reaches the
    /// child unless it survived the block list.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear();

        let mut removed = 0usize;
        for (name, value) in std::env::vars_os() {
            match name.to_str() {
                Some(n) if !self.is_blocked(n) => {
                    cmd.env(&name, &value);
                }
                _ => removed += 1,
            }
        }
        debug!("Removed {} environment variables from child", removed);
    }

    /// Passthrough names that survived the block list.
    #[must_use]
    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}
