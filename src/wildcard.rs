// src/wildcard.rs

//! Wildcard pattern matching for repository and package queries.
//!
//! Patterns are plain strings where `*` matches one or more characters.
//! When a separator is supplied, `*` stops at it, so a wildcard in the name
//! half of `name@repository` cannot leak into the repository half.

use crate::error::{Error, Result};
use regex::Regex;

/// A compiled wildcard pattern.
#[derive(Debug, Clone)]
pub struct Wildcard {
    regex: Regex,
    anchored: Regex,
}

impl Wildcard {
    /// Compile a pattern, optionally bounding `*` by a separator character.
    pub fn compile(pattern: &str, sep: Option<char>) -> Result<Self> {
        let replacement = match sep {
            Some(c) => format!("[^{}]+", regex::escape(&c.to_string())),
            None => ".+".to_string(),
        };
        // Escape everything, then rewrite the escaped `*` tokens.
        let source = regex::escape(pattern).replace(r"\*", &replacement);
        let regex = Regex::new(&source)
            .map_err(|e| Error::Io(format!("invalid pattern {pattern:?}: {e}")))?;
        let anchored = Regex::new(&format!("^(?:{source})$"))
            .map_err(|e| Error::Io(format!("invalid pattern {pattern:?}: {e}")))?;
        Ok(Self { regex, anchored })
    }

    /// True iff the pattern matches anywhere inside `candidate`.
    ///
    /// An empty pattern matches every candidate; callers anchor via their
    /// own syntax (e.g. `name@*`).
    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    /// True iff the pattern covers the whole candidate. Used wherever a
    /// name selects something to install or remove, so `x` cannot pick up
    /// a package that merely contains `x`.
    pub fn matches_exact(&self, candidate: &str) -> bool {
        self.anchored.is_match(candidate)
    }
}
