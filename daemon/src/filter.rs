use std::sync::Arc;

use glob::{MatchOptions, Pattern, PatternError};
use regex::Regex;
use tokio::sync::mpsc;

use crate::rule::Rule;

/// `*` and `?` never cross a `/`, matching shell path semantics.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Decides whether a changed path is relevant to a rule.
#[derive(Debug)]
pub enum Matcher {
    /// No pattern configured; every path matches.
    All,
    Glob(Pattern),
    Regex(Regex),
    /// A glob that failed to compile. Matches nothing and reports the
    /// pattern error on every attempt.
    InvalidGlob { pattern: String, error: PatternError },
}

impl Matcher {
    pub fn all() -> Self {
        Matcher::All
    }

    /// Never fails: a malformed pattern yields [`Matcher::InvalidGlob`].
    pub fn glob(pattern: &str) -> Self {
        match Pattern::new(pattern) {
            Ok(p) => Matcher::Glob(p),
            Err(error) => Matcher::InvalidGlob {
                pattern: pattern.to_string(),
                error,
            },
        }
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Matcher::Regex)
    }

    /// Tests `path` against the pattern. `Err` carries the pattern error for
    /// an invalid glob; callers treat it as "no match".
    pub fn is_match(&self, path: &str) -> Result<bool, &PatternError> {
        match self {
            Matcher::All => Ok(true),
            Matcher::Glob(p) => Ok(p.matches_with(path, GLOB_OPTIONS)),
            Matcher::Regex(r) => Ok(r.is_match(path)),
            Matcher::InvalidGlob { error, .. } => Err(error),
        }
    }
}

impl Rule {
    /// Whether `path` should trigger this rule. Stats the path when the rule
    /// is restricted to files or directories; a path that can no longer be
    /// stat'ed is dropped.
    pub async fn accepts(&self, path: &str) -> bool {
        match self.matcher.is_match(path) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                if let Matcher::InvalidGlob { pattern, .. } = &self.matcher {
                    tracing::warn!("[rule {}] Error matching glob {pattern:?}: {e}", self.id);
                }
                return false;
            }
        }

        if self.only_files || self.only_dirs {
            let Ok(meta) = tokio::fs::metadata(path).await else {
                return false;
            };
            if (self.only_files && meta.is_dir()) || (self.only_dirs && !meta.is_dir()) {
                return false;
            }
        }
        true
    }
}

/// Forwards the paths from `rx` that `rule` accepts, unchanged.
pub async fn filter_matching(
    mut rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
    rule: Arc<Rule>,
) {
    while let Some(path) = rx.recv().await {
        if !rule.accepts(&path).await {
            continue;
        }
        if tx.send(path).is_err() {
            break;
        }
    }
}
