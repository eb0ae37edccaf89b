/// Pending-path collections used by the batcher.
///
/// Both implementations share one contract: `next` is only called on a
/// non-empty backlog, and `remove_one` is only called after a successful
/// `next`. Breaking either is a bug in the caller, not a runtime condition.
use indexmap::IndexSet;

pub trait Backlog: Send {
    /// Records `path` as pending. Adding an already-pending path does not
    /// change its position.
    fn add(&mut self, path: String);
    /// Returns the path that should be released next.
    fn next(&self) -> &str;
    /// Drops the path returned by `next`. Returns `true` if nothing is left.
    fn remove_one(&mut self) -> bool;
}

/// Distinct paths in first-seen order. Used by one-shot rules, which run
/// their command once per changed path.
#[derive(Debug, Default)]
pub struct UniqueBacklog {
    paths: IndexSet<String>,
}

impl UniqueBacklog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backlog for UniqueBacklog {
    fn add(&mut self, path: String) {
        self.paths.insert(path);
    }

    fn next(&self) -> &str {
        self.paths
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn remove_one(&mut self) -> bool {
        self.paths.shift_remove_index(0);
        self.paths.is_empty()
    }
}

/// A single pending slot. Used by service rules: any burst of changes means
/// exactly one restart, so only the latest path is kept.
#[derive(Debug, Default)]
pub struct UnifiedBacklog {
    latest: Option<String>,
}

impl UnifiedBacklog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backlog for UnifiedBacklog {
    fn add(&mut self, path: String) {
        self.latest = Some(path);
    }

    fn next(&self) -> &str {
        self.latest.as_deref().unwrap_or_default()
    }

    fn remove_one(&mut self) -> bool {
        self.latest = None;
        true
    }
}
