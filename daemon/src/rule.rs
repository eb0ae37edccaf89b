/// A configured rule plus the runtime state of the command it launches.
use std::io::Write;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::ChildKiller;
use tokio::sync::oneshot;

use crate::backlog::{Backlog, UnifiedBacklog, UniqueBacklog};
use crate::config::RuleConfig;
use crate::filter::Matcher;

/// One line of command output, tagged with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutMsg {
    pub rule_id: usize,
    pub line: String,
}

impl OutMsg {
    pub fn new(rule_id: usize, line: impl Into<String>) -> Self {
        Self {
            rule_id,
            line: line.into(),
        }
    }
}

pub struct Rule {
    pub id: usize,
    pub matcher: Matcher,
    pub command: Vec<String>,
    pub substitute: String,
    pub only_files: bool,
    pub only_dirs: bool,
    pub start_service: bool,
    pub reload: bool,
    /// Shared by the runner and the terminator; never held across an await.
    pub(crate) lifecycle: Mutex<Lifecycle>,
}

/// State of the most recently spawned instance. Overwritten on every spawn.
#[derive(Default)]
pub(crate) struct Lifecycle {
    /// Set by the terminator so the exit handler does not report the exit as
    /// a failure.
    pub killed: bool,
    pub process: Option<ProcessHandle>,
    /// Fires once the instance has been reaped. Taken by whoever waits on it.
    pub done: Option<oneshot::Receiver<()>>,
}

/// What the terminator needs to stop a running instance.
pub(crate) struct ProcessHandle {
    /// Process id of the child, which leads its own process group.
    pub pid: Option<u32>,
    /// Master side of the child's pseudo-terminal.
    pub tty: Box<dyn Write + Send>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
}

impl Rule {
    /// Builds a rule from its validated config. Fails only on a regex that
    /// does not compile; a bad glob is reported when matching.
    pub fn from_config(id: usize, config: &RuleConfig) -> Result<Self> {
        let matcher = match (&config.glob, &config.regex) {
            (Some(glob), _) => Matcher::glob(glob),
            (None, Some(regex)) => Matcher::regex(regex)
                .with_context(|| format!("rule {id}: invalid regex {regex:?}"))?,
            (None, None) => Matcher::all(),
        };
        if let Matcher::InvalidGlob { pattern, error } = &matcher {
            tracing::warn!("[rule {id}] Glob {pattern:?} is malformed and will match nothing: {error}");
        }

        Ok(Self {
            id,
            matcher,
            command: config.command.clone(),
            substitute: config.substitute.clone(),
            only_files: config.only_files,
            only_dirs: config.only_dirs,
            start_service: config.start_service,
            reload: config.reload,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// The batching strategy for this rule: one restart per burst for
    /// services, one run per distinct path otherwise.
    pub fn new_backlog(&self) -> Box<dyn Backlog> {
        if self.start_service {
            Box::new(UnifiedBacklog::new())
        } else {
            Box::new(UniqueBacklog::new())
        }
    }

    /// Whether an instance has been spawned and not yet waited on.
    pub fn has_instance(&self) -> bool {
        self.lifecycle.lock().done.is_some()
    }
}
