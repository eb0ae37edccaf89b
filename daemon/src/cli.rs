use std::path::PathBuf;

use clap::Parser;

use crate::config::{Decoration, DEFAULT_SUBSTITUTE};

/// Watch a directory tree and run a command whenever matching paths change.
///
/// Rules come either from `--config` or from the matcher flags plus the
/// command after `--`, never both.
#[derive(Debug, Parser)]
#[command(name = "reflex", version)]
pub struct Cli {
    /// TOML file describing one or more rules.
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Regular expression matched against each changed path.
    #[arg(short, long, conflicts_with = "glob")]
    pub regex: Option<String>,

    /// Shell-style glob matched against each changed path.
    #[arg(short, long)]
    pub glob: Option<String>,

    /// Only trigger on paths that are regular files.
    #[arg(long, conflicts_with = "only_dirs")]
    pub only_files: bool,

    /// Only trigger on paths that are directories.
    #[arg(long)]
    pub only_dirs: bool,

    /// Treat the command as a long-running service, restarted on each change.
    #[arg(short = 's', long)]
    pub start_service: bool,

    /// Token replaced by the changed path in the command.
    #[arg(long, default_value = DEFAULT_SUBSTITUTE, value_name = "TOKEN")]
    pub substitute: String,

    /// Never run more than one command at a time, across all rules.
    #[arg(short = 'e', long)]
    pub sequential: bool,

    /// Directory to watch (defaults to the current directory).
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// How command output lines are prefixed.
    #[arg(short, long, value_enum)]
    pub decoration: Option<Decoration>,

    /// Notify live-reload clients when the command completes.
    #[arg(long)]
    pub reload: bool,

    /// Address (host:port) of the live-reload WebSocket endpoint.
    #[arg(long, env = "REFLEX_WEBSOCKET_ADDR", value_name = "ADDR")]
    pub websocket_addr: Option<String>,

    /// Log every filesystem event.
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to run; `{}` is replaced by the changed path.
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Whether any per-rule option was given on the command line.
    pub fn has_rule_flags(&self) -> bool {
        self.regex.is_some()
            || self.glob.is_some()
            || self.only_files
            || self.only_dirs
            || self.start_service
            || self.reload
            || !self.command.is_empty()
    }
}
