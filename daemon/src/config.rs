use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cli::Cli;

pub const DEFAULT_SUBSTITUTE: &str = "{}";
pub const DEFAULT_ROOT: &str = ".";

/// Root configuration structure. Deserialized from the file passed to
/// `--config`, or assembled from command-line flags.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Directory tree to watch.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Serialize command execution across every rule.
    #[serde(default)]
    pub sequential: bool,
    /// Prefix style for command output.
    #[serde(default)]
    pub decoration: Decoration,
    /// host:port for the live-reload endpoint; no server is started when unset.
    #[serde(default)]
    pub websocket_addr: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// How output lines are attributed to the rule that produced them.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Decoration {
    /// The raw line.
    None,
    /// `[NN] line`.
    #[default]
    Plain,
    /// `[NN] line` with a per-rule colour.
    Fancy,
}

/// One watch-pattern-command directive.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuleConfig {
    /// Shell-style pattern. Mutually exclusive with `regex`.
    pub glob: Option<String>,
    /// Regular expression. Mutually exclusive with `glob`.
    pub regex: Option<String>,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Token replaced by the changed path in every argument.
    #[serde(default = "default_substitute")]
    pub substitute: String,
    #[serde(default)]
    pub only_files: bool,
    #[serde(default)]
    pub only_dirs: bool,
    /// Restart the command on each change instead of running it to completion.
    #[serde(default)]
    pub start_service: bool,
    /// Notify live-reload clients after each run.
    #[serde(default)]
    pub reload: bool,
}

impl RuleConfig {
    /// Rejects combinations that can never do anything useful.
    pub fn validate(&self) -> Result<()> {
        if self.glob.is_some() && self.regex.is_some() {
            bail!("glob and regex are mutually exclusive");
        }
        if self.only_files && self.only_dirs {
            bail!("only_files and only_dirs are mutually exclusive");
        }
        if self.command.is_empty() || self.command[0].is_empty() {
            bail!("command must not be empty");
        }
        if self.substitute.is_empty() {
            bail!("substitute token must not be empty");
        }
        Ok(())
    }
}

/// Loads and validates the config file at `path`.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    validate_rules(&config.rules)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Builds the effective configuration from the command line, reading the
/// config file when one is given. Global flags on the command line override
/// the file's values.
pub fn resolve(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            if cli.has_rule_flags() {
                bail!("--config cannot be combined with rule flags or a command");
            }
            load(path)?
        }
        None => {
            if cli.command.is_empty() {
                bail!("no command given (pass one after `--`, or use --config)");
            }
            let rule = RuleConfig {
                glob: cli.glob.clone(),
                regex: cli.regex.clone(),
                command: cli.command.clone(),
                substitute: cli.substitute.clone(),
                only_files: cli.only_files,
                only_dirs: cli.only_dirs,
                start_service: cli.start_service,
                reload: cli.reload,
            };
            let rules = vec![rule];
            validate_rules(&rules)?;
            Config {
                root: default_root(),
                sequential: false,
                decoration: Decoration::default(),
                websocket_addr: None,
                rules,
            }
        }
    };

    config.sequential |= cli.sequential;
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(decoration) = cli.decoration {
        config.decoration = decoration;
    }
    if cli.websocket_addr.is_some() {
        config.websocket_addr = cli.websocket_addr.clone();
    }
    Ok(config)
}

fn validate_rules(rules: &[RuleConfig]) -> Result<()> {
    if rules.is_empty() {
        bail!("no rules configured");
    }
    for (i, rule) in rules.iter().enumerate() {
        rule.validate().with_context(|| format!("rule {i}"))?;
    }
    Ok(())
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_substitute() -> String {
    DEFAULT_SUBSTITUTE.to_string()
}
