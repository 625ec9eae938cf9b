//! Configuration: TOML file + CLI overrides.

use crate::session::DEFAULT_REPLAY_CAPACITY;
use kastty_core::{KasttyError, KasttyResult};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    #[serde(default)]
    pub readonly: bool,
    /// Maximum concurrent viewers; absent or 0 means unlimited.
    #[serde(default)]
    pub max_viewers: Option<usize>,
    #[serde(default)]
    pub log_titles: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            replay_buffer_bytes: default_replay_buffer_bytes(),
            readonly: false,
            max_viewers: None,
            log_titles: false,
        }
    }
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// 0 lets the OS pick a free port.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 0,
            bind: default_bind(),
        }
    }
}

fn default_replay_buffer_bytes() -> usize {
    DEFAULT_REPLAY_CAPACITY
}
fn default_bind() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub readonly: bool,
    pub replay_buffer_bytes: Option<usize>,
    pub max_viewers: Option<usize>,
    pub log_titles: bool,
}

/// Resolved configuration (file defaults, then CLI overrides).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub command: String,
    pub args: Vec<String>,
    pub port: u16,
    pub bind: IpAddr,
    pub readonly: bool,
    pub replay_buffer_bytes: usize,
    pub max_viewers: Option<usize>,
    pub log_titles: bool,
}

impl Config {
    /// Load config from a TOML file (missing file means defaults), then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        command: Option<String>,
        args: Vec<String>,
        cli: &CliOverrides,
    ) -> KasttyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::merge(file_config, command, args, cli))
    }

    fn merge(file: ConfigFile, command: Option<String>, args: Vec<String>, cli: &CliOverrides) -> Self {
        let (command, args) = match command {
            Some(command) => (command, args),
            None => (default_shell(), Vec::new()),
        };

        let replay_buffer_bytes = positive(cli.replay_buffer_bytes)
            .or(positive(Some(file.session.replay_buffer_bytes)))
            .unwrap_or(DEFAULT_REPLAY_CAPACITY);
        let max_viewers = positive(cli.max_viewers).or(positive(file.session.max_viewers));

        Self {
            command,
            args,
            port: cli.port.unwrap_or(file.server.port),
            bind: file.server.bind,
            readonly: cli.readonly || file.session.readonly,
            replay_buffer_bytes,
            max_viewers,
            log_titles: cli.log_titles || file.session.log_titles,
        }
    }
}

pub fn parse_config(content: &str) -> KasttyResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content).map_err(|e| KasttyError::Config(format!("config parse error: {e}")))
}

fn positive(value: Option<usize>) -> Option<usize> {
    value.filter(|v| *v > 0)
}

/// `$SHELL`, or `/bin/sh` when unset or empty.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
