//! Server configuration: TOML file + CLI overrides.

use crate::session::SpawnOptions;
use crate::transport::websocket::DEFAULT_MAX_MESSAGE_SIZE;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::sync::Semaphore;
use tracing::info;
use webssh_core::{WebsshError, WebsshResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub recording: RecordingSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// `[shell]` section: what each session runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    /// Program to run; the user's `$SHELL` when unset.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// `[recording]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_recording_dir")]
    pub dir: String,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_recording_dir(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8022
}
fn default_max_sessions() -> usize {
    100
}
fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_recording_dir() -> String {
    "~/.webssh/recordings".to_string()
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub record_dir: Option<String>,
    pub max_sessions: Option<usize>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_sessions: usize,
    pub max_message_size: usize,
    pub spawn: SpawnOptions,
    /// Directory for session recordings; `None` disables recording.
    pub recording_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> WebsshResult<Self> {
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
        Self::resolve(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides.
    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> WebsshResult<Self> {
        let bind = cli.bind.unwrap_or(file.server.bind);
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| WebsshError::Other(format!("invalid bind address {bind:?}: {e}")))?;
        let port = cli.port.unwrap_or(file.server.port);

        if file.shell.cols == 0 || file.shell.rows == 0 {
            return Err(WebsshError::Other(
                "shell.cols and shell.rows must be positive".into(),
            ));
        }

        let max_sessions = cli.max_sessions.unwrap_or(file.server.max_sessions);
        if max_sessions == 0 || max_sessions > Semaphore::MAX_PERMITS {
            return Err(WebsshError::Other(format!(
                "max_sessions must be between 1 and {}, got {max_sessions}",
                Semaphore::MAX_PERMITS
            )));
        }

        let (command, args) = match cli.command {
            Some(command) => (Some(command), cli.args),
            None if !cli.args.is_empty() => (file.shell.command, cli.args),
            None => (file.shell.command, file.shell.args),
        };

        let recording_dir = match cli.record_dir {
            Some(dir) => Some(expand_tilde_str(&dir)),
            None if file.recording.enabled => Some(expand_tilde_str(&file.recording.dir)),
            None => None,
        };

        Ok(Self {
            listen_addr: SocketAddr::new(ip, port),
            max_sessions,
            max_message_size: file.server.max_message_size,
            spawn: SpawnOptions {
                command,
                args,
                cols: file.shell.cols,
                rows: file.shell.rows,
                env: file.shell.env,
            },
            recording_dir,
        })
    }
}

fn parse_config(content: &str) -> WebsshResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| WebsshError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
