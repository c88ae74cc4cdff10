//! Server configuration: TOML file + CLI overrides.

use hpcsh_core::HpcshResult;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub slurm: SlurmSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[terminal]` section: PTY geometry and relay tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    /// Interactive shell started inside the allocation.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Bounded wait of the relay loop, so liveness can be re-checked even
    /// when the child is silent.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Read chunk size. 4096 balances keystroke latency against syscall
    /// overhead for interactive traffic.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            rows: default_rows(),
            cols: default_cols(),
            poll_interval_ms: default_poll_interval_ms(),
            read_chunk_bytes: default_read_chunk_bytes(),
        }
    }
}

/// `[slurm]` section: resource-manager command names.
#[derive(Debug, Clone, Deserialize)]
pub struct SlurmSection {
    /// Allocator command. An empty string launches the shell directly with
    /// no allocation wrapper (degraded mode for hosts without a scheduler).
    #[serde(default = "default_salloc")]
    pub salloc: String,
    #[serde(default = "default_scancel")]
    pub scancel: String,
}

impl Default for SlurmSection {
    fn default() -> Self {
        Self {
            salloc: default_salloc(),
            scancel: default_scancel(),
        }
    }
}

fn default_port() -> u16 {
    8090
}
fn default_max_sessions() -> usize {
    64
}
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_read_chunk_bytes() -> usize {
    4096
}
fn default_salloc() -> String {
    "salloc".to_string()
}
fn default_scancel() -> String {
    "scancel".to_string()
}

/// Resolved server configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_sessions: usize,
    pub terminal: TerminalSection,
    pub slurm: SlurmSection,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_shell: Option<&str>,
        cli_max_sessions: Option<usize>,
    ) -> HpcshResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    hpcsh_core::HpcshError::Other(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let mut terminal = file_config.terminal;
        if let Some(shell) = cli_shell {
            terminal.shell = shell.to_string();
        }

        Ok(Self {
            port: cli_port.unwrap_or(file_config.server.port),
            max_sessions: cli_max_sessions.unwrap_or(file_config.server.max_sessions),
            terminal,
            slurm: file_config.slurm,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_sessions: default_max_sessions(),
            terminal: TerminalSection::default(),
            slurm: SlurmSection::default(),
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, None, None, None).unwrap();
        assert_eq!(cfg.port, 8090);
        assert_eq!(cfg.max_sessions, 64);
        assert_eq!(cfg.terminal.read_chunk_bytes, 4096);
        assert_eq!(cfg.slurm.salloc, "salloc");
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let cfg = ServerConfig::load(None, Some(9000), Some("/bin/zsh"), Some(8)).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.terminal.shell, "/bin/zsh");
        assert_eq!(cfg.max_sessions, 8);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 7000

            [slurm]
            salloc = ""
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.port, 7000);
        assert_eq!(parsed.server.max_sessions, 64);
        assert_eq!(parsed.slurm.salloc, "");
        assert_eq!(parsed.slurm.scancel, "scancel");
        assert_eq!(parsed.terminal.rows, 24);
    }
}
