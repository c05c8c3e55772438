//! Daemon configuration.
//!
//! Read from a TOML file; every section is optional and a missing file means
//! defaults. Lookup order: `--config` flag, `FILEWRITER_CONFIG`, then
//! `~/.filewriter/config.toml`.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::session::SessionOptions;

pub const CONFIG_ENV: &str = "FILEWRITER_CONFIG";
pub const SOCKET_ENV: &str = "FILEWRITER_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    pub socket: SocketConfig,
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Messages that may wait for the writer thread before senders block.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub flush_every: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flush_every: SessionOptions::default().flush_every,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.ingest.queue_capacity == 0 {
            return Err("ingest.queue_capacity must be at least 1".to_string());
        }
        if self.storage.flush_every == 0 {
            return Err("storage.flush_every must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            flush_every: self.storage.flush_every,
        }
    }
}

pub fn load_config(path: Option<PathBuf>) -> Result<WriterConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(WriterConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<WriterConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            err
        )
    })?;
    config.validate()?;
    Ok(config)
}

fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(data_dir()?.join("config.toml"))
}

/// Socket path: `--socket` flag, `FILEWRITER_SOCKET`, the config file, then
/// `~/.filewriter/daemon.sock`.
pub fn resolve_socket_path(
    cli_path: Option<PathBuf>,
    config: &WriterConfig,
) -> Result<PathBuf, String> {
    if let Some(path) = cli_path {
        return Ok(path);
    }
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    if let Some(path) = &config.socket.path {
        return Ok(path.clone());
    }
    Ok(data_dir()?.join(SOCKET_NAME))
}

fn data_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".filewriter"))
}
