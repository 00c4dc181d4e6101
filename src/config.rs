//! Service config loading and persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::UserId;
use crate::datastore::DEFAULT_GAP_RESET_LIMIT;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub limits: Limits,
    pub auth: AuthConfig,
    pub groups: GroupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Address of the change feed, `host:port`.
    pub addr: String,
    pub connect_backoff_ms: u64,
    pub connect_backoff_max_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9007".to_string(),
            connect_backoff_ms: 250,
            connect_backoff_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Client socket path; defaults to the runtime directory.
    pub socket_path: Option<PathBuf>,
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(default_socket_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Change-id gap above which the datastore resets instead of filling.
    pub gap_reset_limit: u64,
    pub max_subscribers: usize,
    pub subscriber_queue_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            gap_reset_limit: DEFAULT_GAP_RESET_LIMIT,
            max_subscribers: 1024,
            subscriber_queue_len: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Static token table; connections without a token are anonymous.
    pub tokens: BTreeMap<String, UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub default_group: u64,
    pub admin_group: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            default_group: 1,
            admin_group: 2,
        }
    }
}

fn default_socket_path() -> PathBuf {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime.join("plenum").join("autoupdate.sock")
}

pub fn load(path: &Path) -> Result<Config, ConfigFileError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `path`, falling back to defaults (and writing them out) when the
/// file does not exist yet.
pub fn load_or_init(path: &Path) -> Config {
    if path.exists() {
        match load(path) {
            Ok(config) => return config,
            Err(err) => {
                tracing::warn!("config load failed, using defaults: {err}");
                return Config::default();
            }
        }
    }

    let config = Config::default();
    if let Err(err) = write_config(path, &config) {
        tracing::warn!("failed to write default config: {err}");
    }
    config
}

pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigFileError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| ConfigFileError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let contents = toml::to_string_pretty(config).map_err(|source| ConfigFileError::Render {
        source,
    })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigFileError> {
    let dir = path.parent().ok_or_else(|| ConfigFileError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::other("config path has no parent directory"),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|source| ConfigFileError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    fs::write(temp.path(), data).map_err(|source| ConfigFileError::Write {
        path: temp.path().to_path_buf(),
        source,
    })?;
    temp.persist(path).map_err(|err| ConfigFileError::Write {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to render config")]
    Render { source: toml::ser::Error },
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.upstream.addr = "127.0.0.1:9999".to_string();
        config.limits.gap_reset_limit = 50;
        config.auth.tokens.insert("secret".to_string(), 7);
        config.groups.admin_group = 9;

        write_config(&path, &config).expect("write config");
        let loaded = load(&path).expect("load config");

        assert_eq!(loaded.upstream.addr, "127.0.0.1:9999");
        assert_eq!(loaded.limits.gap_reset_limit, 50);
        assert_eq!(loaded.auth.tokens.get("secret"), Some(&7));
        assert_eq!(loaded.groups.admin_group, 9);
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.limits.gap_reset_limit, DEFAULT_GAP_RESET_LIMIT);
        assert_eq!(config.groups.default_group, 1);
        assert_eq!(config.groups.admin_group, 2);
        assert!(config.auth.tokens.is_empty());
        assert!(config.server.socket_path().ends_with("autoupdate.sock"));
    }

    #[test]
    fn load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let config = load_or_init(&path);
        assert!(path.exists());
        assert_eq!(config.limits.gap_reset_limit, DEFAULT_GAP_RESET_LIMIT);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[upstream]\naddr = \"10.0.0.1:9007\"\n").unwrap();
        let config = load(&path).expect("load config");
        assert_eq!(config.upstream.addr, "10.0.0.1:9007");
        assert_eq!(config.limits.gap_reset_limit, DEFAULT_GAP_RESET_LIMIT);
    }
}
