//! Persisted client state
//!
//! Two JSON files under a user-scoped directory (`~/.outpost` by default):
//! `config.json` holds the configured edge domain, `status.json` mirrors the
//! live connection and is removed on disconnect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const CONFIG_FILE: &str = "config.json";
const STATUS_FILE: &str = "status.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to locate home directory")]
    NoHomeDir,

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Contents of `config.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub domain: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contents of `status.json`, present only while connected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusFile {
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
    pub port: u16,
    pub domain: String,
}

/// Validate and normalize an edge URL: scheme must be http(s), trailing
/// slash is trimmed, the remainder must parse as a URL.
pub fn normalize_domain(url: &str) -> Result<String, ConfigError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: "must begin with http:// or https://".to_string(),
        });
    }

    let trimmed = url.trim_end_matches('/');

    Url::parse(trimmed).map_err(|e| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    Ok(trimmed.to_string())
}

/// Manages the client's persisted files
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Store under the default user-scoped directory
    pub fn new() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(Self {
            dir: home.join(".outpost"),
        })
    }

    /// Store rooted at an explicit directory
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the configuration, if one has been written
    pub fn load(&self) -> Result<Option<ClientConfig>, ConfigError> {
        self.read_json(CONFIG_FILE)
    }

    /// Persist a validated domain.
    ///
    /// `createdAt` is preserved across re-inits; `updatedAt` always moves.
    pub fn save_domain(&self, domain: &str) -> Result<ClientConfig, ConfigError> {
        let now = Utc::now();
        let created_at = self
            .load()?
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let config = ClientConfig {
            domain: domain.to_string(),
            created_at,
            updated_at: now,
        };

        self.write_json(CONFIG_FILE, &config)?;
        Ok(config)
    }

    /// Write `status.json` on connect
    pub fn write_status(&self, domain: &str, port: u16) -> Result<StatusFile, ConfigError> {
        let status = StatusFile {
            connected: true,
            connected_at: Utc::now(),
            port,
            domain: domain.to_string(),
        };
        self.write_json(STATUS_FILE, &status)?;
        Ok(status)
    }

    /// Read `status.json`, if present
    pub fn read_status(&self) -> Result<Option<StatusFile>, ConfigError> {
        self.read_json(STATUS_FILE)
    }

    /// Remove `status.json` on disconnect
    pub fn clear_status(&self) {
        let _ = fs::remove_file(self.dir.join(STATUS_FILE));
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;

        let value = serde_json::from_str(&json).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            source: e,
        })?;

        Ok(Some(value))
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir).map_err(|e| ConfigError::Io {
            path: self.dir.clone(),
            source: e,
        })?;

        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            source: e,
        })?;

        fs::write(&path, json).map_err(|e| ConfigError::Io { path, source: e })
    }
}
