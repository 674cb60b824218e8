//! Engine configuration
//!
//! `EngineConfig` is fixed for the lifetime of an engine. `EngineOptions` is the
//! part that `switch` can change, one `SwitchOptions` partial update at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::EngineError;

pub const DEFAULT_ENGINE_ID: &str = "filesystem";
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;
pub const BASE_URL_ENV: &str = "TREESYNC_BASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Working directory must be absolute: {0}")]
    RelativeCwd(PathBuf),
}

/// Construction-time settings of one engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Key of the replicated-state slot the engine publishes into
    pub id: String,
    /// Working root: tree paths are exposed relative to it and relative dirnames resolve against it
    pub cwd: PathBuf,
    /// Prefixed to every public url when set
    pub base_url: Option<String>,
    pub debounce_ms: u64,
    /// Upper bound on how long a continuous stream of events may hold back a flush
    pub max_delay_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self {
            id: DEFAULT_ENGINE_ID.to_string(),
            cwd,
            base_url: None,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_delay_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn with_cwd(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        tracing::debug!(path = %path.display(), id = %config.id, "Loaded engine config");
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            tracing::debug!(base_url = %base_url, "Base url overridden from environment");
            self.base_url = Some(base_url).filter(|b| !b.is_empty());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cwd.is_absolute() {
            return Err(ConfigError::RelativeCwd(self.cwd.clone()));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }
}

/// Current watch settings of an engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    /// Directory to watch, the engine is idle when `None`
    pub dirname: Option<String>,
    /// Url prefix the directory is served under
    pub public_path: Option<String>,
    /// Maximum watch and traversal depth, unlimited when `None`
    pub depth: Option<usize>,
}

impl EngineOptions {
    pub fn apply(&mut self, update: SwitchOptions) {
        self.dirname = update.dirname;
        if let Some(public_path) = update.public_path {
            self.public_path = public_path;
        }
        if let Some(depth) = update.depth {
            self.depth = depth;
        }
    }

    /// Public path that needs a static mount: empty and `/` only decorate urls
    pub fn mount_prefix(&self) -> Option<String> {
        let public_path = self.public_path.as_deref()?;
        let trimmed = public_path.trim_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        Some(format!("/{trimmed}"))
    }
}

/// Partial update applied by `switch`
///
/// `dirname` is always replaced. The outer `Option` of the other fields says
/// whether they change at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchOptions {
    pub dirname: Option<String>,
    pub public_path: Option<Option<String>>,
    pub depth: Option<Option<usize>>,
}

impl SwitchOptions {
    pub fn dirname(dirname: impl Into<String>) -> Self {
        Self {
            dirname: Some(dirname.into()),
            ..Self::default()
        }
    }

    pub fn idle() -> Self {
        Self::default()
    }

    pub fn with_public_path(mut self, public_path: impl Into<String>) -> Self {
        self.public_path = Some(Some(public_path.into()));
        self
    }

    pub fn without_public_path(mut self) -> Self {
        self.public_path = Some(None);
        self
    }

    pub fn with_depth(mut self, depth: Option<usize>) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Parse `{ dirname, publicPath?, depth? }` as sent by remote callers
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let Value::Object(map) = value else {
            return Err(EngineError::InvalidOption(
                "options should be an object of type { dirname[, publicPath, depth] }".to_string(),
            ));
        };

        let dirname = match map.get("dirname") {
            None => {
                return Err(EngineError::InvalidOption("\"dirname\" is mandatory".to_string()));
            }
            Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(EngineError::InvalidOption(
                    "\"dirname\" should be a string or null".to_string(),
                ));
            }
        };

        let public_path = match map.get("publicPath") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(Value::String(s)) => Some(Some(s.clone())),
            Some(_) => {
                return Err(EngineError::InvalidOption(
                    "\"publicPath\" should be a string or null".to_string(),
                ));
            }
        };

        let depth = match map.get("depth") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(value) => match value.as_u64() {
                Some(depth) => Some(Some(depth as usize)),
                None => {
                    return Err(EngineError::InvalidOption(
                        "\"depth\" should be a non-negative integer or null".to_string(),
                    ));
                }
            },
        };

        let options = Self {
            dirname,
            public_path,
            depth,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(dirname) = &self.dirname {
            if dirname.trim().is_empty() {
                return Err(EngineError::InvalidOption(
                    "\"dirname\" should not be empty, use null to go idle".to_string(),
                ));
            }
        }
        Ok(())
    }
}
