//! Persisted endpoint and credential.
//!
//! The gateway client never caches these: it asks its [`SettingsStore`] on
//! every connect attempt and again when answering a challenge, so a token the
//! operator fixes between retries is used on the very next attempt.

use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::warn;
use url::Url;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:18789";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub url: Url,
    pub token: String,
}

impl StoredSettings {
    /// Applies defaults. An unparseable stored URL falls back to the default endpoint.
    pub fn resolve(&self) -> Result<ResolvedSettings, url::ParseError> {
        let url = match non_empty(self.ws_url.as_deref()) {
            Some(raw) => match Url::parse(raw) {
                Ok(url) => url,
                Err(err) => {
                    warn!("settings_url_invalid: {raw}: {err}");
                    Url::parse(DEFAULT_WS_URL)?
                }
            },
            None => Url::parse(DEFAULT_WS_URL)?,
        };
        Ok(ResolvedSettings {
            url,
            token: self.token.clone().unwrap_or_default(),
        })
    }

    fn or(self, fallback: StoredSettings) -> StoredSettings {
        StoredSettings {
            ws_url: self.ws_url.or(fallback.ws_url),
            token: self.token.or(fallback.token),
        }
    }
}

pub trait SettingsStore: Send + Sync + 'static {
    fn load(&self) -> StoredSettings;
}

/// TOML file store with flag and environment overrides layered on top.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
    overrides: StoredSettings,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overrides: StoredSettings::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(settings_path())
    }

    pub fn with_url_override(mut self, url: &str) -> Self {
        self.overrides.ws_url = non_empty(Some(url)).map(str::to_string);
        self
    }

    pub fn with_token_override(mut self, token: &str) -> Self {
        self.overrides.token = non_empty(Some(token)).map(str::to_string);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File contents only. Missing file is empty; malformed file is logged and treated as empty.
    pub fn read_file(&self) -> StoredSettings {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return StoredSettings::default();
            }
            Err(err) => {
                warn!("settings_read_error: {}: {err}", self.path.display());
                return StoredSettings::default();
            }
        };
        match toml::from_str(&contents) {
            Ok(settings) => settings,
            Err(err) => {
                warn!("settings_parse_error: {}: {err}", self.path.display());
                StoredSettings::default()
            }
        }
    }

    pub fn save(&self, settings: &StoredSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(settings)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn load(&self) -> StoredSettings {
        let from_env = StoredSettings {
            ws_url: env_value("CLAWS_WS_URL"),
            token: env_value("CLAWS_TOKEN"),
        };
        self.overrides
            .clone()
            .or(from_env)
            .or(self.read_file())
    }
}

/// In-memory store; clones share the same values.
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    inner: Arc<Mutex<StoredSettings>>,
}

impl MemorySettings {
    pub fn new(settings: StoredSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn set_token(&self, token: &str) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).token = Some(token.to_string());
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self) -> StoredSettings {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub fn settings_path() -> PathBuf {
    if let Some(path) = env_value("CLAWS_SETTINGS_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("claws/settings.toml")
}

fn config_dir() -> PathBuf {
    if let Some(path) = env_value("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
