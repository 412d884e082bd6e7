use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
        }
    }
}

impl ReconnectSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub base_url: String,
    pub base_path: String,
    pub session_database_url: String,
    pub request_timeout_secs: u64,
    pub history_page_size: u32,
    pub history_max_pages: u32,
    pub pending_read_ttl_secs: u64,
    pub reconnect: ReconnectSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            base_path: "/api".into(),
            session_database_url: "sqlite://./data/session.db".into(),
            request_timeout_secs: 30,
            history_page_size: 50,
            history_max_pages: 20,
            pending_read_ttl_secs: 30,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn for_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn api_root(&self) -> String {
        let base_url = self.base_url.trim_end_matches('/');
        let base_path = self.base_path.trim_matches('/');
        if base_path.is_empty() {
            base_url.to_string()
        } else {
            format!("{base_url}/{base_path}")
        }
    }

    pub fn live_root(&self) -> Result<String> {
        let api_root = self.api_root();
        if let Some(rest) = api_root.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = api_root.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(anyhow!(
                "base_url must start with http:// or https://, got '{}'",
                self.base_url
            ))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn pending_read_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_read_ttl_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    base_url: Option<String>,
    base_path: Option<String>,
    session_database_url: Option<String>,
    request_timeout_secs: Option<u64>,
    history_page_size: Option<u32>,
    history_max_pages: Option<u32>,
    pending_read_ttl_secs: Option<u64>,
    reconnect: Option<FileReconnectSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct FileReconnectSettings {
    enabled: Option<bool>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

/// Defaults, then `client.toml` in the working directory, then `APP__*`
/// environment variables.
pub fn load_settings() -> Result<ClientSettings> {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

pub fn load_settings_from(path: &Path) -> Result<ClientSettings> {
    let mut settings = ClientSettings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        apply_file_settings(&mut settings, file_cfg);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.base_url {
        settings.base_url = v;
    }
    if let Some(v) = file_cfg.base_path {
        settings.base_path = v;
    }
    if let Some(v) = file_cfg.session_database_url {
        settings.session_database_url = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = file_cfg.history_page_size {
        settings.history_page_size = v;
    }
    if let Some(v) = file_cfg.history_max_pages {
        settings.history_max_pages = v;
    }
    if let Some(v) = file_cfg.pending_read_ttl_secs {
        settings.pending_read_ttl_secs = v;
    }
    if let Some(reconnect) = file_cfg.reconnect {
        if let Some(v) = reconnect.enabled {
            settings.reconnect.enabled = v;
        }
        if let Some(v) = reconnect.max_attempts {
            settings.reconnect.max_attempts = v;
        }
        if let Some(v) = reconnect.base_delay_ms {
            settings.reconnect.base_delay_ms = v;
        }
        if let Some(v) = reconnect.max_delay_ms {
            settings.reconnect.max_delay_ms = v;
        }
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__BASE_URL") {
        settings.base_url = v;
    }
    if let Some(v) = var("APP__BASE_PATH") {
        settings.base_path = v;
    }
    if let Some(v) = var("APP__SESSION_DATABASE_URL") {
        settings.session_database_url = v;
    }
    if let Some(v) = parse_override(&var, "APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = parse_override(&var, "APP__HISTORY_PAGE_SIZE") {
        settings.history_page_size = v;
    }
    if let Some(v) = parse_override(&var, "APP__RECONNECT_MAX_ATTEMPTS") {
        settings.reconnect.max_attempts = v;
    }
}

fn parse_override<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring unparseable override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
