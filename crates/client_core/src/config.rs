use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::transport::{websocket_url, ReconnectPolicy};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub websocket_url: Option<String>,
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub history_limit: u32,
    pub database_url: String,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub typing_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".into(),
            websocket_url: None,
            token: String::new(),
            user_id: String::new(),
            username: String::new(),
            display_name: String::new(),
            history_limit: 50,
            database_url: "sqlite://./data/chat_cache.db".into(),
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            typing_timeout_ms: 2_000,
        }
    }
}

impl ClientSettings {
    pub fn history_limit(&self) -> u32 {
        self.history_limit.clamp(1, 100)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms.max(1)),
            max_delay: Duration::from_millis(
                self.reconnect_max_delay_ms.max(self.reconnect_initial_delay_ms),
            ),
        }
    }

    /// Reactions are keyed by user id, so a session without one cannot start.
    pub fn require_identity(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            bail!("a session token is required (--token or CHAT_TOKEN)");
        }
        if self.user_id.trim().is_empty() {
            bail!("a user id is required (--user-id or CHAT_USER_ID)");
        }
        Ok(())
    }

    pub fn resolved_websocket_url(&self) -> Result<String> {
        match &self.websocket_url {
            Some(url) if !url.trim().is_empty() => Ok(url.trim().to_string()),
            _ => websocket_url(&self.server_url),
        }
    }
}

/// Defaults, then the TOML file at `path` (if any), then `CHAT_*` variables.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let mut settings = match path {
        Some(path) if path.exists() => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config '{}'", path.display()))?;
            toml::from_str::<ClientSettings>(&raw)
                .with_context(|| format!("invalid config '{}'", path.display()))?
        }
        _ => ClientSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("CHAT_WS_URL") {
        settings.websocket_url = Some(v);
    }
    if let Some(v) = var("CHAT_TOKEN") {
        settings.token = v;
    }
    if let Some(v) = var("CHAT_USER_ID") {
        settings.user_id = v;
    }
    if let Some(v) = var("CHAT_USERNAME") {
        settings.username = v;
    }
    if let Some(v) = var("CHAT_DISPLAY_NAME") {
        settings.display_name = v;
    }
    if let Some(v) = var("CHAT_HISTORY_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_limit = parsed;
        }
    }
    if let Some(v) = var("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
