use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use client_core::SyncConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub realtime_url: Option<String>,
    pub database_url: String,
    pub sync: SyncConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".into(),
            api_key: "anon-key".into(),
            access_token: None,
            realtime_url: None,
            database_url: "sqlite://./data/client.db".into(),
            sync: SyncConfig::default(),
        }
    }
}

/// `client.toml` layout. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    backend_url: Option<String>,
    api_key: Option<String>,
    access_token: Option<String>,
    realtime_url: Option<String>,
    database_url: Option<String>,
    sync: Option<SyncConfig>,
}

/// Command-line overrides, applied last.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub database_url: Option<String>,
}

pub fn load_settings(config_path: &Path, overrides: &Overrides) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(config_path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid settings file '{}'", config_path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read '{}'", config_path.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    apply_overrides(&mut settings, overrides);
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file.backend_url {
        settings.backend_url = v;
    }
    if let Some(v) = file.api_key {
        settings.api_key = v;
    }
    if file.access_token.is_some() {
        settings.access_token = file.access_token;
    }
    if file.realtime_url.is_some() {
        settings.realtime_url = file.realtime_url;
    }
    if let Some(v) = file.database_url {
        settings.database_url = v;
    }
    if let Some(sync) = file.sync {
        settings.sync = sync;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = var("APP__API_KEY") {
        settings.api_key = v;
    }
    if let Some(v) = var("APP__ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }
    if let Some(v) = var("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("APP__STORAGE_NAMESPACE") {
        settings.sync.storage_namespace = v;
    }
    if let Some(parsed) = var("APP__QUEUE_MAX_RETRIES").and_then(|v| v.parse().ok()) {
        settings.sync.queue_max_retries = parsed;
    }
    if let Some(parsed) = var("APP__RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.sync.reconnect_max_attempts = parsed;
    }
}

fn apply_overrides(settings: &mut Settings, overrides: &Overrides) {
    if let Some(v) = &overrides.backend_url {
        settings.backend_url = v.clone();
    }
    if let Some(v) = &overrides.api_key {
        settings.api_key = v.clone();
    }
    if let Some(v) = &overrides.access_token {
        settings.access_token = Some(v.clone());
    }
    if let Some(v) = &overrides.database_url {
        settings.database_url = v.clone();
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
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

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(parent) = sqlite_path(database_url).and_then(|path| path.parent().map(Path::to_path_buf))
    else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&parent).with_context(|| {
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

    if path.is_empty() {
        return None;
    }

    Some(PathBuf::from(path))
}
