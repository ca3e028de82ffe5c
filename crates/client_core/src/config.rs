use std::{collections::HashMap, fs, path::Path, time::Duration};

use tracing::warn;

const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub broker_url: String,
    pub database_url: String,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub publish_queue_limit: usize,
    pub catch_up_limit: u32,
    pub history_page_size: u32,
    pub optimistic_delivery: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8787/ws".into(),
            database_url: "sqlite://./data/client.db".into(),
            reconnect_initial_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            publish_queue_limit: 500,
            catch_up_limit: 500,
            history_page_size: 200,
            optimistic_delivery: true,
        }
    }
}

impl ClientSettings {
    /// Applies keys from a `client.toml` body. Unknown keys and values of
    /// the wrong type are ignored.
    pub fn apply_file(&mut self, raw: &str) {
        let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => file_cfg,
            Err(err) => {
                warn!(error = %err, "config: ignoring unparsable settings file");
                return;
            }
        };

        let text = |key: &str| file_cfg.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let int = |key: &str| {
            file_cfg
                .get(key)
                .and_then(toml::Value::as_integer)
                .and_then(|v| u64::try_from(v).ok())
        };

        if let Some(v) = text("broker_url") {
            self.broker_url = v;
        }
        if let Some(v) = text("database_url") {
            self.database_url = v;
        }
        if let Some(v) = int("reconnect_initial_backoff_ms") {
            self.reconnect_initial_backoff = Duration::from_millis(v);
        }
        if let Some(v) = int("reconnect_max_backoff_ms") {
            self.reconnect_max_backoff = Duration::from_millis(v);
        }
        if let Some(v) = int("connect_timeout_secs") {
            self.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = int("health_check_secs") {
            self.health_check_interval = Duration::from_secs(v);
        }
        if let Some(v) = int("publish_queue_limit").and_then(|v| usize::try_from(v).ok()) {
            self.publish_queue_limit = v;
        }
        if let Some(v) = int("catch_up_limit").and_then(|v| u32::try_from(v).ok()) {
            self.catch_up_limit = v;
        }
        if let Some(v) = int("history_page_size").and_then(|v| u32::try_from(v).ok()) {
            self.history_page_size = v;
        }
        if let Some(v) = file_cfg.get("optimistic_delivery").and_then(toml::Value::as_bool) {
            self.optimistic_delivery = v;
        }
    }

    /// Applies `APP__*` overrides through `lookup` (normally the process
    /// environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("APP__BROKER_URL") {
            self.broker_url = v;
        }
        if let Some(v) = lookup("APP__DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("APP__HEALTH_CHECK_SECS").and_then(|v| v.parse().ok()) {
            self.health_check_interval = Duration::from_secs(v);
        }
        if let Some(v) = lookup("APP__PUBLISH_QUEUE_LIMIT").and_then(|v| v.parse().ok()) {
            self.publish_queue_limit = v;
        }
        if let Some(v) = lookup("APP__CATCH_UP_LIMIT").and_then(|v| v.parse().ok()) {
            self.catch_up_limit = v;
        }
        if let Some(v) = lookup("APP__OPTIMISTIC_DELIVERY").and_then(|v| parse_flag(&v)) {
            self.optimistic_delivery = v;
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        settings.apply_file(&raw);
    }
    settings.apply_env(|key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    settings
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
