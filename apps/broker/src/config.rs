use std::{collections::HashMap, fs};

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub bind_addr: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".into(),
        }
    }
}

pub fn load_settings() -> BrokerSettings {
    let raw = fs::read_to_string("broker.toml").ok();
    settings_from(raw.as_deref(), |key| std::env::var(key).ok())
}

pub(crate) fn settings_from(raw: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> BrokerSettings {
    let mut settings = BrokerSettings::default();

    if let Some(raw) = raw {
        match toml::from_str::<HashMap<String, String>>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("bind_addr") {
                    settings.bind_addr = v.clone();
                }
            }
            Err(err) => warn!(error = %err, "config: ignoring unparsable broker.toml"),
        }
    }

    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
