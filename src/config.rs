use std::time::Duration;

use serde::Serialize;

use crate::date_util::DateStyle;
use crate::error::{Error, Result};
use crate::feed::DEFAULT_APPOINTMENT_TYPE_ID;
use crate::sync::{DeletePolicy, SyncOptions};

/// Prefix of environment variables overriding stored settings.
pub const ENV_PREFIX: &str = "CALLDOC_SYNC_";

pub const KEYS: [&str; 11] = [
    "gateway_url",
    "gateway_database",
    "feed_url",
    "appointment_type_id",
    "delete_policy",
    "compare_billing_fields",
    "composite_fallback",
    "resolve_references",
    "smart_status_filter",
    "date_style",
    "request_timeout_secs",
];

/// Effective settings, resolved from built-in defaults, the `app_config`
/// table, environment variables and CLI flags, in that order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// SQL tool server base URL, or `sqlite:<path>` for a local store.
    pub gateway_url: String,
    pub gateway_database: String,
    /// Full `appointment_search/` endpoint.
    pub feed_url: String,
    pub appointment_type_id: i64,
    pub delete_policy: DeletePolicy,
    pub compare_billing_fields: bool,
    pub composite_fallback: bool,
    pub resolve_references: bool,
    pub smart_status_filter: bool,
    pub date_style: DateStyle,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:7007".to_string(),
            gateway_database: "SQLHK".to_string(),
            feed_url: "http://192.168.1.76:8001/api/v1/frontend/appointment_search/".to_string(),
            appointment_type_id: DEFAULT_APPOINTMENT_TYPE_ID,
            delete_policy: DeletePolicy::Selective,
            compare_billing_fields: false,
            composite_fallback: true,
            resolve_references: true,
            smart_status_filter: true,
            date_style: DateStyle::German,
            request_timeout_secs: 30,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got {value:?}")))
}

impl Settings {
    /// Set one key from its textual form.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "gateway_url" => self.gateway_url = value.trim().to_string(),
            "gateway_database" => self.gateway_database = value.trim().to_string(),
            "feed_url" => self.feed_url = value.trim().to_string(),
            "appointment_type_id" => self.appointment_type_id = parse_number(key, value)?,
            "delete_policy" => self.delete_policy = DeletePolicy::parse(value)?,
            "compare_billing_fields" => self.compare_billing_fields = parse_bool(key, value)?,
            "composite_fallback" => self.composite_fallback = parse_bool(key, value)?,
            "resolve_references" => self.resolve_references = parse_bool(key, value)?,
            "smart_status_filter" => self.smart_status_filter = parse_bool(key, value)?,
            "date_style" => self.date_style = DateStyle::parse(value)?,
            "request_timeout_secs" => self.request_timeout_secs = parse_number(key, value)?,
            other => {
                return Err(Error::Config(format!(
                    "unknown config key: {other} (known: {})",
                    KEYS.join(", ")
                )))
            }
        }
        Ok(())
    }

    /// Apply stored `app_config` pairs. Keys this version does not know are
    /// skipped with a warning.
    pub fn apply_stored(&mut self, pairs: &[(String, String)]) -> Result<()> {
        for (key, value) in pairs {
            if !KEYS.contains(&key.as_str()) {
                log::warn!("Ignoring unknown config key {key}");
                continue;
            }
            self.apply(key, value)?;
        }
        Ok(())
    }

    /// Apply `CALLDOC_SYNC_<KEY>` overrides using `lookup` to read variables.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in KEYS {
            let var = format!("{ENV_PREFIX}{}", key.to_uppercase());
            if let Some(value) = lookup(&var) {
                log::debug!("{var} overrides {key}");
                self.apply(key, &value)?;
            }
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "gateway_url" => self.gateway_url.clone(),
            "gateway_database" => self.gateway_database.clone(),
            "feed_url" => self.feed_url.clone(),
            "appointment_type_id" => self.appointment_type_id.to_string(),
            "delete_policy" => self.delete_policy.as_str().to_string(),
            "compare_billing_fields" => self.compare_billing_fields.to_string(),
            "composite_fallback" => self.composite_fallback.to_string(),
            "resolve_references" => self.resolve_references.to_string(),
            "smart_status_filter" => self.smart_status_filter.to_string(),
            "date_style" => self.date_style.as_str().to_string(),
            "request_timeout_secs" => self.request_timeout_secs.to_string(),
            _ => return None,
        };
        Some(value)
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        KEYS.iter()
            .filter_map(|k| self.get(k).map(|v| (*k, v)))
            .collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            policy: self.delete_policy,
            compare_billing_fields: self.compare_billing_fields,
            composite_fallback: self.composite_fallback,
            resolve_references: self.resolve_references,
            date_style: self.date_style,
            database: self.gateway_database.clone(),
            ..SyncOptions::default()
        }
    }
}
