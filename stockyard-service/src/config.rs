//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: STOCKYARD_, `__` as the section separator)
//! 2. ./config.toml (or an explicit path via [`Config::load_from`])
//! 3. Default values
//!
//! A `.env` file is loaded into the process environment first, and any string
//! value of the form `$dotted.key` anywhere in the vendor tables or the
//! database URL resolves through the environment table (`$api.key` →
//! `API_KEY`). Secrets therefore live in `.env`, never in `config.toml`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Database configuration (optional; the broker runs without persistence)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Scheduler daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Per-vendor settings, keyed by vendor name
    #[serde(default)]
    pub vendors: BTreeMap<String, VendorConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    #[serde(default = "default_name")]
    pub name: String,

    /// Host the HTTP front-end binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Directory holding request template files
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            timeout_secs: default_timeout(),
            templates_dir: default_templates_dir(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL (may be a `$ref` into the environment)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Scheduler daemon configuration
///
/// `start` and `stop` are offsets into the day (`HH:MM:SS`); `interval` is an
/// ISO-8601 duration. The daemon fires `(stop - start) / interval` cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Whether the daemon runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Offset-of-day at which the first cycle may fire
    #[serde(default = "default_daemon_start")]
    pub start: String,

    /// Offset-of-day after which no cycle fires
    #[serde(default = "default_daemon_stop")]
    pub stop: String,

    /// Cadence between cycles
    #[serde(default = "default_daemon_interval")]
    pub interval: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start: default_daemon_start(),
            stop: default_daemon_stop(),
            interval: default_daemon_interval(),
        }
    }
}

/// Free-form per-vendor settings table
///
/// Vendor modules pull what they need via the typed accessors; unknown keys
/// are preserved so a vendor can grow settings without touching this file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VendorConfig {
    #[serde(flatten)]
    settings: BTreeMap<String, serde_json::Value>,
}

impl VendorConfig {
    /// String setting, if present
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    /// String setting, required
    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key)
            .map(str::to_owned)
            .ok_or_else(|| Error::BadRequest(format!("missing vendor setting `{key}`")))
    }

    /// Integer setting, if present
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }

    /// Insert a setting (used by tests and programmatic construction)
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.settings.insert(key.into(), value.into());
    }
}

impl Config {
    /// Load configuration from `./config.toml`, the environment, and `.env`
    pub fn load() -> Result<Self> {
        // Missing .env is fine; the environment may already be populated
        let _ = dotenvy::dotenv();
        Self::extract(Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("STOCKYARD_").split("__")))
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses the default search path; useful for tests and non-standard
    /// deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::extract(Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("STOCKYARD_").split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let mut config: Config = figment.extract()?;
        config.resolve_refs()?;
        Ok(config)
    }

    /// Resolve `$dotted.key` references through the environment table
    fn resolve_refs(&mut self) -> Result<()> {
        if let Some(db) = self.database.as_mut() {
            db.url = resolve_ref(&db.url)?;
        }
        for vendor in self.vendors.values_mut() {
            for value in vendor.settings.values_mut() {
                if let Some(s) = value.as_str() {
                    let resolved = resolve_ref(s)?;
                    if resolved != s {
                        *value = serde_json::Value::String(resolved);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Map `$dotted.key` to the environment variable `DOTTED_KEY`
fn resolve_ref(value: &str) -> Result<String> {
    match value.strip_prefix('$') {
        Some(name) => {
            let key = name.replace('.', "_").to_uppercase();
            std::env::var(&key).map_err(|_| Error::UnresolvedRef(value.to_string()))
        }
        None => Ok(value.to_string()),
    }
}

// Default value functions
fn default_name() -> String {
    "stockyard".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8118
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_templates_dir() -> String {
    "templates".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_daemon_start() -> String {
    "09:30:00".to_string()
}

fn default_daemon_stop() -> String {
    "16:00:00".to_string()
}

fn default_daemon_interval() -> String {
    "PT15M".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.service.port, 8118);
        assert_eq!(config.daemon.interval, "PT15M");
        assert!(config.database.is_none());
        assert!(config.vendors.is_empty());
    }

    #[test]
    fn loads_vendor_tables_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [service]
            name = "stockyard-test"
            port = 9000

            [vendors.fred]
            api_key = "plain-key"

            [vendors.ibkr]
            host = "127.0.0.1"
            port = 4002
            client_id = 100
            "#
        )
        .unwrap();

        let config = Config::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.service.name, "stockyard-test");
        assert_eq!(config.service.port, 9000);
        assert_eq!(config.vendors["fred"].get_str("api_key"), Some("plain-key"));
        assert_eq!(config.vendors["ibkr"].get_u64("port"), Some(4002));
    }

    #[test]
    fn dollar_refs_resolve_through_env() {
        std::env::set_var("FRED_API_KEY", "sekrit");
        assert_eq!(resolve_ref("$fred.api_key").unwrap(), "sekrit");
        assert_eq!(resolve_ref("$FRED_API_KEY").unwrap(), "sekrit");
        assert_eq!(resolve_ref("no-ref").unwrap(), "no-ref");
        assert!(resolve_ref("$does.not.exist").is_err());
    }
}
