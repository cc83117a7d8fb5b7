//! Configuration for recwatch.
//!
//! Layers, lowest to highest precedence: defaults, optional TOML file,
//! environment variables, CLI arguments. `validate` then turns missing
//! required settings into fatal errors before anything is scheduled.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use recwatch_common::{validate_identifier, ClickHouseConfig};
use serde::Deserialize;

use crate::differ::DifferConfig;
use crate::schedule::{Recurrence, DEFAULT_RECURRENCE};

/// Environment variable names.
pub const ENV_STORE_URI: &str = "STORE_URI";
pub const ENV_DB_NAME: &str = "DB_NAME";
pub const ENV_COLLECTION_NAME: &str = "COLLECTION_NAME";
pub const ENV_CRON_INTERVAL: &str = "CRON_INTERVAL";
pub const ENV_STORE_USER: &str = "STORE_USER";
pub const ENV_STORE_PASSWORD: &str = "STORE_PASSWORD";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Connection settings; url and database are required.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    pub url: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Top-level configuration for recwatch.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub log_level: String,
    pub store: StoreSettings,
    pub collections: Vec<String>,
    pub schedule: String,
    pub differ: DifferConfig,
    pub shutdown_grace: Duration,
    pub health_log_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store: StoreSettings::default(),
            collections: Vec::new(),
            schedule: DEFAULT_RECURRENCE.to_string(),
            differ: DifferConfig::default(),
            shutdown_grace: Duration::from_secs(10),
            health_log_interval: Duration::from_secs(300),
        }
    }
}

/// Values taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub store_url: Option<String>,
    pub database: Option<String>,
    pub collections: Option<Vec<String>>,
    pub schedule: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub watermark_column: Option<String>,
    pub log_level: Option<String>,
}

impl WatchConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_STORE_URI) {
            self.store.url = Some(url);
        }
        if let Some(db) = get(ENV_DB_NAME) {
            self.store.database = Some(db);
        }
        if let Some(names) = get(ENV_COLLECTION_NAME) {
            self.collections = split_list(&names);
        }
        if let Some(expr) = get(ENV_CRON_INTERVAL) {
            self.schedule = expr;
        }
        if let Some(user) = get(ENV_STORE_USER) {
            self.store.user = Some(user);
        }
        if let Some(pass) = get(ENV_STORE_PASSWORD) {
            self.store.password = Some(pass);
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(&mut self, cli: CliOverrides) {
        if let Some(url) = cli.store_url {
            self.store.url = Some(url);
        }
        if let Some(db) = cli.database {
            self.store.database = Some(db);
        }
        if let Some(names) = cli.collections {
            let names: Vec<String> = names
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !names.is_empty() {
                self.collections = names;
            }
        }
        if let Some(expr) = cli.schedule {
            self.schedule = expr;
        }
        if let Some(secs) = cli.poll_interval_secs {
            self.differ.poll_interval = Duration::from_secs(secs);
        }
        if let Some(column) = cli.watermark_column {
            self.differ.watermark_column = Some(column);
        }
        if let Some(level) = cli.log_level {
            self.log_level = level;
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_none() {
            bail!("Store URL is not set ({ENV_STORE_URI} or --store-url)");
        }
        match &self.store.database {
            None => bail!("Database name is not set ({ENV_DB_NAME} or --database)"),
            Some(db) => {
                validate_identifier(db).with_context(|| format!("Invalid database name {db:?}"))?;
            }
        }
        if self.collections.is_empty() {
            bail!("Collection name is not set ({ENV_COLLECTION_NAME} or --collection)");
        }
        for name in &self.collections {
            validate_identifier(name)
                .with_context(|| format!("Invalid collection name {name:?}"))?;
        }
        if let Some(column) = &self.differ.watermark_column {
            validate_identifier(column)
                .with_context(|| format!("Invalid watermark column {column:?}"))?;
        }

        self.recurrence()?;

        if self.differ.poll_interval.is_zero() {
            bail!("poll_interval_secs must be positive");
        }
        if self.differ.max_backoff < self.differ.initial_backoff {
            bail!("max_backoff_secs cannot be less than initial_backoff_secs");
        }
        if self.health_log_interval.is_zero() {
            bail!("health_log_interval_secs must be positive");
        }

        Ok(())
    }

    /// Parsed scheduler recurrence.
    pub fn recurrence(&self) -> Result<Recurrence> {
        self.schedule
            .parse()
            .with_context(|| format!("Invalid schedule expression {:?}", self.schedule))
    }

    /// ClickHouse client configuration; call after `validate`.
    pub fn clickhouse(&self) -> Result<ClickHouseConfig> {
        let (Some(url), Some(database)) = (&self.store.url, &self.store.database) else {
            bail!("Store URL and database name are required");
        };
        Ok(ClickHouseConfig {
            url: url.clone(),
            database: database.clone(),
            user: self.store.user.clone(),
            password: self.store.password.clone(),
        })
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// TOML file structure for deserialization.
#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    store: StoreToml,
    #[serde(default)]
    watch: WatchToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
    shutdown_grace_secs: u64,
    health_log_interval_secs: u64,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            shutdown_grace_secs: 10,
            health_log_interval_secs: 300,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoreToml {
    url: Option<String>,
    database: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WatchToml {
    collections: Vec<String>,
    schedule: String,
    poll_interval_secs: u64,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    watermark_column: Option<String>,
}

impl Default for WatchToml {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            schedule: DEFAULT_RECURRENCE.to_string(),
            poll_interval_secs: 60,
            initial_backoff_secs: 60,
            max_backoff_secs: 600,
            watermark_column: None,
        }
    }
}

impl From<TomlConfig> for WatchConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            log_level: toml.general.log_level,
            store: StoreSettings {
                url: toml.store.url,
                database: toml.store.database,
                user: toml.store.user,
                password: toml.store.password,
            },
            collections: toml.watch.collections,
            schedule: toml.watch.schedule,
            differ: DifferConfig {
                poll_interval: Duration::from_secs(toml.watch.poll_interval_secs),
                initial_backoff: Duration::from_secs(toml.watch.initial_backoff_secs),
                max_backoff: Duration::from_secs(toml.watch.max_backoff_secs),
                watermark_column: toml.watch.watermark_column,
            },
            shutdown_grace: Duration::from_secs(toml.general.shutdown_grace_secs),
            health_log_interval: Duration::from_secs(toml.general.health_log_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn complete() -> WatchConfig {
        let mut config = WatchConfig::default();
        config.store.url = Some("http://db:8123".to_string());
        config.store.database = Some("app".to_string());
        config.collections = vec!["users".to_string()];
        config
    }

    #[test]
    fn test_default_config() {
        let config = WatchConfig::default();
        assert_eq!(config.schedule, "@every 1m");
        assert_eq!(config.differ.poll_interval, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert!(config.collections.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [general]
            log_level = "debug"

            [store]
            url = "http://db:8123"
            database = "app"

            [watch]
            collections = ["users", "orders"]
            schedule = "*/5 * * * *"
            poll_interval_secs = 30
            watermark_column = "id"
        "#;

        let config = WatchConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.store.url.as_deref(), Some("http://db:8123"));
        assert_eq!(config.collections, vec!["users", "orders"]);
        assert_eq!(config.differ.poll_interval, Duration::from_secs(30));
        assert_eq!(config.differ.max_backoff, Duration::from_secs(600));
        assert_eq!(config.differ.watermark_column.as_deref(), Some("id"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(WatchConfig::from_toml_str("[watch]\npoll_interval_secs = \"x\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_STORE_URI, "http://env:8123"),
            (ENV_DB_NAME, "envdb"),
            (ENV_COLLECTION_NAME, "users, orders ,"),
            (ENV_CRON_INTERVAL, "@every 5m"),
            (ENV_STORE_PASSWORD, ""),
        ]
        .into_iter()
        .collect();

        let mut config = WatchConfig::default();
        config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.store.url.as_deref(), Some("http://env:8123"));
        assert_eq!(config.store.database.as_deref(), Some("envdb"));
        assert_eq!(config.collections, vec!["users", "orders"]);
        assert_eq!(config.schedule, "@every 5m");
        assert!(config.store.password.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = complete();
        config.apply_cli_overrides(CliOverrides {
            collections: Some(vec!["events".to_string(), " ".to_string()]),
            schedule: Some("@hourly".to_string()),
            poll_interval_secs: Some(15),
            ..Default::default()
        });

        assert_eq!(config.collections, vec!["events"]);
        assert_eq!(config.schedule, "@hourly");
        assert_eq!(config.differ.poll_interval, Duration::from_secs(15));
        assert_eq!(config.store.url.as_deref(), Some("http://db:8123"));
    }

    #[test]
    fn test_validate_missing_settings() {
        let mut config = complete();
        config.store.url = None;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains(ENV_STORE_URI));

        let mut config = complete();
        config.store.database = None;
        assert!(config.validate().unwrap_err().to_string().contains(ENV_DB_NAME));

        let mut config = complete();
        config.collections.clear();
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains(ENV_COLLECTION_NAME)
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = complete();
        config.schedule = "every minute".to_string();
        assert!(config.validate().is_err());

        let mut config = complete();
        config.collections = vec!["users; drop".to_string()];
        assert!(config.validate().is_err());

        let mut config = complete();
        config.differ.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = complete();
        config.differ.max_backoff = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clickhouse_config() {
        let mut config = complete();
        config.store.user = Some("reader".to_string());
        let ch = config.clickhouse().unwrap();
        assert_eq!(ch.url, "http://db:8123");
        assert_eq!(ch.database, "app");
        assert_eq!(ch.user.as_deref(), Some("reader"));
    }
}
