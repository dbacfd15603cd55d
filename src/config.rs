use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Application configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Port the HTTP surface listens on
    pub port: u16,
    /// Base URL of the remote HTTP API (without the `/api/v5` prefix)
    pub cloud_url: String,
    /// Value sent verbatim in the `Authorization` header of forwarded requests
    pub api_key: Option<String>,
    /// Application identifier presented to peers
    pub app_id: String,
    /// Token presented to peers
    pub playground_token: String,
    /// Custom authentication URL, passed through to the peer handshake
    pub auth_url: Option<String>,
    /// Websocket URL of the peer transport
    pub websocket_url: Option<String>,
    /// Delay before reconnecting the peer transport
    pub transport_retry_interval_ms: u64,
    /// Path to the SQLite replica
    pub database_path: PathBuf,
    /// Page size used during bulk sync
    pub batch_size: usize,
    /// Delay between page attempts and between pages
    pub batch_interval_ms: u64,
    /// Per-call timeout for remote count and local store calls
    pub call_timeout_ms: u64,
    /// Predicate used both for remote counts and for page queries
    pub count_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            cloud_url: "http://localhost:8080".to_string(),
            api_key: None,
            app_id: String::new(),
            playground_token: String::new(),
            auth_url: None,
            websocket_url: None,
            transport_retry_interval_ms: 5000,
            database_path: Self::default_data_dir().join("replica.db"),
            batch_size: 10_000,
            batch_interval_ms: 1000,
            call_timeout_ms: 5000,
            count_filter: "status == 1".to_string(),
        }
    }
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            config = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;
        }

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides through `lookup`.
    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("REPLICA_PORT") {
            self.port = parse_env("REPLICA_PORT", &port)?;
        }
        if let Some(url) = lookup("REPLICA_CLOUD_URL") {
            self.cloud_url = url;
        }
        if let Some(key) = lookup("REPLICA_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(app_id) = lookup("REPLICA_APP_ID") {
            self.app_id = app_id;
        }
        if let Some(token) = lookup("REPLICA_PLAYGROUND_TOKEN") {
            self.playground_token = token;
        }
        if let Some(url) = lookup("REPLICA_AUTH_URL") {
            self.auth_url = Some(url);
        }
        if let Some(url) = lookup("REPLICA_WEBSOCKET_URL") {
            self.websocket_url = Some(url);
        }
        if let Some(ms) = lookup("REPLICA_TRANSPORT_RETRY_MS") {
            self.transport_retry_interval_ms = parse_env("REPLICA_TRANSPORT_RETRY_MS", &ms)?;
        }
        if let Some(db_path) = lookup("REPLICA_DATABASE_PATH") {
            self.database_path = PathBuf::from(db_path);
        }
        if let Some(size) = lookup("REPLICA_BATCH_SIZE") {
            self.batch_size = parse_env("REPLICA_BATCH_SIZE", &size)?;
        }
        if let Some(ms) = lookup("REPLICA_BATCH_INTERVAL_MS") {
            self.batch_interval_ms = parse_env("REPLICA_BATCH_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("REPLICA_CALL_TIMEOUT_MS") {
            self.call_timeout_ms = parse_env("REPLICA_CALL_TIMEOUT_MS", &ms)?;
        }
        if let Some(filter) = lookup("REPLICA_COUNT_FILTER") {
            self.count_filter = filter;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.count_filter.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "count_filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Remote API base including the version prefix.
    pub fn api_base_url(&self) -> String {
        format!("{}/api/v5", self.cloud_url.trim_end_matches('/'))
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn transport_retry_interval(&self) -> Duration {
        Duration::from_millis(self.transport_retry_interval_ms)
    }

    /// Default config file path: <config dir>/replica-sync/config.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("replica-sync")
            .join("config.yaml")
    }

    /// Default data directory: <data dir>/replica-sync
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("replica-sync")
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv(name, value.to_string()))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    ReadError(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, #[source] serde_yaml::Error),
    #[error("Invalid value for {0}: '{1}'")]
    InvalidEnv(&'static str, String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.batch_interval(), Duration::from_millis(1000));
        assert_eq!(config.transport_retry_interval(), Duration::from_millis(5000));
        assert_eq!(config.count_filter, "status == 1");
        assert!(config.database_path.to_string_lossy().contains("replica.db"));
    }

    #[test]
    fn test_api_base_url_trims_trailing_slash() {
        let config = Config {
            cloud_url: "https://cloud.example.com/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.api_base_url(), "https://cloud.example.com/api/v5");
    }

    #[test]
    fn test_load_no_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.batch_size, 10_000);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/replica.db").unwrap();
        writeln!(file, "batch_size: 500").unwrap();
        writeln!(file, "websocket_url: wss://peers.example.com").unwrap();

        let contents = std::fs::read_to_string(&config_path).unwrap();
        let config: Config = serde_yaml::from_str(&contents).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/custom/path/replica.db"));
        assert_eq!(config.batch_size, 500);
        assert_eq!(
            config.websocket_url.as_deref(),
            Some("wss://peers.example.com")
        );
        // Unset fields keep their defaults
        assert_eq!(config.batch_interval_ms, 1000);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config {
            batch_size: 500,
            ..Config::default()
        };

        config
            .apply_env(env(&[
                ("REPLICA_BATCH_SIZE", "250"),
                ("REPLICA_API_KEY", "secret"),
                ("REPLICA_COUNT_FILTER", "status == 2"),
            ]))
            .unwrap();

        assert_eq!(config.batch_size, 250);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.count_filter, "status == 2");
    }

    #[test]
    fn test_invalid_env_number_is_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("REPLICA_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("REPLICA_PORT"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_call_timeout_rejected() {
        let config = Config {
            call_timeout_ms: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("call_timeout_ms"));

        let mut config = Config::default();
        config
            .apply_env(env(&[("REPLICA_CALL_TIMEOUT_MS", "0")]))
            .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
