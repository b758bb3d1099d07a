use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

pub const ENV_PREFIX: &str = "WIREFLOW_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: String, value: String },
}

/// Where raw configuration values come from. Keys are given without the
/// `WIREFLOW_` prefix.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn keys(&self) -> Vec<String>;
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    env_file: Option<PathBuf>,
}

impl EnvConfig {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        if let Some(path) = &env_file {
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => info!("Loaded .env from {}", path.display()),
                    Err(e) => warn!("could not load .env from {}: {e}", path.display()),
                }
            }
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> Option<&PathBuf> {
        self.env_file.as_ref()
    }
}

#[async_trait]
impl ConfigSource for EnvConfig {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(format!("{ENV_PREFIX}{key}")).ok()
    }

    async fn keys(&self) -> Vec<String> {
        env::vars()
            .filter_map(|(k, _)| k.strip_prefix(ENV_PREFIX).map(str::to_string))
            .collect()
    }
}

/// In-memory values, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    map: DashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<String>) -> Self {
        self.map.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.map.insert(key.to_string(), value.into());
    }
}

impl From<HashMap<String, String>> for MapConfig {
    fn from(values: HashMap<String, String>) -> Self {
        Self {
            map: values.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ConfigSource for MapConfig {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Engine wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub flows_file: PathBuf,
    pub rpc_timeout: Duration,
    pub close_timeout: Duration,
    pub sandbox_timeout: Duration,
    pub sandbox_rpc_timeout: Duration,
    pub throttle_interval: Duration,
    pub throttle_burst: u32,
    pub sandbox_denylist: Vec<String>,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 1880)),
            flows_file: PathBuf::from("flows.json"),
            rpc_timeout: Duration::from_millis(5000),
            close_timeout: Duration::from_millis(15000),
            sandbox_timeout: Duration::from_millis(10000),
            sandbox_rpc_timeout: Duration::from_millis(2000),
            throttle_interval: Duration::from_millis(100),
            throttle_burst: 50,
            sandbox_denylist: vec!["eval".to_string(), "import".to_string()],
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{key}"),
        value: raw.to_string(),
    })
}

impl Settings {
    /// Overlays whatever `source` provides on top of the defaults.
    pub async fn load(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(raw) = source.get("LISTEN").await {
            settings.listen = parse("LISTEN", &raw)?;
        }
        if let Some(raw) = source.get("FLOWS").await {
            settings.flows_file = PathBuf::from(raw);
        }
        for (key, slot) in [
            ("RPC_TIMEOUT_MS", &mut settings.rpc_timeout),
            ("CLOSE_TIMEOUT_MS", &mut settings.close_timeout),
            ("SANDBOX_TIMEOUT_MS", &mut settings.sandbox_timeout),
            ("SANDBOX_RPC_TIMEOUT_MS", &mut settings.sandbox_rpc_timeout),
            ("THROTTLE_INTERVAL_MS", &mut settings.throttle_interval),
        ] {
            if let Some(raw) = source.get(key).await {
                let millis: u64 = parse(key, &raw)?;
                if millis == 0 {
                    return Err(ConfigError::Invalid {
                        key: format!("{ENV_PREFIX}{key}"),
                        value: raw,
                    });
                }
                *slot = Duration::from_millis(millis);
            }
        }
        if let Some(raw) = source.get("THROTTLE_BURST").await {
            settings.throttle_burst = parse("THROTTLE_BURST", &raw)?;
        }
        if let Some(raw) = source.get("SANDBOX_DENYLIST").await {
            settings.sandbox_denylist = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = source.get("LOG_LEVEL").await {
            settings.log_level = raw;
        }
        if let Some(raw) = source.get("LOG_DIR").await.filter(|d| !d.is_empty()) {
            settings.log_dir = Some(PathBuf::from(raw));
        }
        Ok(settings)
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listen={} flows={} rpc_timeout={:?} sandbox_timeout={:?}",
            self.listen,
            self.flows_file.display(),
            self.rpc_timeout,
            self.sandbox_timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_when_source_is_empty() {
        let settings = Settings::load(&MapConfig::new()).await.unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.listen.port(), 1880);
    }

    #[tokio::test]
    async fn test_map_values_override_defaults() {
        let source = MapConfig::new()
            .with("LISTEN", "0.0.0.0:9000")
            .with("FLOWS", "/tmp/f.yaml")
            .with("SANDBOX_TIMEOUT_MS", "250")
            .with("THROTTLE_BURST", "3")
            .with("SANDBOX_DENYLIST", "eval, print ,")
            .with("LOG_DIR", "logs");
        let settings = Settings::load(&source).await.unwrap();
        assert_eq!(settings.listen.port(), 9000);
        assert_eq!(settings.flows_file, PathBuf::from("/tmp/f.yaml"));
        assert_eq!(settings.sandbox_timeout, Duration::from_millis(250));
        assert_eq!(settings.throttle_burst, 3);
        assert_eq!(settings.sandbox_denylist, vec!["eval", "print"]);
        assert_eq!(settings.log_dir, Some(PathBuf::from("logs")));
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let err = Settings::load(&MapConfig::new().with("RPC_TIMEOUT_MS", "soon"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "WIREFLOW_RPC_TIMEOUT_MS".into(),
                value: "soon".into()
            }
        );
        assert!(Settings::load(&MapConfig::new().with("CLOSE_TIMEOUT_MS", "0")).await.is_err());
        assert!(Settings::load(&MapConfig::new().with("LISTEN", "nowhere")).await.is_err());
    }

    #[tokio::test]
    async fn test_env_config_reads_prefixed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(".env");
        std::fs::write(&file, "WIREFLOW_TEST_ONLY_KEY=from-dotenv\n").unwrap();
        let source = EnvConfig::new(Some(file));
        assert_eq!(source.get("TEST_ONLY_KEY").await.as_deref(), Some("from-dotenv"));
        assert!(source.keys().await.contains(&"TEST_ONLY_KEY".to_string()));
    }
}
