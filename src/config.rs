use std::{env, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;

pub const BROKER_URL: &str = "LEADFLOW_BROKER_URL";
pub const BROKER_CONNECT_TIMEOUT_SECS: &str = "LEADFLOW_BROKER_CONNECT_TIMEOUT_SECS";
pub const DEAD_LETTER_EXCHANGE: &str = "LEADFLOW_DEAD_LETTER_EXCHANGE";
pub const DEAD_LETTER_QUEUE: &str = "LEADFLOW_DEAD_LETTER_QUEUE";
pub const ROUTE_CACHE_TTL_SECS: &str = "LEADFLOW_ROUTE_CACHE_TTL_SECS";
pub const LOG_LEVEL: &str = "LEADFLOW_LOG_LEVEL";
pub const OTEL_ENDPOINT: &str = "LEADFLOW_OTEL_ENDPOINT";

#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    async fn del(&self, key: &str);
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads the process environment, after loading an optional `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {}", env_file.display(), err),
            }
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        // process-wide; only called from single-threaded setup code
        unsafe { env::set_var(key, value) };
        Ok(())
    }

    async fn del(&self, key: &str) {
        unsafe { env::remove_var(key) };
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Runtime settings of the engine, resolved once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub broker_url: String,
    pub broker_connect_timeout: Duration,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub route_cache_ttl: Duration,
    pub log_level: String,
    pub otel_endpoint: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker_url: "nats://127.0.0.1:4222".to_string(),
            broker_connect_timeout: Duration::from_secs(5),
            dead_letter_exchange: "lead.dead-letter".to_string(),
            dead_letter_queue: "lead.dead-letter".to_string(),
            route_cache_ttl: Duration::from_secs(300),
            log_level: "info".to_string(),
            otel_endpoint: None,
        }
    }
}

impl EngineConfig {
    pub async fn from_manager(config: &ConfigManager) -> Result<Self, EngineError> {
        let defaults = Self::default();
        let cfg = &config.0;

        Ok(Self {
            broker_url: cfg.get(BROKER_URL).await.unwrap_or(defaults.broker_url),
            broker_connect_timeout: match cfg.get(BROKER_CONNECT_TIMEOUT_SECS).await {
                Some(raw) => Duration::from_secs(parse_number(BROKER_CONNECT_TIMEOUT_SECS, &raw)?),
                None => defaults.broker_connect_timeout,
            },
            dead_letter_exchange: cfg
                .get(DEAD_LETTER_EXCHANGE)
                .await
                .unwrap_or(defaults.dead_letter_exchange),
            dead_letter_queue: cfg
                .get(DEAD_LETTER_QUEUE)
                .await
                .unwrap_or(defaults.dead_letter_queue),
            route_cache_ttl: match cfg.get(ROUTE_CACHE_TTL_SECS).await {
                Some(raw) => Duration::from_secs(parse_number(ROUTE_CACHE_TTL_SECS, &raw)?),
                None => defaults.route_cache_ttl,
            },
            log_level: cfg.get(LOG_LEVEL).await.unwrap_or(defaults.log_level),
            otel_endpoint: cfg.get(OTEL_ENDPOINT).await.filter(|s| !s.trim().is_empty()),
        })
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, EngineError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| EngineError::validation(format!("{key} must be a number, got `{raw}`")))
}
