//! Run configuration, loaded once before the subsystem starts and published
//! to clients through the coordination store.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    pub experience: ExperienceConfig,
    pub policy_optimizer: PolicyOptimizerConfig,
    pub networking: NetworkingConfig,
    pub polling: PollingConfig,
    pub client: ClientConfig,
    pub terminal: TerminalConditions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            experience: ExperienceConfig::default(),
            policy_optimizer: PolicyOptimizerConfig::default(),
            networking: NetworkingConfig::default(),
            polling: PollingConfig::default(),
            client: ClientConfig::default(),
            terminal: TerminalConditions::default(),
        }
    }
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let po = &self.policy_optimizer;
        if !(0.0..=1.0).contains(&po.gamma) {
            return Err(ConfigError::Validation(format!(
                "policy_optimizer.gamma must be in [0, 1], got {}",
                po.gamma
            )));
        }
        if !(0.0..=1.0).contains(&po.gae_lambda) {
            return Err(ConfigError::Validation(format!(
                "policy_optimizer.gae_lambda must be in [0, 1], got {}",
                po.gae_lambda
            )));
        }
        if po.batch_size == 0 {
            return Err(ConfigError::Validation(
                "policy_optimizer.batch_size must be positive".to_string(),
            ));
        }
        if !(po.new_returns_proportion > 0.0 && po.new_returns_proportion <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "policy_optimizer.new_returns_proportion must be in (0, 1], got {}",
                po.new_returns_proportion
            )));
        }
        if self.experience.max_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "experience.max_buffer_size must be positive".to_string(),
            ));
        }
        if self.networking.max_list_length == 0 {
            return Err(ConfigError::Validation(
                "networking.max_list_length must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Timesteps the server drains from the store per epoch.
    pub fn timesteps_per_update(&self) -> usize {
        let n = self.policy_optimizer.new_returns_proportion * self.experience.max_buffer_size as f64;
        (n.round() as usize).clamp(1, self.experience.max_buffer_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperienceConfig {
    /// Upper bound on buffered timesteps, both in the server FIFO and the replay.
    pub max_buffer_size: usize,
}

impl Default for ExperienceConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 50_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOptimizerConfig {
    pub gamma: f32,
    pub gae_lambda: f32,
    pub batch_size: usize,
    pub new_returns_proportion: f64,
}

impl Default for PolicyOptimizerConfig {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            gae_lambda: 0.95,
            batch_size: 5_000,
            new_returns_proportion: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkingConfig {
    /// Registered compressor tag, case-insensitive ("none", "lz4").
    pub compression: String,
    pub min_size_to_compress: usize,
    /// Maximum length of every client-pushed list in the store.
    pub max_list_length: usize,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            compression: crate::message::LZ4.to_string(),
            min_size_to_compress: crate::message::MIN_SIZE_TO_COMPRESS,
            max_list_length: 1_000,
        }
    }
}

impl NetworkingConfig {
    /// Serializer that writes with the configured algorithm and threshold.
    pub fn serializer(&self) -> Result<crate::message::MessageSerializer, crate::message::MessageError> {
        crate::message::MessageSerializer::new(&self.compression, self.min_size_to_compress)
    }
}

/// Sleep intervals for every polling loop. Shorter intervals lower latency at
/// the cost of more store round trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub status_ms: u64,
    pub env_spaces_ms: u64,
    pub timesteps_ms: u64,
    /// Sleep between publishing RUNNING and wiping stale client data.
    pub ready_grace_ms: u64,
    /// Sleep after RESET/RECONFIGURE so clients observe the transition.
    pub transition_grace_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_ms: 1_000,
            env_spaces_ms: 100,
            timesteps_ms: 10,
            ready_grace_ms: 1_000,
            transition_grace_ms: 2_000,
        }
    }
}

impl PollingConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_ms)
    }

    pub fn env_spaces_interval(&self) -> Duration {
        Duration::from_millis(self.env_spaces_ms)
    }

    pub fn timesteps_interval(&self) -> Duration {
        Duration::from_millis(self.timesteps_ms)
    }

    pub fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.ready_grace_ms)
    }

    pub fn transition_grace(&self) -> Duration {
        Duration::from_millis(self.transition_grace_ms)
    }

    /// Millisecond-scale intervals for tests and local runs.
    pub fn fast() -> Self {
        Self {
            status_ms: 5,
            env_spaces_ms: 5,
            timesteps_ms: 2,
            ready_grace_ms: 20,
            transition_grace_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wall-clock seconds of simulation between flushes.
    pub collection_seconds: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            collection_seconds: 1.0,
        }
    }
}

/// Zero disables a condition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConditions {
    pub max_epoch: u64,
    pub max_timesteps: u64,
    pub policy_reward: f64,
}

/// Where the coordination store lives. Read from the environment so the same
/// binaries run against any deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let port = match lookup("REDIS_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Validation(format!("REDIS_PORT is not a port: {raw}")))?,
            None => defaults.port,
        };

        Ok(Self {
            host: lookup("REDIS_HOST").unwrap_or(defaults.host),
            port,
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
        })
    }

    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.host, self.port),
            None => format!("redis://{}:{}/", self.host, self.port),
        }
    }
}
