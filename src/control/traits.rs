use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::StoreError;

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Set(String, Vec<u8>),
    Delete(String),
}

impl StoreOp {
    pub fn set(key: &str, value: Vec<u8>) -> Self {
        StoreOp::Set(key.to_string(), value)
    }

    pub fn delete(key: &str) -> Self {
        StoreOp::Delete(key.to_string())
    }
}

/// The shared key-value store every process coordinates through.
///
/// Values are opaque bytes (message envelopes). Lists are pushed at the head,
/// so the newest item comes first in the store's own ordering; `pop_all`
/// hides that and returns items oldest first.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Returns false and leaves the key alone when it already exists.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    /// Read several keys so that no concurrent `apply` is observed halfway.
    async fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    /// Run every op as one atomic batch.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Push onto a list and keep only the newest `max_len` items.
    async fn push_trim(&self, key: &str, value: Vec<u8>, max_len: usize) -> Result<(), StoreError>;

    /// Read the whole list and delete it in one round trip.
    async fn pop_all(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn flush_all(&self) -> Result<(), StoreError>;
}

/// The four artifacts published together for one parameter epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub policy_params: Vec<f32>,
    pub value_params: Vec<f32>,
    pub strategy_frames: Vec<Vec<f32>>,
    pub strategy_history: Vec<Vec<f32>>,
}

/// Observation and action shapes, published once by the first client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSpaces {
    pub observation_shape: Vec<usize>,
    pub action_shape: Vec<usize>,
}

impl EnvSpaces {
    pub fn new(observation_shape: Vec<usize>, action_shape: Vec<usize>) -> Self {
        Self {
            observation_shape,
            action_shape,
        }
    }

    pub fn observation_size(&self) -> usize {
        self.observation_shape.iter().product()
    }

    pub fn action_size(&self) -> usize {
        self.action_shape.iter().product()
    }
}
