use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::errors::ControlError;
use super::keys::*;
use super::status::Status;
use super::traits::{EnvSpaces, ModelUpdate, Store, StoreOp};
use crate::config::{PollingConfig, RunConfig};
use crate::experience::{ExperienceBuffer, ThroughputMeter, Trajectory};
use crate::message::MessageSerializer;

/// The single writer of status, config and parameters.
///
/// Also drains the experience clients push: trajectories land in a bounded
/// FIFO ([`ExperienceBuffer`]) and are handed out by timestep count.
pub struct CoordinationServer {
    store: Arc<dyn Store>,
    serializer: MessageSerializer,
    polling: PollingConfig,
    buffer: ExperienceBuffer,
    throughput: ThroughputMeter,
    published_epoch: Option<u64>,
}

impl fmt::Debug for CoordinationServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationServer")
            .field("serializer", &self.serializer)
            .field("available_timesteps", &self.buffer.available_timesteps())
            .field("published_epoch", &self.published_epoch)
            .finish()
    }
}

impl CoordinationServer {
    pub fn new(store: Arc<dyn Store>, max_queue_size: usize) -> Self {
        Self {
            store,
            serializer: MessageSerializer::default(),
            polling: PollingConfig::default(),
            buffer: ExperienceBuffer::new(max_queue_size),
            throughput: ThroughputMeter::new(),
            published_epoch: None,
        }
    }

    pub fn with_serializer(mut self, serializer: MessageSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn serializer(&self) -> &MessageSerializer {
        &self.serializer
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// `clear_existing` wipes the whole store. `new_server_instance` marks
    /// this process as the status owner; helpers that only drain experience
    /// pass false.
    pub async fn connect(&mut self, clear_existing: bool, new_server_instance: bool) -> Result<(), ControlError> {
        if clear_existing {
            self.store.flush_all().await?;
            self.published_epoch = None;
        }
        if new_server_instance {
            self.set_status(Status::Initializing).await?;
            self.set_value(NEW_DATA_AMOUNT_KEY, &0u64).await?;
        }
        info!(clear_existing, new_server_instance, "coordination server connected");
        Ok(())
    }

    pub async fn set_status(&self, status: Status) -> Result<(), ControlError> {
        self.set_value(SERVER_CURRENT_STATUS_KEY, status.as_str()).await?;
        info!(%status, "server status");
        Ok(())
    }

    pub async fn status(&self) -> Result<Option<Status>, ControlError> {
        match self.get_value::<String>(SERVER_CURRENT_STATUS_KEY).await? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Publish the run configuration and switch to its compression settings.
    pub async fn push_config(&mut self, cfg: &RunConfig) -> Result<(), ControlError> {
        self.serializer = cfg.networking.serializer()?;
        self.polling = cfg.polling.clone();
        self.set_value(SERVER_CONFIG_KEY, &cfg.to_json()?).await?;
        info!(compression = %self.serializer.compression(), "published run config");
        Ok(())
    }

    /// Replace the four published artifacts and the epoch counter in one
    /// atomic batch. Epochs must strictly increase.
    pub async fn push_update(&mut self, update: &ModelUpdate, epoch: u64) -> Result<(), ControlError> {
        let published = match self.published_epoch {
            Some(epoch) => Some(epoch),
            None => self.get_value::<u64>(SERVER_CURRENT_UPDATE_KEY).await?,
        };
        if let Some(published) = published {
            if epoch <= published {
                return Err(ControlError::StaleEpoch {
                    published,
                    attempted: epoch,
                });
            }
        }

        let ops = vec![
            StoreOp::set(SERVER_POLICY_PARAMS_KEY, self.serializer.pack(&update.policy_params)?),
            StoreOp::set(SERVER_VAL_PARAMS_KEY, self.serializer.pack(&update.value_params)?),
            StoreOp::set(SERVER_STRATEGY_FRAMES_KEY, self.serializer.pack(&update.strategy_frames)?),
            StoreOp::set(SERVER_STRATEGY_HISTORY_KEY, self.serializer.pack(&update.strategy_history)?),
            StoreOp::set(SERVER_CURRENT_UPDATE_KEY, self.serializer.pack(&epoch)?),
        ];
        self.store.apply(ops).await?;
        self.published_epoch = Some(epoch);
        debug!(epoch, "published model update");
        Ok(())
    }

    /// Ask clients for their env spaces and wait until one answers.
    pub async fn get_env_spaces(&self) -> Result<EnvSpaces, ControlError> {
        self.set_status(Status::AwaitingEnvSpaces).await?;
        loop {
            if let Some(spaces) = self.get_value::<EnvSpaces>(ENV_SPACES_KEY).await? {
                info!(
                    observation = ?spaces.observation_shape,
                    action = ?spaces.action_shape,
                    "received env spaces"
                );
                return Ok(spaces);
            }
            tokio::time::sleep(self.polling.env_spaces_interval()).await;
        }
    }

    /// Publish RUNNING, give clients that connected earlier a grace window to
    /// fetch fresh parameters, then drop whatever they had pushed before.
    ///
    /// The grace window is best effort: a client that pushes near its end can
    /// still lose that data.
    pub async fn signal_ready(&mut self) -> Result<(), ControlError> {
        self.set_status(Status::Running).await?;
        tokio::time::sleep(self.polling.ready_grace()).await;

        let mut ops: Vec<StoreOp> = CLIENT_KEYS.iter().map(|key| StoreOp::delete(key)).collect();
        ops.push(StoreOp::set(NEW_DATA_AMOUNT_KEY, self.serializer.pack(&0u64)?));
        self.store.apply(ops).await?;
        self.buffer.clear();
        Ok(())
    }

    /// Move everything clients pushed into the local buffer. Returns the
    /// number of timesteps received.
    ///
    /// Entries that fail to decode are logged and dropped; the rest of the
    /// drain is still buffered.
    pub async fn update_buffer(&mut self) -> Result<usize, ControlError> {
        let entries = self.store.pop_all(CLIENT_EXPERIENCE_KEY).await?;
        let mut received = 0;
        let mut dropped = 0usize;
        for entry in entries {
            match self.serializer.unpack::<Vec<Trajectory>>(&entry) {
                Ok(trajectories) => received += self.buffer.extend(trajectories),
                Err(e) => {
                    warn!(error = %e, bytes = entry.len(), "dropping undecodable experience entry");
                    dropped += 1;
                }
            }
        }

        self.throughput.record(received);
        if received > 0 || dropped > 0 {
            debug!(
                received,
                dropped,
                available = self.buffer.available_timesteps(),
                "drained client experience"
            );
        }
        Ok(received)
    }

    /// Wait until at least `n` timesteps are buffered and pop them, newest
    /// first. `n` is capped at the buffer capacity.
    pub async fn get_n_timesteps(&mut self, n: usize) -> Result<Vec<Trajectory>, ControlError> {
        let capacity = self.buffer.max_queue_size();
        let n = if n > capacity {
            warn!(requested = n, capacity, "requested more timesteps than the buffer holds");
            capacity
        } else {
            n
        };

        loop {
            self.update_buffer().await?;
            if let Some(trajectories) = self.buffer.pop_n(n) {
                return Ok(trajectories);
            }
            tokio::time::sleep(self.polling.timesteps_interval()).await;
        }
    }

    /// Pop whatever is buffered, newest first, until `n` timesteps are
    /// collected or the buffer runs dry.
    pub async fn get_up_to_n_timesteps(&mut self, n: usize) -> Result<Vec<Trajectory>, ControlError> {
        self.update_buffer().await?;
        Ok(self.buffer.pop_up_to(n))
    }

    /// Every episode reward clients pushed since the last call, flattened.
    pub async fn get_policy_rewards(&self) -> Result<Vec<f32>, ControlError> {
        let lists = self.store.pop_all(CLIENT_POLICY_REWARD_KEY).await?;
        let mut rewards = Vec::new();
        for list in lists {
            rewards.extend(self.serializer.unpack::<Vec<f32>>(&list)?);
        }
        Ok(rewards)
    }

    pub async fn set_reward_stats(&self, mean: f64, std: f64) -> Result<(), ControlError> {
        self.store
            .apply(vec![
                StoreOp::set(RUNNING_REWARD_MEAN_KEY, self.serializer.pack(&mean)?),
                StoreOp::set(RUNNING_REWARD_STD_KEY, self.serializer.pack(&std)?),
            ])
            .await?;
        Ok(())
    }

    pub async fn set_cumulative_timesteps(&self, timesteps: u64) -> Result<(), ControlError> {
        self.set_value(SERVER_CUMULATIVE_TIMESTEPS_KEY, &timesteps).await
    }

    pub async fn set_mean_policy_reward(&self, reward: f64) -> Result<(), ControlError> {
        self.set_value(MEAN_POLICY_REWARD_KEY, &reward).await
    }

    pub fn available_timesteps(&self) -> usize {
        self.buffer.available_timesteps()
    }

    pub fn steps_per_second(&self) -> f64 {
        self.throughput.steps_per_second()
    }

    pub fn published_epoch(&self) -> Option<u64> {
        self.published_epoch
    }

    /// Wipe the store and tell clients the server is going away.
    pub async fn disconnect(&mut self) -> Result<(), ControlError> {
        self.store.flush_all().await?;
        self.set_status(Status::Stopping).await?;
        self.buffer.clear();
        self.published_epoch = None;
        Ok(())
    }

    async fn set_value<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ControlError> {
        self.store.set(key, self.serializer.pack(value)?).await?;
        Ok(())
    }

    async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ControlError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(self.serializer.unpack(&raw)?)),
            None => Ok(None),
        }
    }
}
