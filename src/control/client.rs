use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::errors::ControlError;
use super::keys::*;
use super::status::Status;
use super::traits::{EnvSpaces, ModelUpdate, Store};
use crate::config::{PollingConfig, RunConfig};
use crate::experience::Trajectory;
use crate::message::MessageSerializer;

/// A rollout process's view of the store: reads what the server publishes
/// and pushes experience back.
pub struct CoordinationClient {
    store: Arc<dyn Store>,
    serializer: MessageSerializer,
    polling: PollingConfig,
    max_list_length: usize,
    current_epoch: Option<u64>,
    current_value_epoch: Option<u64>,
}

impl fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("serializer", &self.serializer)
            .field("max_list_length", &self.max_list_length)
            .field("current_epoch", &self.current_epoch)
            .field("current_value_epoch", &self.current_value_epoch)
            .finish()
    }
}

impl CoordinationClient {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let defaults = RunConfig::default();
        Self {
            store,
            serializer: MessageSerializer::default(),
            polling: defaults.polling,
            max_list_length: defaults.networking.max_list_length,
            current_epoch: None,
            current_value_epoch: None,
        }
    }

    /// Polling intervals used until a config is read.
    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn serializer(&self) -> &MessageSerializer {
        &self.serializer
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.current_epoch
    }

    pub async fn check_server_status(&self) -> Result<Option<Status>, ControlError> {
        match self.get_data::<String>(SERVER_CURRENT_STATUS_KEY).await? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Wait until the server has published a config it is ready to serve,
    /// then adopt its networking and polling settings.
    pub async fn get_cfg(&mut self) -> Result<RunConfig, ControlError> {
        loop {
            match self.check_server_status().await? {
                Some(Status::Running | Status::AwaitingEnvSpaces) => break,
                status => debug!(?status, "waiting for server config"),
            }
            tokio::time::sleep(self.polling.status_interval()).await;
        }

        let raw: String = self
            .get_data(SERVER_CONFIG_KEY)
            .await?
            .ok_or(ControlError::Missing("run config"))?;
        let cfg = RunConfig::from_json(&raw)?;
        self.configure(&cfg)?;
        info!(compression = %self.serializer.compression(), "received run config");
        Ok(cfg)
    }

    /// Adopt the networking and polling settings of a config obtained elsewhere.
    pub fn configure(&mut self, cfg: &RunConfig) -> Result<(), ControlError> {
        self.serializer = cfg.networking.serializer()?;
        self.polling = cfg.polling.clone();
        self.max_list_length = cfg.networking.max_list_length;
        Ok(())
    }

    /// Publish env spaces unless another client already did. Returns true
    /// when this call was the first writer.
    pub async fn transmit_env_spaces(&self, spaces: &EnvSpaces) -> Result<bool, ControlError> {
        let written = self
            .store
            .set_if_absent(ENV_SPACES_KEY, self.serializer.pack(spaces)?)
            .await?;
        if written {
            info!(
                observation = ?spaces.observation_shape,
                action = ?spaces.action_shape,
                "transmitted env spaces"
            );
        }
        Ok(written)
    }

    /// The published artifacts, if their epoch is newer than the last one
    /// this client applied.
    pub async fn get_latest_update(&mut self) -> Result<Option<(ModelUpdate, u64)>, ControlError> {
        let Some(epoch) = self.get_data::<u64>(SERVER_CURRENT_UPDATE_KEY).await? else {
            return Ok(None);
        };
        if !is_newer(epoch, self.current_epoch) {
            return Ok(None);
        }

        // Re-read the epoch with the artifacts so both come from one publication.
        let mut keys = UPDATE_KEYS.to_vec();
        keys.push(SERVER_CURRENT_UPDATE_KEY);
        let values = self.store.get_many(&keys).await?;
        let [policy, value, frames, history, epoch] = <[Option<Vec<u8>>; 5]>::try_from(values)
            .map_err(|_| ControlError::Missing("model update"))?;

        let epoch: u64 = self.unpack_required(epoch, "update epoch")?;
        if !is_newer(epoch, self.current_epoch) {
            return Ok(None);
        }
        let update = ModelUpdate {
            policy_params: self.unpack_required(policy, "policy params")?,
            value_params: self.unpack_required(value, "value params")?,
            strategy_frames: self.unpack_required(frames, "strategy frames")?,
            strategy_history: self.unpack_required(history, "strategy history")?,
        };

        self.current_epoch = Some(epoch);
        debug!(epoch, "received model update");
        Ok(Some((update, epoch)))
    }

    /// Value parameters only, tracked by their own epoch so a component that
    /// needs just the value model does not consume the policy update.
    pub async fn get_latest_value_params(&mut self) -> Result<Option<Vec<f32>>, ControlError> {
        let values = self
            .store
            .get_many(&[SERVER_VAL_PARAMS_KEY, SERVER_CURRENT_UPDATE_KEY])
            .await?;
        let [params, epoch] =
            <[Option<Vec<u8>>; 2]>::try_from(values).map_err(|_| ControlError::Missing("value params"))?;

        let Some(epoch) = epoch else {
            return Ok(None);
        };
        let epoch: u64 = self.serializer.unpack(&epoch)?;
        if !is_newer(epoch, self.current_value_epoch) {
            return Ok(None);
        }
        let params: Vec<f32> = self.unpack_required(params, "value params")?;
        self.current_value_epoch = Some(epoch);
        Ok(Some(params))
    }

    /// Running reward mean and std, `(0, 1)` until the server publishes them.
    pub async fn get_reward_stats(&self) -> Result<(f64, f64), ControlError> {
        let values = self
            .store
            .get_many(&[RUNNING_REWARD_MEAN_KEY, RUNNING_REWARD_STD_KEY])
            .await?;
        let mut stats = values.into_iter();
        let mean = match stats.next().flatten() {
            Some(raw) => self.serializer.unpack(&raw)?,
            None => 0.0,
        };
        let std = match stats.next().flatten() {
            Some(raw) => self.serializer.unpack(&raw)?,
            None => 1.0,
        };
        Ok((mean, std))
    }

    /// Append to a list key, keeping at most `max_list_length` entries.
    pub async fn push_data<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> Result<(), ControlError> {
        self.store
            .push_trim(key, self.serializer.pack(data)?, self.max_list_length)
            .await?;
        Ok(())
    }

    pub async fn push_trajectories(&self, trajectories: &[Trajectory]) -> Result<(), ControlError> {
        self.push_data(CLIENT_EXPERIENCE_KEY, trajectories).await
    }

    pub async fn push_policy_rewards(&self, rewards: &[f32]) -> Result<(), ControlError> {
        self.push_data(CLIENT_POLICY_REWARD_KEY, rewards).await
    }

    pub async fn set_data<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> Result<(), ControlError> {
        self.store.set(key, self.serializer.pack(data)?).await?;
        Ok(())
    }

    pub async fn get_data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ControlError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(self.serializer.unpack(&raw)?)),
            None => Ok(None),
        }
    }

    /// Take every entry of a list key. Whoever calls this first gets the data.
    pub async fn atomic_pop_all<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, ControlError> {
        let entries = self.store.pop_all(key).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(self.serializer.unpack(&entry)?);
        }
        Ok(out)
    }

    fn unpack_required<T: DeserializeOwned>(&self, raw: Option<Vec<u8>>, what: &'static str) -> Result<T, ControlError> {
        let raw = raw.ok_or(ControlError::Missing(what))?;
        Ok(self.serializer.unpack(&raw)?)
    }
}

fn is_newer(epoch: u64, current: Option<u64>) -> bool {
    current.is_none_or(|current| epoch > current)
}
