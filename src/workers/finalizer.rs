use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{StoreConnector, ValueModelFactory};
use crate::config::RunConfig;
use crate::control::{ControlError, CoordinationClient, EnvSpaces, Status};
use crate::experience::{ExperienceError, Trajectory};
use crate::model::Model;
use crate::runtime::{Packet, Worker, WorkerContext, WorkerError};

pub const FINALIZER_KIND: &str = "trajectory-finalizer";

/// Owner to worker: a [`FinalizerInit`].
pub const INITIALIZATION: &str = "initialization";
/// Owner to worker: a batch of raw trajectories.
pub const TRAJECTORY: &str = "trajectory";
/// Owner to worker: episode rewards; pushes everything buffered.
pub const FLUSH_DATA: &str = "flush_data";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizerInit {
    /// Run config as JSON.
    pub config: String,
    pub spaces: EnvSpaces,
}

struct Finalizing {
    client: CoordinationClient,
    value_model: Box<dyn Model>,
    gamma: f32,
    gae_lambda: f32,
    reward_std: f64,
    buffer: Vec<Trajectory>,
}

/// Client-side background worker that finalizes trajectories and ships them.
///
/// Values come from a local replica of the value model, refreshed from the
/// store after every flush. Rewards are scaled by the server's running
/// reward std before GAE.
pub struct TrajectoryFinalizer {
    connect: StoreConnector,
    value_models: ValueModelFactory,
    state: Option<Finalizing>,
}

impl TrajectoryFinalizer {
    pub fn new(connect: StoreConnector, value_models: ValueModelFactory) -> Self {
        Self {
            connect,
            value_models,
            state: None,
        }
    }
}

impl Finalizing {
    fn finalize(&mut self, mut trajectory: Trajectory) -> Result<(), ExperienceError> {
        let outputs = self.value_model.get_output(&trajectory.value_inputs())?;
        let mut values: Vec<f32> = outputs.iter().filter_map(|o| o.first().copied()).collect();
        if trajectory.final_obs.is_none() {
            values.push(0.0);
        }
        trajectory.finalize(self.gamma, self.gae_lambda, &values, Some(self.reward_std as f32))?;
        self.buffer.push(trajectory);
        Ok(())
    }

    /// Ship buffered trajectories and `rewards` while the server is running.
    /// The buffer is emptied either way.
    async fn flush(&mut self, rewards: &[f32]) -> Result<(), ControlError> {
        let trajectories = std::mem::take(&mut self.buffer);
        if self.client.check_server_status().await? != Some(Status::Running) {
            debug!(dropped = trajectories.len(), "server not running, discarding experience");
            return Ok(());
        }

        if !trajectories.is_empty() {
            self.client.push_trajectories(&trajectories).await?;
        }
        if !rewards.is_empty() {
            self.client.push_policy_rewards(rewards).await?;
        }
        debug!(trajectories = trajectories.len(), rewards = rewards.len(), "flushed experience");

        self.refresh().await
    }

    async fn refresh(&mut self) -> Result<(), ControlError> {
        if let Some(params) = self.client.get_latest_value_params().await? {
            if let Err(e) = self.value_model.set_trainable_flat(&params) {
                warn!(error = %e, "rejected value params");
            }
        }
        let (_mean, std) = self.client.get_reward_stats().await?;
        self.reward_std = std;
        Ok(())
    }
}

#[async_trait]
impl Worker for TrajectoryFinalizer {
    async fn init(&mut self, ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        let packet = ctx.inbox.wait_for(INITIALIZATION).await?;
        let init: FinalizerInit = packet.decode()?;
        let cfg = RunConfig::from_json(&init.config)?;

        let value_model = (self.value_models)(&init.spaces)?;
        let store = (self.connect)().await.map_err(ControlError::from)?;
        let mut client = CoordinationClient::new(store);
        client.configure(&cfg)?;

        let mut state = Finalizing {
            client,
            value_model,
            gamma: cfg.policy_optimizer.gamma,
            gae_lambda: cfg.policy_optimizer.gae_lambda,
            reward_std: 1.0,
            buffer: Vec::new(),
        };

        // The server publishes epoch 0 before clients are let in, so this
        // normally succeeds at once.
        loop {
            if let Some(params) = state.client.get_latest_value_params().await? {
                state.value_model.set_trainable_flat(&params)?;
                break;
            }
            tokio::time::sleep(cfg.polling.status_interval()).await;
        }
        let (_mean, std) = state.client.get_reward_stats().await?;
        state.reward_std = std;

        info!(worker = %ctx.name, "trajectory finalizer ready");
        self.state = Some(state);
        Ok(())
    }

    async fn update(&mut self, ctx: &mut WorkerContext, packet: Packet) -> Result<(), WorkerError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        match packet.header.as_str() {
            TRAJECTORY => {
                let trajectories: Vec<Trajectory> = packet.decode()?;
                for trajectory in trajectories {
                    let timesteps = trajectory.len();
                    if let Err(e) = state.finalize(trajectory) {
                        warn!(worker = %ctx.name, error = %e, timesteps, "skipping trajectory that failed to finalize");
                    }
                }
            }
            FLUSH_DATA => {
                let rewards: Vec<f32> = packet.decode()?;
                match state.flush(&rewards).await {
                    Ok(()) => {}
                    Err(e) if e.is_transport() => {
                        warn!(worker = %ctx.name, error = %e, "flush failed, experience dropped");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            other => warn!(worker = %ctx.name, header = other, "unexpected packet"),
        }
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &mut WorkerContext) {
        if let Some(mut state) = self.state.take() {
            if !state.buffer.is_empty() {
                if let Err(e) = state.flush(&[]).await {
                    warn!(worker = %ctx.name, error = %e, "final flush failed");
                }
            }
        }
        info!(worker = %ctx.name, "trajectory finalizer shut down");
    }
}
