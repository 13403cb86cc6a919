use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::StoreConnector;
use crate::config::RunConfig;
use crate::control::{ControlError, CoordinationServer};
use crate::experience::{Batch, ExperienceError, ExperienceManager, ExperienceReplay};
use crate::runtime::{Packet, Worker, WorkerContext, WorkerError};

pub const SHUFFLER_KIND: &str = "parallel-shuffler";

/// Owner to worker: the run config, as JSON.
pub const INITIALIZATION_DATA: &str = "initialization_data";
/// Worker to owner: one shuffled [`Batch`].
pub const EXPERIENCE_BATCH: &str = "experience_batch";
/// Worker to owner: a [`ShufflerReport`] for the batches that follow it.
pub const MISC_DATA: &str = "misc_data";

const BACKLOG_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShufflerReport {
    pub reward_mean: f64,
    pub reward_std: f64,
    pub timesteps_collected: usize,
    pub steps_per_second: f64,
}

struct Shuffling {
    manager: ExperienceManager,
    timesteps_per_update: usize,
    batch_size: usize,
    retry_wait: Duration,
}

/// Drains the coordination store on the server side, off the training loop.
///
/// Each round publishes the batches prepared in the previous round, then
/// waits for `timesteps_per_update` new timesteps, registers them in its
/// replay and prepares the next shuffled batches. Nothing new is prepared
/// while the owner still has unread output. Transport faults while waiting
/// are retried on the next round.
pub struct ParallelShuffler {
    connect: StoreConnector,
    state: Option<Shuffling>,
    pending: Vec<Batch>,
}

impl ParallelShuffler {
    pub fn new(connect: StoreConnector) -> Self {
        Self {
            connect,
            state: None,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl Worker for ParallelShuffler {
    async fn init(&mut self, ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        let packet = ctx.inbox.wait_for(INITIALIZATION_DATA).await?;
        let raw: String = packet.decode()?;
        let cfg = RunConfig::from_json(&raw)?;

        let store = (self.connect)().await.map_err(ControlError::from)?;
        let mut server = CoordinationServer::new(store, cfg.experience.max_buffer_size)
            .with_serializer(cfg.networking.serializer()?)
            .with_polling(cfg.polling.clone());
        server.connect(false, false).await?;

        let state = Shuffling {
            manager: ExperienceManager::new(server, ExperienceReplay::from_config(&cfg)),
            timesteps_per_update: cfg.timesteps_per_update(),
            batch_size: cfg.policy_optimizer.batch_size,
            retry_wait: cfg.polling.status_interval(),
        };
        info!(
            worker = %ctx.name,
            timesteps_per_update = state.timesteps_per_update,
            batch_size = state.batch_size,
            "shuffler ready"
        );
        self.state = Some(state);
        Ok(())
    }

    async fn update(&mut self, ctx: &mut WorkerContext, packet: Packet) -> Result<(), WorkerError> {
        debug!(worker = %ctx.name, header = %packet.header, "shuffler ignores updates");
        Ok(())
    }

    async fn publish(&mut self, ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        if !ctx.outbox.is_empty() {
            tokio::time::sleep(BACKLOG_WAIT).await;
            return Ok(());
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        for batch in self.pending.drain(..) {
            ctx.outbox.publish(EXPERIENCE_BATCH, &batch).await?;
        }

        // Waiting for data can take arbitrarily long; stay responsive to stop.
        let (collected, steps_per_second) = tokio::select! {
            result = state.manager.get_timesteps_as_batches(state.timesteps_per_update) => match result {
                Ok(collected) => collected,
                Err(ExperienceError::Control(e)) if e.is_transport() => {
                    warn!(worker = %ctx.name, error = %e, "store fault while waiting for experience, retrying");
                    tokio::time::sleep(state.retry_wait).await;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
            () = ctx.inbox.stopped() => {
                return Err(WorkerError::Terminated("stop while waiting for experience".to_string()));
            }
        };

        let replay = state.manager.replay_mut();
        self.pending = replay.get_all_batches_shuffled(state.batch_size)?;
        let report = ShufflerReport {
            reward_mean: replay.reward_stats().mean(),
            reward_std: replay.reward_stats().std(),
            timesteps_collected: collected,
            steps_per_second,
        };
        debug!(
            worker = %ctx.name,
            batches = self.pending.len(),
            collected,
            "prepared shuffled batches"
        );
        ctx.outbox.publish(MISC_DATA, &report).await?;
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &mut WorkerContext) {
        // The store belongs to the training server; only local state goes.
        if let Some(mut state) = self.state.take() {
            state.manager.cleanup();
        }
        self.pending.clear();
        info!(worker = %ctx.name, "shuffling worker shut down");
    }
}
