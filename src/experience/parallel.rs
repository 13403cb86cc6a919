use std::time::Duration;

use tracing::{debug, info, warn};

use super::errors::ExperienceError;
use super::replay::Batch;
use crate::config::RunConfig;
use crate::runtime::{Launcher, ProcessHandler, WorkerSpec};
use crate::workers::{EXPERIENCE_BATCH, INITIALIZATION_DATA, MISC_DATA, SHUFFLER_KIND, ShufflerReport};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Server-side owner of the shuffling worker. Collects the batches it
/// prepares and the statistics it reports alongside them.
#[derive(Debug)]
pub struct ParallelExperienceManager {
    handler: ProcessHandler,
    reward_mean: f64,
    reward_std: f64,
    timesteps_collected: usize,
    steps_per_second: f64,
}

impl ParallelExperienceManager {
    pub async fn start(launcher: &Launcher, cfg: &RunConfig) -> Result<Self, ExperienceError> {
        let spec = WorkerSpec::new(SHUFFLER_KIND, "server_data_shuffling_process");
        let mut handler = ProcessHandler::setup(launcher, spec, None, None).await?;
        if !handler.put(INITIALIZATION_DATA, &cfg.to_json()?)? {
            handler.close().await;
            return Err(ExperienceError::ShufflerGone);
        }
        info!("started shuffling worker");

        Ok(Self {
            handler,
            reward_mean: 0.0,
            reward_std: 1.0,
            timesteps_collected: 0,
            steps_per_second: 0.0,
        })
    }

    /// Wait until the worker delivers at least one batch and return every
    /// batch available. `timesteps_collected` sums the reports received
    /// during this call.
    pub async fn get_all_batches_shuffled(&mut self) -> Result<Vec<Batch>, ExperienceError> {
        self.timesteps_collected = 0;
        let mut batches = Vec::new();

        while batches.is_empty() {
            let packets = self.handler.get_all();
            if packets.is_empty() {
                if !self.handler.is_alive() {
                    return Err(ExperienceError::ShufflerGone);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            for packet in packets {
                match packet.header.as_str() {
                    MISC_DATA => {
                        let report: ShufflerReport = packet.decode()?;
                        self.reward_mean = report.reward_mean;
                        self.reward_std = report.reward_std;
                        self.steps_per_second = report.steps_per_second;
                        self.timesteps_collected += report.timesteps_collected;
                    }
                    EXPERIENCE_BATCH => batches.push(packet.decode()?),
                    other => warn!(header = other, "unexpected packet from shuffling worker"),
                }
            }
        }

        debug!(
            batches = batches.len(),
            timesteps = self.timesteps_collected,
            "received shuffled batches"
        );
        Ok(batches)
    }

    pub fn reward_mean(&self) -> f64 {
        self.reward_mean
    }

    pub fn reward_std(&self) -> f64 {
        self.reward_std
    }

    pub fn timesteps_collected(&self) -> usize {
        self.timesteps_collected
    }

    pub fn steps_per_second(&self) -> f64 {
        self.steps_per_second
    }

    pub async fn cleanup(&mut self) {
        self.handler.close().await;
    }
}
