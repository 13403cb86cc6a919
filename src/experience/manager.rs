use tracing::{debug, warn};

use super::errors::ExperienceError;
use super::replay::ExperienceReplay;
use crate::control::CoordinationServer;

/// Moves experience from the coordination store into a replay.
#[derive(Debug)]
pub struct ExperienceManager {
    server: CoordinationServer,
    replay: ExperienceReplay,
}

impl ExperienceManager {
    pub fn new(server: CoordinationServer, replay: ExperienceReplay) -> Self {
        Self { server, replay }
    }

    pub fn replay(&self) -> &ExperienceReplay {
        &self.replay
    }

    pub fn replay_mut(&mut self) -> &mut ExperienceReplay {
        &mut self.replay
    }

    pub fn server_mut(&mut self) -> &mut CoordinationServer {
        &mut self.server
    }

    /// Wait for `num_timesteps` fresh timesteps and register them. Returns
    /// the timesteps registered and the current steps-per-second estimate.
    ///
    /// Trajectories that arrive without finalized columns are dropped.
    pub async fn get_timesteps_as_batches(&mut self, num_timesteps: usize) -> Result<(usize, f64), ExperienceError> {
        let trajectories = self.server.get_n_timesteps(num_timesteps).await?;

        let mut collected = 0;
        for trajectory in &trajectories {
            match self.replay.register_trajectory(trajectory) {
                Ok(()) => collected += trajectory.len(),
                Err(e) => warn!(error = %e, "dropping trajectory"),
            }
        }
        debug!(
            collected,
            replay = self.replay.num_timesteps(),
            "registered fresh timesteps"
        );
        Ok((collected, self.server.steps_per_second()))
    }

    pub fn cleanup(&mut self) {
        self.replay.clear();
    }
}
