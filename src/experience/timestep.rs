use serde::{Deserialize, Serialize};

/// One agent tick. Immutable once built; a `Trajectory` takes ownership of it
/// in `register_timestep`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestep {
    pub action: Vec<f32>,
    pub log_prob: f32,
    pub reward: f32,
    pub obs: Vec<f32>,
    pub done: bool,
}

impl Timestep {
    pub fn new(action: Vec<f32>, log_prob: f32, reward: f32, obs: Vec<f32>, done: bool) -> Self {
        Self {
            action,
            log_prob,
            reward,
            obs,
            done,
        }
    }
}
