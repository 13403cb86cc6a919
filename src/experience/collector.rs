use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::errors::ExperienceError;
use super::timestep::Timestep;
use super::trajectory::Trajectory;
use crate::env::Env;
use crate::model::Model;

/// When a call to [`Collector::collect`] stops. The first limit reached wins;
/// at least one timestep is always taken.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CollectionBudget {
    pub timesteps: Option<usize>,
    pub duration: Option<Duration>,
    pub episodes: Option<usize>,
}

impl CollectionBudget {
    pub fn timesteps(n: usize) -> Self {
        Self {
            timesteps: Some(n),
            ..Self::default()
        }
    }

    pub fn duration(d: Duration) -> Self {
        Self {
            duration: Some(d),
            ..Self::default()
        }
    }

    pub fn episodes(n: usize) -> Self {
        Self {
            episodes: Some(n),
            ..Self::default()
        }
    }

    fn exhausted(&self, timesteps: usize, started: Instant, episodes: usize) -> bool {
        self.timesteps.is_some_and(|n| timesteps >= n)
            || self.duration.is_some_and(|d| started.elapsed() >= d)
            || self.episodes.is_some_and(|n| episodes >= n)
    }
}

/// Steps one environment with a policy and cuts the stream into trajectories.
///
/// Episodes may span calls: the observation and the running episode reward
/// carry over, but whatever is in flight when the budget runs out is emitted
/// as a partial trajectory bootstrapped from the next observation.
pub struct Collector {
    env: Box<dyn Env>,
    obs: Option<Vec<f32>>,
    current_ep_rew: f32,
    ep_rewards: Vec<f32>,
}

impl Collector {
    pub fn new(env: Box<dyn Env>) -> Self {
        Self {
            env,
            obs: None,
            current_ep_rew: 0.0,
            ep_rewards: Vec::new(),
        }
    }

    pub fn env(&self) -> &dyn Env {
        self.env.as_ref()
    }

    pub fn collect(
        &mut self,
        policy: &mut dyn Model,
        budget: CollectionBudget,
    ) -> Result<Vec<Trajectory>, ExperienceError> {
        self.collect_until(policy, budget, &AtomicBool::new(false))
    }

    /// Like [`collect`](Self::collect), but also stops after the current
    /// timestep once `cancel` is set. Meant for collections running on a
    /// blocking thread that the owner may need back early.
    pub fn collect_until(
        &mut self,
        policy: &mut dyn Model,
        budget: CollectionBudget,
        cancel: &AtomicBool,
    ) -> Result<Vec<Trajectory>, ExperienceError> {
        let mut obs = match self.obs.take() {
            Some(obs) => obs,
            None => self.env.reset()?,
        };

        let started = Instant::now();
        let mut trajectories = Vec::new();
        let mut trajectory = Trajectory::new();
        let mut timesteps = 0;

        loop {
            let (action, log_prob) = policy.get_action(&obs)?;
            let (mut next_obs, reward, done) = self.env.step(&action)?;
            self.current_ep_rew += reward;
            trajectory.register_timestep(Timestep::new(action, log_prob, reward, obs, done));
            timesteps += 1;

            if done {
                self.ep_rewards.push(self.current_ep_rew);
                self.current_ep_rew = 0.0;
                trajectory.final_obs = Some(next_obs);
                trajectories.push(std::mem::take(&mut trajectory));
                next_obs = self.env.reset()?;
            }

            obs = next_obs;
            if cancel.load(Ordering::Relaxed) || budget.exhausted(timesteps, started, trajectories.len()) {
                break;
            }
        }

        if !trajectory.is_empty() {
            trajectory.final_obs = Some(obs.clone());
            trajectory.is_partial = true;
            trajectories.push(trajectory);
        }
        self.obs = Some(obs);
        Ok(trajectories)
    }

    /// Rewards of every episode completed since the last call.
    pub fn take_episode_rewards(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.ep_rewards)
    }

    /// Give the environment back, e.g. to reuse it with a new policy.
    pub fn into_env(self) -> Box<dyn Env> {
        self.env
    }

    pub fn close(&mut self) -> Result<(), ExperienceError> {
        self.obs = None;
        self.env.close()?;
        Ok(())
    }
}
