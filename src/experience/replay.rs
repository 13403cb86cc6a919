//! Columnar experience store the learner samples batches from.

use std::ops::Range;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::errors::ExperienceError;
use super::running_stat::RunningStat;
use super::trajectory::Trajectory;

/// Row-aligned columns of finalized timesteps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub actions: Vec<Vec<f32>>,
    pub log_probs: Vec<f32>,
    pub rewards: Vec<f32>,
    pub obs: Vec<Vec<f32>>,
    pub dones: Vec<bool>,
    pub future_rewards: Vec<f32>,
    pub values: Vec<f32>,
    pub advantages: Vec<f32>,
    pub pred_rets: Vec<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.log_probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_probs.is_empty()
    }

    fn append(&mut self, traj: &Trajectory) {
        self.actions.extend_from_slice(&traj.actions);
        self.log_probs.extend_from_slice(&traj.log_probs);
        self.rewards.extend_from_slice(&traj.rewards);
        self.obs.extend_from_slice(&traj.obs);
        self.dones.extend_from_slice(&traj.dones);
        self.future_rewards.extend_from_slice(&traj.future_rewards);
        self.values.extend_from_slice(&traj.values);
        self.advantages.extend_from_slice(&traj.advantages);
        self.pred_rets.extend_from_slice(&traj.pred_rets);
    }

    fn drop_front(&mut self, n: usize) {
        self.actions.drain(..n);
        self.log_probs.drain(..n);
        self.rewards.drain(..n);
        self.obs.drain(..n);
        self.dones.drain(..n);
        self.future_rewards.drain(..n);
        self.values.drain(..n);
        self.advantages.drain(..n);
        self.pred_rets.drain(..n);
    }

    fn slice(&self, range: Range<usize>) -> Batch {
        Batch {
            actions: self.actions[range.clone()].to_vec(),
            log_probs: self.log_probs[range.clone()].to_vec(),
            rewards: self.rewards[range.clone()].to_vec(),
            obs: self.obs[range.clone()].to_vec(),
            dones: self.dones[range.clone()].to_vec(),
            future_rewards: self.future_rewards[range.clone()].to_vec(),
            values: self.values[range.clone()].to_vec(),
            advantages: self.advantages[range.clone()].to_vec(),
            pred_rets: self.pred_rets[range].to_vec(),
        }
    }

    fn select(&self, rows: &[usize]) -> Batch {
        Batch {
            actions: rows.iter().map(|&i| self.actions[i].clone()).collect(),
            log_probs: rows.iter().map(|&i| self.log_probs[i]).collect(),
            rewards: rows.iter().map(|&i| self.rewards[i]).collect(),
            obs: rows.iter().map(|&i| self.obs[i].clone()).collect(),
            dones: rows.iter().map(|&i| self.dones[i]).collect(),
            future_rewards: rows.iter().map(|&i| self.future_rewards[i]).collect(),
            values: rows.iter().map(|&i| self.values[i]).collect(),
            advantages: rows.iter().map(|&i| self.advantages[i]).collect(),
            pred_rets: rows.iter().map(|&i| self.pred_rets[i]).collect(),
        }
    }

    fn chunks(&self, batch_size: usize) -> Vec<Batch> {
        (0..self.len() / batch_size)
            .map(|i| self.slice(i * batch_size..(i + 1) * batch_size))
            .collect()
    }
}

/// Keeps at most `max_buffer_size` rows, dropping the oldest rows first.
///
/// Shuffles draw from a ChaCha8 stream seeded at construction, so two
/// replays built with the same seed and fed the same data produce the same
/// batches.
#[derive(Debug)]
pub struct ExperienceReplay {
    rows: Batch,
    ep_rews: Vec<f32>,
    noise_idxs: Vec<u32>,
    max_buffer_size: usize,
    reward_stats: RunningStat,
    rng: ChaCha8Rng,
}

impl ExperienceReplay {
    pub fn new(max_buffer_size: usize, seed: u64) -> Self {
        Self {
            rows: Batch::default(),
            ep_rews: Vec::new(),
            noise_idxs: Vec::new(),
            max_buffer_size,
            reward_stats: RunningStat::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn from_config(cfg: &crate::config::RunConfig) -> Self {
        Self::new(cfg.experience.max_buffer_size, cfg.seed)
    }

    pub fn register_trajectory(&mut self, traj: &Trajectory) -> Result<(), ExperienceError> {
        if !traj.is_finalized() {
            return Err(ExperienceError::NotFinalized {
                timesteps: traj.len(),
            });
        }

        self.reward_stats.extend(traj.future_rewards.iter().copied());
        self.rows.append(traj);
        self.ep_rews.push(traj.ep_rew);
        self.noise_idxs.push(traj.noise_idx);
        self.clamp_size();
        Ok(())
    }

    pub fn num_timesteps(&self) -> usize {
        self.rows.len()
    }

    /// Statistics over every future reward ever registered. `clear` resets them.
    pub fn reward_stats(&self) -> &RunningStat {
        &self.reward_stats
    }

    pub fn episode_rewards(&self) -> &[f32] {
        &self.ep_rews
    }

    pub fn noise_indices(&self) -> &[u32] {
        &self.noise_idxs
    }

    /// Permute all rows, then cut `floor(rows / batch_size)` batches. The
    /// remainder is dropped. When `batch_size` equals the row count the
    /// single batch keeps insertion order.
    pub fn get_all_batches_shuffled(&mut self, batch_size: usize) -> Result<Vec<Batch>, ExperienceError> {
        if batch_size == 0 {
            return Err(ExperienceError::ZeroBatchSize);
        }
        if batch_size == self.num_timesteps() {
            return self.get_all_batches(batch_size);
        }

        let mut indices: Vec<usize> = (0..self.num_timesteps()).collect();
        indices.shuffle(&mut self.rng);
        Ok(self.rows.select(&indices).chunks(batch_size))
    }

    pub fn get_all_batches(&self, batch_size: usize) -> Result<Vec<Batch>, ExperienceError> {
        if batch_size == 0 {
            return Err(ExperienceError::ZeroBatchSize);
        }
        Ok(self.rows.chunks(batch_size))
    }

    pub fn get_all(&self) -> &Batch {
        &self.rows
    }

    /// The oldest `size` rows, or everything when fewer are stored.
    pub fn get_batch(&self, size: usize) -> Batch {
        if size > self.num_timesteps() {
            warn!(
                requested = size,
                available = self.num_timesteps(),
                "batch larger than replay, returning entire memory"
            );
            return self.rows.clone();
        }
        self.rows.slice(0..size)
    }

    /// `size` distinct rows drawn uniformly, capped at the stored row count.
    pub fn get_random_batch(&mut self, size: usize) -> Batch {
        let mut indices: Vec<usize> = (0..self.num_timesteps()).collect();
        indices.shuffle(&mut self.rng);
        indices.truncate(size);
        self.rows.select(&indices)
    }

    pub fn clear(&mut self) {
        self.rows = Batch::default();
        self.ep_rews.clear();
        self.noise_idxs.clear();
        self.reward_stats.reset();
    }

    fn clamp_size(&mut self) {
        let excess = self.rows.len().saturating_sub(self.max_buffer_size);
        if excess > 0 {
            self.rows.drop_front(excess);
        }
        let excess = self.ep_rews.len().saturating_sub(self.max_buffer_size);
        if excess > 0 {
            self.ep_rews.drain(..excess);
            self.noise_idxs.drain(..excess);
        }
    }
}
