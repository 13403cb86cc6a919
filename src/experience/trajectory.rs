//! Trajectories and their finalization (discounted returns + GAE).
//!
//! For rewards `r[0..T)`, value estimates `v[0..=T]` (the last entry is the
//! bootstrap value of the observation after the final step), discount `γ`
//! and trace decay `λ`:
//!
//! ```text
//! g[t]    = r[t] + γ g[t+1]
//! m[t]    = 1 - done[t]
//! ret[t]  = r[t] + γ v[t+1] m[t]
//! δ[t]    = ret[t] - v[t]
//! A[t]    = δ[t] + γ λ m[t] A[t+1]
//! V'[t]   = v[t] + A[t]
//! ```
//!
//! All recurrences run back to front.

use serde::{Deserialize, Serialize};

use super::errors::ExperienceError;
use super::timestep::Timestep;
use crate::message::{MessageError, MessageSerializer};

/// One agent's rollout between environment resets.
///
/// The per-step columns grow together through `register_timestep`. After
/// `finalize` the four derived columns have the same length as `rewards`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub actions: Vec<Vec<f32>>,
    pub log_probs: Vec<f32>,
    pub rewards: Vec<f32>,
    pub obs: Vec<Vec<f32>>,
    pub dones: Vec<bool>,
    /// Observation immediately after the last registered step.
    pub final_obs: Option<Vec<f32>>,

    pub future_rewards: Vec<f32>,
    pub values: Vec<f32>,
    pub advantages: Vec<f32>,
    pub pred_rets: Vec<f32>,

    /// Cut off by the collection budget rather than by a terminal step.
    pub is_partial: bool,
    pub ep_rew: f32,
    pub noise_idx: u32,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_timestep(&mut self, timestep: Timestep) {
        let Timestep {
            action,
            log_prob,
            reward,
            obs,
            done,
        } = timestep;

        self.actions.push(action);
        self.log_probs.push(log_prob);
        self.rewards.push(reward);
        self.obs.push(obs);
        self.dones.push(done);
        self.ep_rew += reward;
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        let n = self.len();
        self.future_rewards.len() == n
            && self.values.len() == n
            && self.advantages.len() == n
            && self.pred_rets.len() == n
    }

    /// Keep only the first `stop` timesteps of every column.
    pub fn truncate(&mut self, stop: usize) {
        self.actions.truncate(stop);
        self.log_probs.truncate(stop);
        self.rewards.truncate(stop);
        self.obs.truncate(stop);
        self.dones.truncate(stop);
        self.future_rewards.truncate(stop);
        self.values.truncate(stop);
        self.advantages.truncate(stop);
        self.pred_rets.truncate(stop);
    }

    /// Observations the value estimator must score: every step plus the
    /// bootstrap observation when there is one.
    pub fn value_inputs(&self) -> Vec<Vec<f32>> {
        let mut inputs = self.obs.clone();
        if let Some(final_obs) = &self.final_obs {
            inputs.push(final_obs.clone());
        }
        inputs
    }

    pub fn compute_future_rewards(&mut self, gamma: f32) {
        self.future_rewards = discounted_future_sum(&self.rewards, gamma);
    }

    /// Compute returns-to-go, advantages, predicted returns and exported values.
    ///
    /// `values` must hold `len() + 1` estimates. Returns are always computed
    /// from the raw rewards; when `reward_scale` is given the GAE recurrence
    /// sees `reward / reward_scale` instead. Calling again with different
    /// value estimates recomputes the value-dependent columns only.
    pub fn finalize(
        &mut self,
        gamma: f32,
        gae_lambda: f32,
        values: &[f32],
        reward_scale: Option<f32>,
    ) -> Result<(), ExperienceError> {
        let n = self.len();
        if values.len() != n + 1 {
            return Err(ExperienceError::ValueLength {
                expected: n + 1,
                got: values.len(),
            });
        }

        self.compute_future_rewards(gamma);

        let scaled;
        let rewards = match reward_scale {
            Some(scale) if scale > 0.0 && scale != 1.0 => {
                scaled = self.rewards.iter().map(|r| r / scale).collect::<Vec<_>>();
                &scaled
            }
            _ => &self.rewards,
        };

        let estimate = generalized_advantage(rewards, values, &self.dones, gamma, gae_lambda);
        self.values = values[..n]
            .iter()
            .zip(&estimate.advantages)
            .map(|(v, a)| v + a)
            .collect();
        self.advantages = estimate.advantages;
        self.pred_rets = estimate.pred_rets;
        Ok(())
    }

    pub fn pack(&self, serializer: &MessageSerializer) -> Result<Vec<u8>, MessageError> {
        serializer.pack(self)
    }

    pub fn unpack(serializer: &MessageSerializer, data: &[u8]) -> Result<Self, MessageError> {
        serializer.unpack(data)
    }
}

/// `out[t] = Σ_{k≥t} γ^(k-t) r[k]`
pub fn discounted_future_sum(rewards: &[f32], gamma: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; rewards.len()];
    let mut running = 0.0f32;
    for t in (0..rewards.len()).rev() {
        running = rewards[t] + gamma * running;
        out[t] = running;
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvantageEstimate {
    pub advantages: Vec<f32>,
    pub pred_rets: Vec<f32>,
}

/// GAE over one trajectory. `values` has one more entry than `rewards`.
///
/// `dones[t]` masks the bootstrap out of step `t` itself: a step that ends an
/// episode never looks at `values[t + 1]`, and no advantage flows back across
/// it. Formulations that mask with the next step's flag instead, `dones[t + 1]`,
/// differ only when an episode boundary falls inside the trajectory.
pub fn generalized_advantage(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    gamma: f32,
    gae_lambda: f32,
) -> AdvantageEstimate {
    let n = rewards.len();
    debug_assert_eq!(values.len(), n + 1);
    debug_assert_eq!(dones.len(), n);

    let mut advantages = vec![0.0f32; n];
    let mut pred_rets = vec![0.0f32; n];
    let mut last_gae = 0.0f32;

    for t in (0..n).rev() {
        let not_done = if dones[t] { 0.0 } else { 1.0 };
        let pred_ret = rewards[t] + gamma * values[t + 1] * not_done;
        let delta = pred_ret - values[t];
        last_gae = delta + gamma * gae_lambda * not_done * last_gae;

        pred_rets[t] = pred_ret;
        advantages[t] = last_gae;
    }

    AdvantageEstimate {
        advantages,
        pred_rets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trajectory(rewards: &[f32], dones: &[bool]) -> Trajectory {
        let mut traj = Trajectory::new();
        for (i, (&r, &d)) in rewards.iter().zip(dones).enumerate() {
            traj.register_timestep(Timestep::new(vec![i as f32], -0.5, r, vec![i as f32, 1.0], d));
        }
        traj.final_obs = Some(vec![99.0, 1.0]);
        traj
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len(), "{a:?} vs {b:?}");
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn done_masks_its_own_step_bootstrap() {
        let estimate = generalized_advantage(&[1.0, 1.0], &[5.0, 5.0, 5.0], &[true, false], 1.0, 1.0);
        assert_eq!(estimate.pred_rets, vec![1.0, 6.0]);
        assert_eq!(estimate.advantages, vec![-4.0, 1.0]);
    }

    #[test]
    fn zero_values_and_unit_discount_give_returns_as_advantages() {
        let mut traj = trajectory(&[1.0, 1.0, 1.0], &[false, false, true]);
        traj.finalize(1.0, 1.0, &[0.0; 4], None).unwrap();

        assert_eq!(traj.future_rewards, vec![3.0, 2.0, 1.0]);
        assert_eq!(traj.advantages, traj.future_rewards);
        assert_eq!(traj.values, vec![3.0, 2.0, 1.0]);
        assert!(traj.is_finalized());
    }

    #[test]
    fn bootstrap_value_feeds_last_step_of_partial_trajectory() {
        let mut traj = trajectory(&[0.0, 0.0], &[false, false]);
        traj.finalize(0.5, 1.0, &[0.0, 0.0, 8.0], None).unwrap();

        assert_close(&traj.pred_rets, &[0.0, 4.0]);
        assert_close(&traj.advantages, &[2.0, 4.0]);
        assert_close(&traj.future_rewards, &[0.0, 0.0]);
    }

    #[test]
    fn terminal_step_ignores_bootstrap() {
        let mut traj = trajectory(&[1.0], &[true]);
        traj.finalize(0.99, 0.95, &[0.25, 100.0], None).unwrap();
        assert_close(&traj.pred_rets, &[1.0]);
        assert_close(&traj.advantages, &[0.75]);
        assert_close(&traj.values, &[1.0]);
    }

    #[test]
    fn lambda_zero_is_one_step_td() {
        let mut traj = trajectory(&[1.0, 2.0, 3.0], &[false, false, false]);
        let values = [0.5, 1.0, 1.5, 2.0];
        traj.finalize(0.9, 0.0, &values, None).unwrap();

        let expected: Vec<f32> = (0..3)
            .map(|t| traj.rewards[t] + 0.9 * values[t + 1] - values[t])
            .collect();
        assert_close(&traj.advantages, &expected);
    }

    #[test]
    fn refinalizing_with_new_values_keeps_returns() {
        let mut traj = trajectory(&[1.0, 0.0, 2.0], &[false, false, true]);
        traj.finalize(0.9, 0.95, &[0.0; 4], None).unwrap();
        let returns = traj.future_rewards.clone();
        let first_adv = traj.advantages.clone();

        traj.finalize(0.9, 0.95, &[1.0, 1.0, 1.0, 1.0], None).unwrap();
        assert_eq!(traj.future_rewards, returns);
        assert_ne!(traj.advantages, first_adv);
    }

    #[test]
    fn reward_scale_affects_advantages_not_returns() {
        let mut scaled = trajectory(&[2.0, 2.0], &[false, true]);
        scaled.finalize(1.0, 1.0, &[0.0; 3], Some(2.0)).unwrap();
        assert_close(&scaled.future_rewards, &[4.0, 2.0]);
        assert_close(&scaled.advantages, &[2.0, 1.0]);
    }

    #[test]
    fn value_length_is_checked() {
        let mut traj = trajectory(&[1.0, 1.0], &[false, true]);
        let err = traj.finalize(0.9, 0.9, &[0.0, 0.0], None).unwrap_err();
        assert!(matches!(err, ExperienceError::ValueLength { expected: 3, got: 2 }));
    }

    #[test]
    fn empty_trajectory_finalizes_to_empty_columns() {
        let mut traj = Trajectory::new();
        traj.finalize(0.99, 0.95, &[3.0], None).unwrap();
        assert!(traj.is_finalized());
        assert!(traj.advantages.is_empty());
    }

    #[test]
    fn discounted_sum_matches_closed_form() {
        let out = discounted_future_sum(&[1.0, 2.0, 4.0], 0.5);
        assert_close(&out, &[1.0 + 1.0 + 1.0, 2.0 + 2.0, 4.0]);
    }

    #[test]
    fn serialized_trajectory_roundtrips() {
        let serializer = MessageSerializer::new("lz4", 64).unwrap();

        let mut traj = trajectory(&[0.5, -1.0, 2.0], &[false, false, true]);
        traj.noise_idx = 3;
        traj.finalize(0.99, 0.95, &[0.1, 0.2, 0.3, 0.4], None).unwrap();
        let bytes = traj.pack(&serializer).unwrap();
        assert_eq!(Trajectory::unpack(&serializer, &bytes).unwrap(), traj);

        let empty = Trajectory::new();
        let bytes = empty.pack(&serializer).unwrap();
        assert_eq!(Trajectory::unpack(&serializer, &bytes).unwrap(), empty);
    }

    #[test]
    fn truncate_cuts_every_column() {
        let mut traj = trajectory(&[1.0, 2.0, 3.0], &[false, false, true]);
        traj.finalize(0.9, 0.9, &[0.0; 4], None).unwrap();
        traj.truncate(1);
        assert_eq!(traj.len(), 1);
        assert!(traj.is_finalized());
        assert_eq!(traj.actions.len(), 1);
    }
}
