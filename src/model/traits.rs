use super::errors::ModelError;

/// Policy or value network as seen by the rollout side. Gradients and losses
/// live entirely behind this seam.
pub trait Model: Send {
    /// Raw network output, one row per observation.
    fn get_output(&self, obs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError>;
    /// Sample an action for one observation. Returns `(action, log_prob)`.
    fn get_action(&mut self, obs: &[f32]) -> Result<(Vec<f32>, f32), ModelError>;
    fn get_trainable_flat(&self) -> Vec<f32>;
    fn set_trainable_flat(&mut self, params: &[f32]) -> Result<(), ModelError>;
}
