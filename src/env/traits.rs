use super::errors::EnvError;

/// Simulation collaborator driven by a rollout client.
pub trait Env: Send {
    fn reset(&mut self) -> Result<Vec<f32>, EnvError>;
    /// Returns `(next_obs, reward, done)`.
    fn step(&mut self, action: &[f32]) -> Result<(Vec<f32>, f32, bool), EnvError>;
    fn observation_shape(&self) -> Vec<usize>;
    fn action_shape(&self) -> Vec<usize>;
    fn close(&mut self) -> Result<(), EnvError> {
        Ok(())
    }
}
