mod errors;
mod traits;

pub use errors::EnvError;
pub use traits::Env;

// Simple test environment: a counter that pays 1 per step and ends after
// `episode_len` steps.
pub struct DummyEnv {
    step_count: usize,
    episode_len: usize,
}

impl DummyEnv {
    pub fn new() -> Self {
        Self::with_episode_len(10)
    }

    pub fn with_episode_len(episode_len: usize) -> Self {
        Self {
            step_count: 0,
            episode_len,
        }
    }

    fn obs(&self) -> Vec<f32> {
        vec![self.step_count as f32, 1.0]
    }
}

impl Default for DummyEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Env for DummyEnv {
    fn reset(&mut self) -> Result<Vec<f32>, EnvError> {
        self.step_count = 0;
        Ok(self.obs())
    }

    fn step(&mut self, action: &[f32]) -> Result<(Vec<f32>, f32, bool), EnvError> {
        if action.len() != 1 {
            return Err(EnvError::ActionShape {
                expected: 1,
                got: action.len(),
            });
        }
        self.step_count += 1;
        let done = self.step_count >= self.episode_len;
        Ok((self.obs(), 1.0, done))
    }

    fn observation_shape(&self) -> Vec<usize> {
        vec![2]
    }

    fn action_shape(&self) -> Vec<usize> {
        vec![1]
    }
}
