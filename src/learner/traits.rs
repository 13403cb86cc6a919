use async_trait::async_trait;

use super::errors::LearnerError;
use crate::config::RunConfig;
use crate::control::{EnvSpaces, ModelUpdate};
use crate::experience::Batch;

/// What one call to `learn` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnReport {
    pub batches: usize,
    pub timesteps: usize,
    pub loss: Option<f32>,
}

/// Server-side optimizer. Builds its models once the env spaces are known and
/// consumes shuffled batches; the loss itself is opaque here.
#[async_trait]
pub trait Learner: Send {
    async fn configure(&mut self, cfg: &RunConfig, spaces: &EnvSpaces) -> Result<(), LearnerError>;
    async fn learn(&mut self, batches: Vec<Batch>) -> Result<LearnReport, LearnerError>;
    /// Artifacts to publish for the current parameters.
    fn snapshot(&self) -> Result<ModelUpdate, LearnerError>;
}
