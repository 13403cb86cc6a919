use thiserror::Error;

#[derive(Error, Debug)]
pub enum LearnerError {
    #[error("learner was asked to train before it was configured")]
    NotConfigured,

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    #[error("Learner error: {0}")]
    LearnerError(#[from] Box<dyn std::error::Error + Send + Sync>),
}
