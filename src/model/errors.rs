use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("expected {expected} parameters, got {got}")]
    ParamLength { expected: usize, got: usize },

    #[error("expected {expected} inputs, got {got}")]
    InputLength { expected: usize, got: usize },

    #[error("Model error: {0}")]
    ModelError(#[from] Box<dyn std::error::Error + Send + Sync>),
}
