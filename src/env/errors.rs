use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("action has {got} components, environment expects {expected}")]
    ActionShape { expected: usize, got: usize },

    #[error("Environment error: {0}")]
    EnvError(#[from] Box<dyn std::error::Error + Send + Sync>),
}
