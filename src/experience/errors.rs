use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExperienceError {
    #[error("expected {expected} value estimates (timesteps + bootstrap), got {got}")]
    ValueLength { expected: usize, got: usize },

    #[error("trajectory of {timesteps} timesteps was registered before finalize")]
    NotFinalized { timesteps: usize },

    #[error("batch size must be positive")]
    ZeroBatchSize,

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    #[error(transparent)]
    Env(#[from] crate::env::EnvError),

    #[error(transparent)]
    Control(#[from] crate::control::ControlError),

    #[error(transparent)]
    Runtime(#[from] crate::runtime::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("shuffling worker exited")]
    ShufflerGone,
}
