use thiserror::Error;

use crate::config::ConfigError;
use crate::control::ControlError;
use crate::experience::ExperienceError;
use crate::message::MessageError;

/// Failures on the owner side of the worker framework and in the transport
/// between owner and worker.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker is not running")]
    NotRunning,

    #[error("timeout")]
    Timeout,

    #[error("unknown worker kind: {0}")]
    UnknownWorker(String),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("shared memory holds {actual:?}, accessed as {requested:?}")]
    ElementKind {
        actual: super::ElementKind,
        requested: super::ElementKind,
    },

    #[error("shared memory range {start}..{end} is out of bounds for {len} elements")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("shared memory of {len} elements of {element_size} bytes overflows the address space")]
    TooLarge { len: usize, element_size: usize },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Anything a worker's lifecycle hooks can fail with. The loop logs it and
/// still runs `cleanup`.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("terminated while waiting for {0:?}")]
    Terminated(String),

    #[error("unexpected packet {0:?}")]
    UnexpectedPacket(String),

    #[error(transparent)]
    Runtime(#[from] Error),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Experience(#[from] ExperienceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),
}
