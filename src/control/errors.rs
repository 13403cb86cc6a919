use thiserror::Error;

use crate::config::ConfigError;
use crate::message::MessageError;

/// Failure talking to the coordination store itself.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unreachable: {0}")]
    Unreachable(String),

    #[error("coordination store command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Unreachable(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("epoch {attempted} is not newer than published epoch {published}")]
    StaleEpoch { published: u64, attempted: u64 },

    #[error("{0} is missing from the coordination store")]
    Missing(&'static str),

    #[error("unknown server status '{0}'")]
    UnknownStatus(String),
}

impl ControlError {
    /// Faults the caller has to answer by retrying or reconfiguring: the store
    /// went away, or a peer sent something this process cannot decode.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ControlError::Store(_)
                | ControlError::Message(
                    MessageError::UnknownCompression { .. }
                        | MessageError::Decompress { .. }
                        | MessageError::Deserialize(_)
                )
        )
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ControlError::Store(StoreError::Unreachable(_)))
    }
}
