use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::ControlError;

/// Server-owned status, one value for the whole run.
///
/// ```text
/// INITIALIZING -> RECONFIGURE -> AWAITING_ENV_SPACES -> RUNNING -> {RESET | RECONFIGURE | STOPPING}
/// RESET -> RECONFIGURE -> AWAITING_ENV_SPACES -> RUNNING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Initializing,
    Running,
    Stopping,
    Reset,
    Reconfigure,
    AwaitingEnvSpaces,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Initializing,
        Status::Running,
        Status::Stopping,
        Status::Reset,
        Status::Reconfigure,
        Status::AwaitingEnvSpaces,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Initializing => "REDIS_SERVER_INITIALIZING_STATUS",
            Status::Running => "REDIS_SERVER_RUNNING_STATUS",
            Status::Stopping => "REDIS_SERVER_STOPPING_STATUS",
            Status::Reset => "REDIS_SERVER_RESET_STATUS",
            Status::Reconfigure => "REDIS_SERVER_RECONFIGURE_STATUS",
            Status::AwaitingEnvSpaces => "REDIS_SERVER_AWAITING_ENV_SPACES_STATUS",
        }
    }

    /// Clients tear down local state and wait on these.
    pub fn requires_teardown(self) -> bool {
        matches!(self, Status::Reconfigure | Status::Initializing | Status::Stopping)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ControlError::UnknownStatus(s.to_string()))
    }
}
