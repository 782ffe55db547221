use thiserror::Error;

use crate::can::bitrate::BitratePair;
use crate::driver::Status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Driver Error: {message}")]
    Driver { status: Status, message: String },

    /// No matching frame arrived before the deadline. `observed` counts the
    /// frames that were drained while waiting.
    #[error("timeout ({observed} msgs)")]
    Timeout { observed: usize },

    #[error("Device not started")]
    NotStarted,

    #[error("Device already started")]
    AlreadyStarted,

    #[error("Device stopped")]
    Stopped,

    #[error("Failed to start receive loop: {0}")]
    Spawn(String),

    #[error("bitrate array is empty")]
    NoCandidates,

    #[error("wrong index of bitrate array: {0}")]
    WrongIndex(i32),

    #[error("cannot find desired bitrate (detected {0})")]
    NotDesired(BitratePair),

    #[error("Bitrate detection already ran")]
    AlreadyDetected,

    #[error("Invalid operating mode: {0:?}")]
    InvalidMode(String),
}

impl Error {
    pub(crate) fn driver(status: Status, message: String) -> Self {
        Error::Driver { status, message }
    }
}
