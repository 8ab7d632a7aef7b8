//! Error taxonomy for the upload engine.
//!
//! Every fallible core operation returns `Result<_, UploadError>` (or a
//! narrower leaf error that converts into it via `#[from]`), so the
//! coordinator can dispatch on [`Severity`] instead of matching message
//! strings. The five variants mirror the severity ladder of the design:
//! notices are reported and swallowed, everything above `Recoverable`
//! terminates the run.

use thiserror::Error;

use crate::checksum::ChecksumError;
use crate::schedule::ScheduleError;

/// Coarse classification used by the coordinator to decide whether to
/// continue, retry, or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Reported, execution continues.
    Notice,
    /// Reported, retried after a fixed backoff, indefinitely.
    Recoverable,
    /// Resumed state is internally inconsistent. Reported, fatal.
    Inconsistency,
    /// Cannot even begin the upload. Reported, fatal, exit 1.
    PreFlight,
    /// The loop finished but the transfer did not complete successfully.
    FatalTerminal,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Notice(String),

    #[error("transport error: {0}")]
    Recoverable(String),

    #[error("inconsistent resume state: {0}")]
    Inconsistency(String),

    #[error("{0}")]
    PreFlight(String),

    #[error("{0}")]
    FatalTerminal(String),

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn severity(&self) -> Severity {
        match self {
            UploadError::Notice(_) => Severity::Notice,
            UploadError::Recoverable(_) => Severity::Recoverable,
            UploadError::Inconsistency(_) => Severity::Inconsistency,
            UploadError::PreFlight(_) => Severity::PreFlight,
            UploadError::FatalTerminal(_) => Severity::FatalTerminal,
            UploadError::Schedule(_) => Severity::PreFlight,
            UploadError::Checksum(_) => Severity::PreFlight,
            UploadError::Io(_) => Severity::PreFlight,
        }
    }

    pub fn pre_flight(msg: impl Into<String>) -> Self {
        UploadError::PreFlight(msg.into())
    }

    pub fn inconsistency(msg: impl Into<String>) -> Self {
        UploadError::Inconsistency(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        UploadError::FatalTerminal(msg.into())
    }

    pub fn recoverable(msg: impl Into<String>) -> Self {
        UploadError::Recoverable(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ranks_preflight_above_recoverable() {
        assert!(Severity::PreFlight > Severity::Recoverable);
        assert!(Severity::FatalTerminal > Severity::PreFlight);
    }

    #[test]
    fn pre_flight_constructor_carries_message() {
        let err = UploadError::pre_flight("object already exists");
        assert_eq!(err.severity(), Severity::PreFlight);
        assert_eq!(err.to_string(), "object already exists");
    }
}
