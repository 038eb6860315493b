//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

use crate::model::ServerId;

/// Customized error type for ballast.
///
/// Most failures are carried as plain strings; the variants the supervisor
/// must branch on (conflicting key movement, recruitment outcomes, clean
/// cancellation, failed-server escalation) get their own tags.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BallastError {
    /// Generic stringly-typed error.
    Msg(String),

    /// A concurrent key movement invalidated our transaction; the caller
    /// should re-check whether data distribution is still enabled.
    MoveKeysConflict,

    /// The worker refused or could not complete recruitment.
    RecruitmentFailed,

    /// The recruitment request may or may not have reached the worker.
    RequestMaybeDelivered,

    /// Clean cancellation of a tracker or request in flight.
    Cancelled,

    /// A server in `FAILED` exclusion state must have its keys cleared and
    /// then be removed by the supervisor.
    RemoveFailedServer(ServerId),
}

impl BallastError {
    /// Creates a generic message error.
    pub fn msg(m: impl ToString) -> Self {
        BallastError::Msg(m.to_string())
    }
}

impl fmt::Display for BallastError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BallastError::Msg(s) => write!(f, "{}", s),
            BallastError::MoveKeysConflict => write!(f, "move keys conflict"),
            BallastError::RecruitmentFailed => write!(f, "recruitment failed"),
            BallastError::RequestMaybeDelivered => {
                write!(f, "request maybe delivered")
            }
            BallastError::Cancelled => write!(f, "cancelled"),
            BallastError::RemoveFailedServer(id) => {
                write!(f, "remove failed server {}", id)
            }
        }
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `BallastError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for BallastError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                BallastError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BallastError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BallastError::Msg(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for BallastError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        BallastError::Msg(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = BallastError::msg("placement gone wrong");
        assert_eq!(format!("{}", e), String::from("placement gone wrong"));
        assert_eq!(
            format!("{}", BallastError::MoveKeysConflict),
            String::from("move keys conflict")
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = BallastError::from(io_error);
        assert!(matches!(e, BallastError::Msg(ref s) if s.contains("oh no!")));
    }
}
