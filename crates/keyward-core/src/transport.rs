//! Collaborator contracts: the command transport and the host clock.

use std::time::{SystemTime, UNIX_EPOCH};

use keyward_proto::{Command, Response};
use thiserror::Error;

/// Failure reported by a transport for one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No answer before the transport's deadline.
    #[error("timeout")]
    Timeout,
    /// Link-level failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Single serial channel to one token.
///
/// Implementations are only ever driven from the dispatcher thread, one
/// exchange at a time; they need not be re-entrant.
pub trait Transport: Send {
    /// Send one frame and wait for its response.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if the token did not answer in time,
    /// [`TransportError::Io`] for link failures.
    fn send(&mut self, command: &Command) -> Result<Response, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, command: &Command) -> Result<Response, TransportError> {
        (**self).send(command)
    }
}

/// Source of host wall-clock time.
pub trait Clock: Send + Sync {
    /// Current Unix time in seconds.
    fn now_unix(&self) -> u64;
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}
