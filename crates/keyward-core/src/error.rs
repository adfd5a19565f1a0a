//! Error taxonomy for `keyward-core`.
//!
//! Four families, each with its own propagation rule:
//! - [`ValidationError`]: local, fail-fast, nothing was sent to the token
//! - [`AuthenticationError`]: side-effecting, a retry counter already moved
//! - [`DeviceError`]: transport or token failure, carries the raw status
//! - [`StateError`]: operation not permitted in the current state

use keyward_proto::{PinRole, ProtoError};
use thiserror::Error;

/// Authentication failures. Each one has already updated a retry counter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    /// Credential rejected; `tries_left` attempts remain before lockout.
    #[error("wrong {role} PIN, {tries_left} tries left")]
    WrongPin {
        /// Role that was attempted.
        role: PinRole,
        /// Remaining attempts (1 or 2).
        tries_left: u8,
    },

    /// Retry counter reached zero. Terminal for the role's protected data.
    #[error("{0} credential permanently locked out")]
    PermanentLockout(PinRole),

    /// AES keys were never generated (or were regenerated since unlock).
    #[error("AES keys not initialized, provision them with the Admin PIN")]
    NotInitialized,

    /// Operation requires a role that has not authenticated this session.
    #[error("{0} authentication required")]
    NotAuthenticated(PinRole),
}

/// Local input validation failures. Nothing was sent to the token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Too short or too long.
    #[error("bad length: {0}")]
    BadLength(String),

    /// Not parseable in the declared format, or unsupported by the device.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// Confirmation does not match.
    #[error("confirmation does not match")]
    Mismatch,

    /// Value outside its permitted range.
    #[error("out of range: {0}")]
    OutOfRange(String),
}

impl From<ProtoError> for ValidationError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::BadFormat(msg) | ProtoError::Unsupported(msg) => Self::BadFormat(msg),
            ProtoError::BadLength(msg) => Self::BadLength(msg),
            ProtoError::OutOfRange(msg) => Self::OutOfRange(msg),
        }
    }
}

/// Whether the caller may retry after a [`DeviceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The session is intact; the caller may retry.
    Recoverable,
    /// The session has been torn down.
    Fatal,
}

/// Transport and token failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// No response within the transport deadline.
    #[error("communication timeout")]
    CommunicationTimeout,

    /// No token attached, or the session was torn down.
    #[error("device disconnected")]
    Disconnected,

    /// Token returned a failure status.
    #[error("device returned status code {0}")]
    StatusCode(u8),

    /// Transport-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),

    /// Status code outside the protocol; the session is no longer trusted.
    #[error("unexpected device status {0:#04x}")]
    UnexpectedStatus(u8),

    /// Response payload did not match the command.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

impl DeviceError {
    /// Recoverable vs. fatal classification.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::CommunicationTimeout | Self::StatusCode(_) => FailureClass::Recoverable,
            Self::Disconnected
            | Self::Io(_)
            | Self::UnexpectedStatus(_)
            | Self::UnexpectedResponse(_) => FailureClass::Fatal,
        }
    }
}

/// Terminal session modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalMode {
    /// Token entered firmware update mode.
    UpdateMode,
    /// Token was factory reset; reconnect to continue.
    FactoryReset,
}

/// Operation not permitted in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// A precondition does not hold (e.g. encrypted volume locked).
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    /// Destructive operation attempted without caller acknowledgement.
    #[error("operation requires explicit confirmation")]
    ConfirmationRequired,

    /// Token clock differs from host clock beyond tolerance.
    #[error("device time is out of sync")]
    TimeOutOfSync,

    /// Session reached a terminal mode; reconnect required.
    #[error("session is terminal ({0:?}), reconnect required")]
    Terminal(TerminalMode),
}

/// Top-level error for every `keyward-core` operation.
#[derive(Debug, Error)]
pub enum KeywardError {
    /// Authentication failure (retry counter already updated).
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// Local validation failure (nothing sent).
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Transport or token failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// State-machine refusal.
    #[error(transparent)]
    State(#[from] StateError),

    /// Volume password rejected; volume state unchanged.
    #[error("wrong password (status code {status_code})")]
    WrongPassword {
        /// Raw status code.
        status_code: u8,
    },

    /// Token refused to program a slot.
    #[error("slot write failed: {0}")]
    WriteFailed(String),

    /// Command was cancelled by a detach or a caller checkpoint.
    #[error("operation cancelled")]
    Cancelled,

    /// Local I/O (options file, firmware export destination).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtoError> for KeywardError {
    fn from(err: ProtoError) -> Self {
        Self::Validation(err.into())
    }
}

impl KeywardError {
    /// Shorthand for [`StateError::PreconditionNotMet`].
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::State(StateError::PreconditionNotMet(msg.into()))
    }
}
