//! `keyward-core`: session, authentication and volume state machine for
//! USB security tokens.
//!
//! A [`SessionManager`] owns the link to one token and serializes every
//! command through a single dispatcher thread. The controllers
//! ([`VolumeController`], [`OtpSlotManager`], [`PasswordSafeController`],
//! [`FirmwareModeController`]) share it through an `Arc` and enforce
//! authentication, confirmation and validation before anything is sent.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod logging;
pub mod options;
pub mod progress;
pub mod transport;

pub mod auth;
pub mod session;
pub mod state;

pub mod firmware;
pub mod otp;
pub mod safe;
pub mod volume;

pub mod operations;
pub mod simulator;

pub use auth::{AuthState, PinAuthenticator};
pub use error::{
    AuthenticationError, DeviceError, FailureClass, KeywardError, StateError, TerminalMode,
    ValidationError,
};
pub use firmware::FirmwareModeController;
pub use operations::{legal_operations, Operation};
pub use options::Options;
pub use otp::{CounterInit, EraseOutcome, OtpSlotConfig, OtpSlotManager};
pub use progress::{CancelFlag, NoProgress, ProgressSink};
pub use safe::PasswordSafeController;
pub use session::{
    Confirmation, DispatchOutcome, LinkState, PendingCommand, SessionManager, SessionSnapshot,
};
pub use state::{
    DeviceStatus, HiddenVolume, HiddenVolumeState, RoleStatus, SafeStatus, TimeSync, VolumeState,
};
pub use transport::{Clock, SystemClock, Transport, TransportError};
pub use volume::VolumeController;
