//! `keyward-proto`: token frames, device limits and secret handling.
//!
//! Pure building blocks: no threads, no I/O, no logging. Everything the
//! state machine in `keyward-core` validates locally is defined here.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;

pub mod device;
pub mod policy;

pub mod secret;

pub mod command;

pub use command::{
    Command, CommandKind, CommandStatus, OtpDigits, OtpKind, OtpSlotId, OtpSlotInfo, OtpSlotWrite,
    Payload, Response, SafeSlotData, StatusReport, TokenId, UnencryptedMode, UnwrittenRegion,
};
pub use device::{DeviceLimits, DeviceModel, FirmwareVersion};
pub use error::ProtoError;
pub use memory::{SecretBuffer, SecretText};
pub use policy::{check_candidate, PinPolicy, PinRole, PolicyVerdict, MAX_RETRIES};
pub use secret::{check_secret, decode_secret, encode_secret, SecretEncoding};
