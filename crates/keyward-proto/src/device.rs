//! Device models, firmware versions and the per-model limits that
//! local validation is checked against.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of counter-based OTP slots.
pub const HOTP_SLOT_COUNT: u8 = 3;

/// Number of time-based OTP slots.
pub const TOTP_SLOT_COUNT: u8 = 15;

/// Number of password-safe slots.
pub const SAFE_SLOT_COUNT: u8 = 16;

/// Password-safe field capacities in bytes (UTF-8 may use up to 4 per char).
pub const SAFE_NAME_LEN: usize = 11;
/// Password-safe login field capacity in bytes.
pub const SAFE_LOGIN_LEN: usize = 32;
/// Password-safe password field capacity in bytes.
pub const SAFE_PASSWORD_LEN: usize = 20;

/// Number of hidden-volume slots.
pub const HIDDEN_VOLUME_SLOT_COUNT: u8 = 4;

/// Hidden-volume password bounds in bytes.
pub const HIDDEN_VOLUME_PASSWORD_MIN: usize = 8;
/// Upper bound of a hidden-volume password in bytes.
pub const HIDDEN_VOLUME_PASSWORD_MAX: usize = 20;

/// Maximum OTP slot name length in bytes.
pub const OTP_NAME_LEN: usize = 15;

/// OTP secret capacity without the 320-bit extension.
pub const OTP_SECRET_LEN: usize = 20;

/// OTP secret capacity on firmware supporting 320-bit secrets.
pub const OTP_SECRET_LEN_EXTENDED: usize = 40;

/// Highest HOTP counter the storage model firmware accepts.
pub const STORAGE_HOTP_COUNTER_MAX: u64 = 9_999_999;

/// Bytes requested per firmware read.
pub const FIRMWARE_CHUNK_LEN: u16 = 512;

/// Upper bound of the firmware image in bytes.
pub const FIRMWARE_IMAGE_MAX: u32 = 262_144;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Hardware class of the connected token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceModel {
    /// OTP and password safe only.
    Pro,
    /// Adds encrypted, hidden and unencrypted mass-storage volumes.
    Storage,
}

impl DeviceModel {
    /// Whether this model exposes mass-storage volumes.
    #[must_use]
    pub const fn has_storage(self) -> bool {
        matches!(self, Self::Storage)
    }

    /// Upper bound for an HOTP moving-factor counter.
    #[must_use]
    pub const fn hotp_counter_max(self) -> u64 {
        match self {
            Self::Pro => u64::MAX,
            Self::Storage => STORAGE_HOTP_COUNTER_MAX,
        }
    }

    /// Display name used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pro => "pro",
            Self::Storage => "storage",
        }
    }
}

/// Firmware version as `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl FirmwareVersion {
    /// Construct a version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// Limits that depend on model and firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLimits {
    /// Largest accepted OTP secret in bytes.
    pub otp_secret_max: usize,
    /// Largest accepted HOTP counter.
    pub hotp_counter_max: u64,
    /// Older hardware class: OTP secrets must not start with a zero byte.
    pub rejects_leading_zero_secret: bool,
}

impl DeviceLimits {
    /// Derive the limits for a model/firmware pair.
    ///
    /// `secret320` is the device-reported capability bit for 40-byte secrets.
    #[must_use]
    pub fn for_device(model: DeviceModel, firmware: FirmwareVersion, secret320: bool) -> Self {
        let legacy = model == DeviceModel::Pro && firmware <= FirmwareVersion::new(0, 7);
        Self {
            otp_secret_max: if secret320 {
                OTP_SECRET_LEN_EXTENDED
            } else {
                OTP_SECRET_LEN
            },
            hotp_counter_max: model.hotp_counter_max(),
            rejects_leading_zero_secret: legacy,
        }
    }
}
