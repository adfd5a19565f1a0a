//! Typed command and response frames exchanged with the token.
//!
//! The byte-level encoding belongs to the transport collaborator; this
//! module only fixes *what* is asked and *what* comes back. Secrets
//! travel inside [`SecretText`] / [`SecretBuffer`] so a frame scrubs
//! itself when dropped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceModel, FirmwareVersion};
use crate::memory::{SecretBuffer, SecretText};
use crate::policy::PinRole;

// ---------------------------------------------------------------------------
// Slot addressing
// ---------------------------------------------------------------------------

/// OTP algorithm family of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OtpKind {
    /// Counter-based (RFC 4226).
    Hotp,
    /// Time-based (RFC 6238).
    Totp,
}

/// Address of one OTP slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpSlotId {
    /// Algorithm family (each has its own slot bank).
    pub kind: OtpKind,
    /// Zero-based index inside the bank.
    pub index: u8,
}

impl OtpSlotId {
    /// HOTP slot `index`.
    #[must_use]
    pub const fn hotp(index: u8) -> Self {
        Self {
            kind: OtpKind::Hotp,
            index,
        }
    }

    /// TOTP slot `index`.
    #[must_use]
    pub const fn totp(index: u8) -> Self {
        Self {
            kind: OtpKind::Totp,
            index,
        }
    }
}

impl fmt::Display for OtpSlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OtpKind::Hotp => write!(f, "hotp#{}", self.index),
            OtpKind::Totp => write!(f, "totp#{}", self.index),
        }
    }
}

/// Number of digits in an OTP code (6 or 8 only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OtpDigits {
    /// 6-digit code (standard).
    Six,
    /// 8-digit code.
    Eight,
}

impl OtpDigits {
    /// Return the numeric digit count.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Six => 6,
            Self::Eight => 8,
        }
    }
}

/// Optional token identification carried in an OTP slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenId {
    /// OATH manufacturer prefix (2 chars).
    pub manufacturer: String,
    /// Token type (2 chars).
    pub token_type: String,
    /// Manufacturer unique identifier (8 chars).
    pub unique_id: String,
}

/// Read/write mode of the unencrypted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnencryptedMode {
    /// Host may only read.
    ReadOnly,
    /// Host may read and write.
    ReadWrite,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Everything the token needs to program one OTP slot.
#[derive(Debug, Clone)]
pub struct OtpSlotWrite {
    /// Target slot.
    pub slot: OtpSlotId,
    /// Slot label.
    pub name: String,
    /// Decoded shared secret.
    pub secret: SecretBuffer,
    /// Initial moving factor (HOTP), ignored for TOTP.
    pub counter: u64,
    /// Time step in seconds (TOTP), ignored for HOTP.
    pub interval_secs: u16,
    /// Code length.
    pub digits: OtpDigits,
    /// Optional token identification.
    pub token_id: Option<TokenId>,
}

/// One request frame.
#[derive(Debug, Clone)]
pub enum Command {
    /// Read model, firmware, flags.
    GetStatus,
    /// Read the device-side retry counter of a role.
    GetRetryCount(PinRole),
    /// Present a credential for a role.
    Authenticate {
        /// Role being authenticated.
        role: PinRole,
        /// Candidate credential.
        pin: SecretText,
    },
    /// Replace a credential.
    ChangePin {
        /// Role whose credential changes.
        role: PinRole,
        /// Current credential.
        old: SecretText,
        /// Replacement credential.
        new: SecretText,
    },
    /// Read the token clock (Unix seconds).
    GetTime,
    /// Overwrite the token clock (Unix seconds).
    SetTime(u64),
    /// Unlock the encrypted volume with the User PIN.
    EnableEncryptedVolume {
        /// User PIN.
        pin: SecretText,
    },
    /// Lock the encrypted volume.
    DisableEncryptedVolume,
    /// Switch the unencrypted volume between read-only and read-write.
    SetUnencryptedMode(UnencryptedMode),
    /// Ask the token for the not-yet-written part of the encrypted volume.
    GetUnwrittenRegion,
    /// Configure a hidden volume.
    CreateHiddenVolume {
        /// Hidden-volume slot (0..4).
        slot: u8,
        /// Start as percent of encrypted volume.
        start_pct: u8,
        /// End as percent of encrypted volume.
        end_pct: u8,
        /// Hidden-volume password.
        password: SecretText,
    },
    /// Unlock a hidden volume.
    EnableHiddenVolume {
        /// Hidden-volume slot.
        slot: u8,
        /// Hidden-volume password.
        password: SecretText,
    },
    /// Lock the active hidden volume.
    DisableHiddenVolume,
    /// Generate fresh AES master keys (destroys protected data).
    RegenerateAesKeys,
    /// Start overwriting the storage with random data.
    FillWithRandom,
    /// Poll the progress of a long-running operation.
    GetProgress,
    /// Acknowledge that a new SD card was detected.
    ClearNewSdCardFlag,
    /// Read metadata of an OTP slot.
    GetOtpSlot(OtpSlotId),
    /// Program an OTP slot.
    WriteOtpSlot(Box<OtpSlotWrite>),
    /// Erase an OTP slot.
    EraseOtpSlot(OtpSlotId),
    /// Compute a code for a slot; TOTP slots receive the host time.
    GetOtpCode {
        /// Slot to compute.
        slot: OtpSlotId,
        /// Host Unix time for TOTP, `None` for HOTP.
        unix_time: Option<u64>,
    },
    /// Unlock the password safe with the User PIN.
    UnlockSafe {
        /// User PIN.
        pin: SecretText,
    },
    /// Read which password-safe slots are programmed.
    GetSafeSlotStatus,
    /// Read one password-safe slot (safe must be unlocked).
    ReadSafeSlot(u8),
    /// Write one password-safe slot.
    WriteSafeSlot {
        /// Slot index.
        slot: u8,
        /// Entry label.
        name: String,
        /// Login.
        login: SecretText,
        /// Password.
        password: SecretText,
    },
    /// Erase one password-safe slot.
    EraseSafeSlot(u8),
    /// Lock volumes and safe, forget authentication.
    LockDevice,
    /// Enter firmware update mode (irreversible for this session).
    EnterUpdateMode {
        /// Firmware password.
        password: SecretText,
    },
    /// Permanently disable firmware updates and debug access.
    LockFirmware,
    /// Read a slice of the firmware image.
    ReadFirmware {
        /// Byte offset.
        offset: u32,
        /// Requested length.
        len: u16,
    },
    /// Wipe everything back to factory state.
    FactoryReset {
        /// Admin PIN.
        admin_pin: SecretText,
    },
}

/// Secret-free tag of a [`Command`], used for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    GetStatus,
    GetRetryCount,
    Authenticate,
    ChangePin,
    GetTime,
    SetTime,
    EnableEncryptedVolume,
    DisableEncryptedVolume,
    SetUnencryptedMode,
    GetUnwrittenRegion,
    CreateHiddenVolume,
    EnableHiddenVolume,
    DisableHiddenVolume,
    RegenerateAesKeys,
    FillWithRandom,
    GetProgress,
    ClearNewSdCardFlag,
    GetOtpSlot,
    WriteOtpSlot,
    EraseOtpSlot,
    GetOtpCode,
    UnlockSafe,
    GetSafeSlotStatus,
    ReadSafeSlot,
    WriteSafeSlot,
    EraseSafeSlot,
    LockDevice,
    EnterUpdateMode,
    LockFirmware,
    ReadFirmware,
    FactoryReset,
}

impl Command {
    /// Secret-free tag for this command.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::GetStatus => CommandKind::GetStatus,
            Self::GetRetryCount(_) => CommandKind::GetRetryCount,
            Self::Authenticate { .. } => CommandKind::Authenticate,
            Self::ChangePin { .. } => CommandKind::ChangePin,
            Self::GetTime => CommandKind::GetTime,
            Self::SetTime(_) => CommandKind::SetTime,
            Self::EnableEncryptedVolume { .. } => CommandKind::EnableEncryptedVolume,
            Self::DisableEncryptedVolume => CommandKind::DisableEncryptedVolume,
            Self::SetUnencryptedMode(_) => CommandKind::SetUnencryptedMode,
            Self::GetUnwrittenRegion => CommandKind::GetUnwrittenRegion,
            Self::CreateHiddenVolume { .. } => CommandKind::CreateHiddenVolume,
            Self::EnableHiddenVolume { .. } => CommandKind::EnableHiddenVolume,
            Self::DisableHiddenVolume => CommandKind::DisableHiddenVolume,
            Self::RegenerateAesKeys => CommandKind::RegenerateAesKeys,
            Self::FillWithRandom => CommandKind::FillWithRandom,
            Self::GetProgress => CommandKind::GetProgress,
            Self::ClearNewSdCardFlag => CommandKind::ClearNewSdCardFlag,
            Self::GetOtpSlot(_) => CommandKind::GetOtpSlot,
            Self::WriteOtpSlot(_) => CommandKind::WriteOtpSlot,
            Self::EraseOtpSlot(_) => CommandKind::EraseOtpSlot,
            Self::GetOtpCode { .. } => CommandKind::GetOtpCode,
            Self::UnlockSafe { .. } => CommandKind::UnlockSafe,
            Self::GetSafeSlotStatus => CommandKind::GetSafeSlotStatus,
            Self::ReadSafeSlot(_) => CommandKind::ReadSafeSlot,
            Self::WriteSafeSlot { .. } => CommandKind::WriteSafeSlot,
            Self::EraseSafeSlot(_) => CommandKind::EraseSafeSlot,
            Self::LockDevice => CommandKind::LockDevice,
            Self::EnterUpdateMode { .. } => CommandKind::EnterUpdateMode,
            Self::LockFirmware => CommandKind::LockFirmware,
            Self::ReadFirmware { .. } => CommandKind::ReadFirmware,
            Self::FactoryReset { .. } => CommandKind::FactoryReset,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Status byte returned with every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Command executed.
    Ok,
    /// Credential did not match.
    WrongPassword,
    /// Command needs an authentication the token does not hold.
    NotAuthorized,
    /// Slot is not programmed.
    SlotNotProgrammed,
    /// AES keys have never been generated.
    AesNotInitialized,
    /// Token is busy with a long-running operation.
    Busy,
    /// Known failure code specific to the command.
    Failed(u8),
    /// Code outside the protocol; the session can no longer be trusted.
    Unexpected(u8),
}

impl CommandStatus {
    /// Raw status code for diagnostics.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::WrongPassword => 4,
            Self::NotAuthorized => 5,
            Self::SlotNotProgrammed => 3,
            Self::AesNotInitialized => 10,
            Self::Busy => 1,
            Self::Failed(code) | Self::Unexpected(code) => code,
        }
    }

    /// Whether the command executed.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Token status as reported by [`Command::GetStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Hardware class.
    pub model: DeviceModel,
    /// Firmware version.
    pub firmware: FirmwareVersion,
    /// Card serial number.
    pub serial: String,
    /// Whether 40-byte OTP secrets are supported.
    pub secret320: bool,
    /// Whether AES keys have been generated.
    pub aes_initialized: bool,
    /// Whether OTP codes require the User PIN.
    pub otp_user_pin_protected: bool,
    /// Whether the firmware has been locked.
    pub firmware_locked: bool,
    /// Storage capacity in GB (0 when the model has no storage).
    pub storage_capacity_gb: u8,
    /// Whether the encrypted volume is currently unlocked.
    pub encrypted_volume_active: bool,
    /// Whether a hidden volume is currently unlocked.
    pub hidden_volume_active: bool,
    /// Current mode of the unencrypted volume.
    pub unencrypted_mode: UnencryptedMode,
    /// A new SD card was detected and has not been acknowledged.
    pub new_sd_card: bool,
    /// Storage has been overwritten with random data.
    pub filled_with_random: bool,
}

/// Metadata of one OTP slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpSlotInfo {
    /// Slot address.
    pub slot: OtpSlotId,
    /// Whether the slot holds a secret.
    pub programmed: bool,
    /// Slot label (empty when not programmed).
    pub name: String,
    /// Code length.
    pub digits: OtpDigits,
    /// TOTP interval (0 for HOTP).
    pub interval_secs: u16,
}

/// Decrypted contents of one password-safe slot.
#[derive(Debug, Clone)]
pub struct SafeSlotData {
    /// Entry label.
    pub name: String,
    /// Login.
    pub login: SecretText,
    /// Password.
    pub password: SecretText,
}

/// Not-yet-written span of the encrypted volume in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnwrittenRegion {
    /// First percent that is still unwritten.
    pub start_pct: u8,
    /// Last percent that is still unwritten.
    pub end_pct: u8,
}

/// Typed response payload.
#[derive(Debug, Clone)]
pub enum Payload {
    /// No data.
    Empty,
    /// Status report.
    Status(Box<StatusReport>),
    /// Remaining retries for a role.
    RetryCount(u8),
    /// Token time in Unix seconds.
    Time(u64),
    /// Unwritten region.
    Region(UnwrittenRegion),
    /// Long-operation progress in percent.
    Progress(u8),
    /// OTP slot metadata.
    OtpSlot(OtpSlotInfo),
    /// Raw OTP code (not yet zero-padded).
    OtpCode(u32),
    /// Programmed flags of each password-safe slot.
    SafeSlots(Vec<bool>),
    /// One decrypted password-safe slot.
    SafeSlot(SafeSlotData),
    /// Firmware image slice; shorter than requested at end of image.
    FirmwareChunk(Vec<u8>),
}

/// One response frame.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status byte.
    pub status: CommandStatus,
    /// Typed data.
    pub payload: Payload,
}

impl Response {
    /// Successful response with a payload.
    #[must_use]
    pub const fn ok(payload: Payload) -> Self {
        Self {
            status: CommandStatus::Ok,
            payload,
        }
    }

    /// Response carrying only a status byte.
    #[must_use]
    pub const fn status(status: CommandStatus) -> Self {
        Self {
            status,
            payload: Payload::Empty,
        }
    }
}
