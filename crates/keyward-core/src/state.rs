//! Per-connection state of one token.
//!
//! The [`DeviceSession`] lives in `SessionManager` behind a
//! `Mutex<Option<DeviceSession>>`:
//! - `None` while disconnected or terminal
//! - `Some(session)` once a connection handshake completed
//!
//! Dropping the session zeroizes every secret it caches (password-safe
//! entries are held in `SecretText`).
//!
//! Data that depends on the AES keys is grouped in [`ProtectedData`] so
//! that key regeneration can discard all of it with one assignment.

use std::time::{Duration, Instant};

use keyward_proto::device::{HIDDEN_VOLUME_SLOT_COUNT, HOTP_SLOT_COUNT, TOTP_SLOT_COUNT};
use keyward_proto::{
    DeviceLimits, DeviceModel, FirmwareVersion, OtpKind, OtpSlotId, OtpSlotInfo, PinRole,
    SafeSlotData, StatusReport, UnencryptedMode,
};
use serde::Serialize;

use crate::auth::{AuthState, PinAuthenticator};

// ── Volumes ────────────────────────────────────────────────────────

/// Encrypted volume state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeState {
    /// Locked.
    Disabled,
    /// Unlocked and mounted by the token.
    Enabled,
}

/// Hidden volume slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HiddenVolumeState {
    /// No configuration known to this session.
    NotConfigured,
    /// Configured and unlocked.
    Enabled,
    /// Configured but locked.
    Disabled,
}

/// One hidden volume slot as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenVolume {
    /// Slot state.
    pub state: HiddenVolumeState,
    /// `(start_pct, end_pct)` when created in this session.
    pub range: Option<(u8, u8)>,
}

impl HiddenVolume {
    const EMPTY: Self = Self {
        state: HiddenVolumeState::NotConfigured,
        range: None,
    };
}

// ── Password safe ──────────────────────────────────────────────────

/// Password safe state, without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SafeStatus {
    /// Contents not loaded.
    Locked,
    /// Contents loaded into host memory.
    Unlocked,
    /// Keys were regenerated; the old contents are gone.
    Invalidated,
}

/// Decrypted password-safe table.
#[derive(Debug)]
pub(crate) struct UnlockedSafe {
    pub(crate) slots: Vec<Option<SafeSlotData>>,
    pub(crate) unlocked_at: Instant,
}

#[derive(Debug)]
pub(crate) enum SafeState {
    Locked,
    Unlocked(UnlockedSafe),
    Invalidated,
}

impl SafeState {
    pub(crate) const fn status(&self) -> SafeStatus {
        match self {
            Self::Locked => SafeStatus::Locked,
            Self::Unlocked(_) => SafeStatus::Unlocked,
            Self::Invalidated => SafeStatus::Invalidated,
        }
    }

    /// Lock when the auto-lock timeout elapsed. Returns whether it did.
    pub(crate) fn expire(&mut self, timeout: Option<Duration>) -> bool {
        let expired = match (&*self, timeout) {
            (Self::Unlocked(safe), Some(limit)) => safe.unlocked_at.elapsed() >= limit,
            _ => false,
        };
        if expired {
            *self = Self::Locked;
        }
        expired
    }
}

// ── Key-dependent data ─────────────────────────────────────────────

/// Everything encrypted under the token's AES keys.
#[derive(Debug)]
pub(crate) struct ProtectedData {
    pub(crate) encrypted: VolumeState,
    pub(crate) hidden: [HiddenVolume; HIDDEN_VOLUME_SLOT_COUNT as usize],
    /// Highest end percent of any hidden volume created in this session.
    pub(crate) high_water_pct: u8,
    pub(crate) safe: SafeState,
}

impl ProtectedData {
    fn from_report(report: &StatusReport) -> Self {
        Self {
            encrypted: if report.encrypted_volume_active {
                VolumeState::Enabled
            } else {
                VolumeState::Disabled
            },
            hidden: [HiddenVolume::EMPTY; HIDDEN_VOLUME_SLOT_COUNT as usize],
            high_water_pct: 0,
            safe: SafeState::Locked,
        }
    }

    /// State after the keys were regenerated.
    const fn regenerated() -> Self {
        Self {
            encrypted: VolumeState::Disabled,
            hidden: [HiddenVolume::EMPTY; HIDDEN_VOLUME_SLOT_COUNT as usize],
            high_water_pct: 0,
            safe: SafeState::Invalidated,
        }
    }
}

// ── Clock ──────────────────────────────────────────────────────────

/// Comparison of token and host clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSync {
    /// Token time minus host time, in seconds.
    pub skew_secs: i64,
    /// Whether `|skew_secs|` exceeds the configured tolerance.
    pub out_of_sync: bool,
}

impl TimeSync {
    /// Compare `device` and `host` Unix times.
    #[must_use]
    pub fn measure(device: u64, host: u64, tolerance_secs: u64) -> Self {
        let device = i64::try_from(device).unwrap_or(i64::MAX);
        let host = i64::try_from(host).unwrap_or(i64::MAX);
        let skew_secs = device.saturating_sub(host);
        Self {
            skew_secs,
            out_of_sync: skew_secs.unsigned_abs() > tolerance_secs,
        }
    }

    /// Clocks agree.
    #[must_use]
    pub const fn in_sync() -> Self {
        Self {
            skew_secs: 0,
            out_of_sync: false,
        }
    }
}

// ── Session ────────────────────────────────────────────────────────

/// State of one connected token.
#[derive(Debug)]
pub(crate) struct DeviceSession {
    pub(crate) id: u64,
    pub(crate) report: StatusReport,
    pub(crate) limits: DeviceLimits,
    pub(crate) auth: PinAuthenticator,
    pub(crate) time: TimeSync,
    pub(crate) otp: Vec<OtpSlotInfo>,
    pub(crate) protected: ProtectedData,
}

impl DeviceSession {
    pub(crate) fn new(
        id: u64,
        report: StatusReport,
        counters: [u8; 3],
        time: TimeSync,
        otp: Vec<OtpSlotInfo>,
    ) -> Self {
        let limits = DeviceLimits::for_device(report.model, report.firmware, report.secret320);
        let protected = ProtectedData::from_report(&report);
        Self {
            id,
            limits,
            auth: PinAuthenticator::from_counters(counters),
            time,
            otp,
            protected,
            report,
        }
    }

    pub(crate) const fn model(&self) -> DeviceModel {
        self.report.model
    }

    pub(crate) fn otp_slot(&self, id: OtpSlotId) -> Option<&OtpSlotInfo> {
        self.otp.iter().find(|s| s.slot == id)
    }

    pub(crate) fn otp_slot_mut(&mut self, id: OtpSlotId) -> Option<&mut OtpSlotInfo> {
        self.otp.iter_mut().find(|s| s.slot == id)
    }

    /// Discard everything encrypted under the old keys.
    pub(crate) fn apply_key_regeneration(&mut self) {
        self.protected = ProtectedData::regenerated();
        self.report.aes_initialized = true;
        self.report.encrypted_volume_active = false;
        self.report.hidden_volume_active = false;
    }

    /// Storage was overwritten: volumes and hidden configuration are gone.
    pub(crate) fn apply_storage_wipe(&mut self) {
        self.protected.encrypted = VolumeState::Disabled;
        self.protected.hidden = [HiddenVolume::EMPTY; HIDDEN_VOLUME_SLOT_COUNT as usize];
        self.protected.high_water_pct = 0;
        self.report.encrypted_volume_active = false;
        self.report.hidden_volume_active = false;
        self.report.filled_with_random = true;
        self.report.new_sd_card = false;
    }

    /// Unlocked hidden volumes become `Disabled`; configuration stays.
    pub(crate) fn lock_hidden_volumes(&mut self) {
        for hidden in &mut self.protected.hidden {
            if hidden.state == HiddenVolumeState::Enabled {
                hidden.state = HiddenVolumeState::Disabled;
            }
        }
        self.report.hidden_volume_active = false;
    }

    /// Encrypted volume locked, taking any hidden volume with it.
    pub(crate) fn lock_encrypted_volume(&mut self) {
        self.protected.encrypted = VolumeState::Disabled;
        self.report.encrypted_volume_active = false;
        self.lock_hidden_volumes();
    }

    /// Volumes and safe locked, every role forgotten.
    pub(crate) fn apply_lock(&mut self) {
        self.auth.deauthenticate_all();
        self.lock_encrypted_volume();
        if matches!(self.protected.safe, SafeState::Unlocked(_)) {
            self.protected.safe = SafeState::Locked;
        }
    }

    pub(crate) fn status(&self) -> DeviceStatus {
        DeviceStatus {
            session_id: self.id,
            model: self.report.model,
            firmware: self.report.firmware,
            serial: self.report.serial.clone(),
            storage_capacity_gb: self.report.storage_capacity_gb,
            limits: self.limits,
            auth: PinRole::ALL.map(|role| RoleStatus {
                role,
                state: self.auth.state(role),
                retries: self.auth.retries(role),
            }),
            time: self.time,
            aes_initialized: self.report.aes_initialized,
            otp_user_pin_protected: self.report.otp_user_pin_protected,
            firmware_locked: self.report.firmware_locked,
            new_sd_card: self.report.new_sd_card,
            filled_with_random: self.report.filled_with_random,
            unencrypted_mode: self.report.unencrypted_mode,
            encrypted_volume: self.protected.encrypted,
            hidden_volumes: self.protected.hidden,
            safe: self.protected.safe.status(),
            otp_slots: self.otp.clone(),
        }
    }
}

/// Every OTP slot address of a token, HOTP bank first.
pub(crate) fn all_otp_slots() -> impl Iterator<Item = OtpSlotId> {
    (0..HOTP_SLOT_COUNT)
        .map(OtpSlotId::hotp)
        .chain((0..TOTP_SLOT_COUNT).map(OtpSlotId::totp))
}

/// Whether `id` addresses an existing slot.
pub(crate) const fn otp_slot_exists(id: OtpSlotId) -> bool {
    match id.kind {
        OtpKind::Hotp => id.index < HOTP_SLOT_COUNT,
        OtpKind::Totp => id.index < TOTP_SLOT_COUNT,
    }
}

// ── Public views ───────────────────────────────────────────────────

/// Retry state of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleStatus {
    /// Role.
    pub role: PinRole,
    /// Authentication state.
    pub state: AuthState,
    /// Remaining attempts.
    pub retries: u8,
}

/// Secret-free snapshot of a connected token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Connection generation; changes on every reconnect.
    pub session_id: u64,
    /// Hardware class.
    pub model: DeviceModel,
    /// Firmware version.
    pub firmware: FirmwareVersion,
    /// Card serial number.
    pub serial: String,
    /// Storage capacity in GB.
    pub storage_capacity_gb: u8,
    /// Validation limits in force.
    pub limits: DeviceLimits,
    /// Per-role authentication, indexed by [`PinRole::index`].
    pub auth: [RoleStatus; 3],
    /// Clock comparison made at connect or last resync.
    pub time: TimeSync,
    /// AES keys generated.
    pub aes_initialized: bool,
    /// OTP codes require the User PIN.
    pub otp_user_pin_protected: bool,
    /// Firmware updates permanently disabled.
    pub firmware_locked: bool,
    /// New SD card not yet acknowledged.
    pub new_sd_card: bool,
    /// Storage overwritten with random data.
    pub filled_with_random: bool,
    /// Unencrypted volume mode.
    pub unencrypted_mode: UnencryptedMode,
    /// Encrypted volume state.
    pub encrypted_volume: VolumeState,
    /// Hidden volume slots.
    pub hidden_volumes: [HiddenVolume; HIDDEN_VOLUME_SLOT_COUNT as usize],
    /// Password safe state.
    pub safe: SafeStatus,
    /// OTP slot metadata.
    pub otp_slots: Vec<OtpSlotInfo>,
}

impl DeviceStatus {
    /// State of `role`.
    #[must_use]
    pub const fn auth_state(&self, role: PinRole) -> AuthState {
        self.auth[role.index()].state
    }

    /// Remaining attempts of `role`.
    #[must_use]
    pub const fn retries(&self, role: PinRole) -> u8 {
        self.auth[role.index()].retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_proto::SecretText;

    fn report() -> StatusReport {
        StatusReport {
            model: DeviceModel::Storage,
            firmware: FirmwareVersion::new(0, 53),
            serial: "0001".into(),
            secret320: true,
            aes_initialized: true,
            otp_user_pin_protected: false,
            firmware_locked: false,
            storage_capacity_gb: 16,
            encrypted_volume_active: true,
            hidden_volume_active: false,
            unencrypted_mode: UnencryptedMode::ReadWrite,
            new_sd_card: true,
            filled_with_random: false,
        }
    }

    fn session() -> DeviceSession {
        DeviceSession::new(1, report(), [3, 3, 3], TimeSync::in_sync(), Vec::new())
    }

    #[test]
    fn skew_beyond_tolerance_is_out_of_sync() {
        assert!(!TimeSync::measure(1_000, 1_030, 30).out_of_sync);
        let sync = TimeSync::measure(1_000, 1_031, 30);
        assert!(sync.out_of_sync);
        assert_eq!(sync.skew_secs, -31);
    }

    #[test]
    fn regeneration_discards_protected_data() {
        let mut s = session();
        s.protected.high_water_pct = 60;
        s.protected.hidden[1] = HiddenVolume {
            state: HiddenVolumeState::Enabled,
            range: Some((40, 60)),
        };
        s.protected.safe = SafeState::Unlocked(UnlockedSafe {
            slots: vec![Some(SafeSlotData {
                name: "mail".into(),
                login: SecretText::new("me"),
                password: SecretText::new("pw"),
            })],
            unlocked_at: Instant::now(),
        });

        s.apply_key_regeneration();

        assert_eq!(s.protected.encrypted, VolumeState::Disabled);
        assert_eq!(s.protected.high_water_pct, 0);
        assert!(s
            .protected
            .hidden
            .iter()
            .all(|h| h.state == HiddenVolumeState::NotConfigured));
        assert_eq!(s.protected.safe.status(), SafeStatus::Invalidated);
    }

    #[test]
    fn lock_keeps_hidden_configuration() {
        let mut s = session();
        s.auth.record_success(PinRole::Admin);
        s.protected.hidden[0] = HiddenVolume {
            state: HiddenVolumeState::Enabled,
            range: Some((20, 30)),
        };
        s.apply_lock();
        assert_eq!(s.protected.hidden[0].state, HiddenVolumeState::Disabled);
        assert_eq!(s.protected.hidden[0].range, Some((20, 30)));
        assert!(!s.auth.is_authenticated(PinRole::Admin));
    }

    #[test]
    fn safe_expires_after_timeout() {
        let mut safe = SafeState::Unlocked(UnlockedSafe {
            slots: Vec::new(),
            unlocked_at: Instant::now(),
        });
        assert!(!safe.expire(None));
        assert!(safe.expire(Some(Duration::ZERO)));
        assert_eq!(safe.status(), SafeStatus::Locked);
    }

    #[test]
    fn slot_addressing_covers_both_banks() {
        assert_eq!(all_otp_slots().count(), 18);
        assert!(otp_slot_exists(OtpSlotId::totp(14)));
        assert!(!otp_slot_exists(OtpSlotId::hotp(3)));
    }
}
