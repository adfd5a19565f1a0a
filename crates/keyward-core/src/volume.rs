//! Encrypted, hidden and unencrypted volumes, plus the storage-wide
//! maintenance operations (AES key regeneration, random fill).
//!
//! Hidden volume placement is checked against two bounds: the
//! unwritten region the token reports and the highest end of any hidden
//! volume created in this session. A new hidden volume must start at or
//! above both, so hidden volumes never overlap.
//!
//! Hidden volume creation and key regeneration are destructive and take
//! a [`CancelFlag`]. The flag is checked once, before anything is sent;
//! a command already handed to the token always completes.

use std::sync::Arc;
use std::thread;

use keyward_proto::device::{
    HIDDEN_VOLUME_PASSWORD_MAX, HIDDEN_VOLUME_PASSWORD_MIN, HIDDEN_VOLUME_SLOT_COUNT,
};
use keyward_proto::{
    Command, CommandStatus, Payload, PinRole, SecretText, UnencryptedMode, UnwrittenRegion,
};
use tracing::{debug, info, warn};

use crate::error::{DeviceError, KeywardError, ValidationError};
use crate::progress::{CancelFlag, ProgressSink};
use crate::session::{Confirmation, SessionManager};
use crate::state::{DeviceSession, HiddenVolume, HiddenVolumeState, VolumeState};

/// Volume operations of a storage token.
#[derive(Debug, Clone)]
pub struct VolumeController {
    session: Arc<SessionManager>,
}

impl VolumeController {
    /// Controller over `session`.
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    fn require_storage(&self) -> Result<(), KeywardError> {
        if self.session.with_device(|d| d.model().has_storage())? {
            Ok(())
        } else {
            Err(KeywardError::precondition("token has no storage volumes"))
        }
    }

    fn require_encrypted_enabled(&self) -> Result<(), KeywardError> {
        let state = self.session.with_device(|d| d.protected.encrypted)?;
        if state == VolumeState::Enabled {
            Ok(())
        } else {
            Err(KeywardError::precondition("encrypted volume is not enabled"))
        }
    }

    fn require_random_fill(&self) -> Result<(), KeywardError> {
        if self.session.with_device(|d| d.report.filled_with_random)? {
            Ok(())
        } else {
            Err(KeywardError::precondition(
                "storage not initialized with random data",
            ))
        }
    }

    fn require_admin(&self) -> Result<(), KeywardError> {
        Ok(self
            .session
            .with_device(|d| d.auth.require(PinRole::Admin))??)
    }

    // ── Encrypted volume ───────────────────────────────────────────

    /// Unlock the encrypted volume with the User PIN.
    ///
    /// The PIN is checked by the token and moves the User counter.
    ///
    /// # Errors
    ///
    /// - [`KeywardError::WrongPassword`] on a rejected PIN, volume unchanged
    /// - [`crate::AuthenticationError::PermanentLockout`] when the counter
    ///   is (or becomes) 0
    /// - [`KeywardError::Device`] for other failures
    pub fn enable_encrypted_volume(&self, user_pin: &str) -> Result<(), KeywardError> {
        self.require_storage()?;
        self.session
            .with_device(|d| d.auth.ensure_usable(PinRole::User))??;
        let response = self.session.dispatch(Command::EnableEncryptedVolume {
            pin: SecretText::new(user_pin),
        })?;
        match response.status {
            CommandStatus::Ok => {
                self.session.with_device(|d| {
                    d.auth.record_success(PinRole::User);
                    d.protected.encrypted = VolumeState::Enabled;
                    d.report.encrypted_volume_active = true;
                })?;
                info!("encrypted volume enabled");
                Ok(())
            }
            CommandStatus::WrongPassword => {
                let err = self
                    .session
                    .with_device(|d| d.auth.record_failure(PinRole::User))?;
                warn!(%err, "encrypted volume password rejected");
                match err {
                    crate::AuthenticationError::PermanentLockout(_) => Err(err.into()),
                    _ => Err(KeywardError::WrongPassword {
                        status_code: response.status.code(),
                    }),
                }
            }
            other => Err(DeviceError::StatusCode(other.code()).into()),
        }
    }

    /// Lock the encrypted volume; an unlocked hidden volume goes with it.
    ///
    /// # Errors
    ///
    /// [`crate::StateError::ConfirmationRequired`] or dispatch errors.
    pub fn disable_encrypted_volume(&self, confirmation: Confirmation) -> Result<(), KeywardError> {
        confirmation.require()?;
        self.require_storage()?;
        self.session.request(Command::DisableEncryptedVolume)?;
        self.session
            .with_device(DeviceSession::lock_encrypted_volume)?;
        info!("encrypted volume disabled");
        Ok(())
    }

    /// Switch the unencrypted volume between read-only and read-write.
    ///
    /// # Errors
    ///
    /// [`KeywardError::Device`] with the token's status when it refuses.
    pub fn set_unencrypted_volume_mode(&self, mode: UnencryptedMode) -> Result<(), KeywardError> {
        self.require_storage()?;
        self.session.request(Command::SetUnencryptedMode(mode))?;
        self.session.with_device(|d| d.report.unencrypted_mode = mode)?;
        info!(?mode, "unencrypted volume mode set");
        Ok(())
    }

    // ── Hidden volumes ─────────────────────────────────────────────

    /// Span where a new hidden volume may be placed.
    ///
    /// # Errors
    ///
    /// Dispatch errors.
    pub fn free_region(&self) -> Result<UnwrittenRegion, KeywardError> {
        self.require_storage()?;
        let reported = match self.session.request(Command::GetUnwrittenRegion)? {
            Payload::Region(region) => region,
            _ => return Err(self.session.protocol_violation("GetUnwrittenRegion")),
        };
        let high_water = self.session.with_device(|d| d.protected.high_water_pct)?;
        Ok(UnwrittenRegion {
            start_pct: reported.start_pct.max(high_water),
            end_pct: reported.end_pct.min(100),
        })
    }

    /// Configure hidden volume `slot` over `start_pct..end_pct` of the
    /// encrypted volume.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::OutOfRange`] for a bad slot or range, or a
    ///   range outside [`Self::free_region`]
    /// - [`ValidationError::BadLength`] / [`ValidationError::Mismatch`]
    ///   for the password
    /// - [`crate::StateError::PreconditionNotMet`] when the encrypted
    ///   volume is locked or the storage was never filled with random data
    /// - [`KeywardError::Cancelled`] when cancelled before anything is sent
    #[allow(clippy::too_many_arguments)]
    pub fn create_hidden_volume(
        &self,
        slot: u8,
        start_pct: u8,
        end_pct: u8,
        password: &str,
        confirm: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<(), KeywardError> {
        check_hidden_slot(slot)?;
        let (password, confirm) = (SecretText::new(password), SecretText::new(confirm));
        let len = password.byte_len();
        if !(HIDDEN_VOLUME_PASSWORD_MIN..=HIDDEN_VOLUME_PASSWORD_MAX).contains(&len) {
            return Err(ValidationError::BadLength(format!(
                "hidden volume password must be {HIDDEN_VOLUME_PASSWORD_MIN}-{HIDDEN_VOLUME_PASSWORD_MAX} characters"
            ))
            .into());
        }
        if !password.matches(&confirm) {
            return Err(ValidationError::Mismatch.into());
        }
        if start_pct >= end_pct || end_pct > 100 {
            return Err(ValidationError::OutOfRange(format!(
                "hidden volume range {start_pct}%-{end_pct}% is empty or exceeds 100%"
            ))
            .into());
        }

        self.require_storage()?;
        self.require_encrypted_enabled()?;
        self.require_random_fill()?;
        if cancel.is_cancelled() {
            return Err(KeywardError::Cancelled);
        }
        let free = self.free_region()?;
        if start_pct < free.start_pct || end_pct > free.end_pct {
            return Err(ValidationError::OutOfRange(format!(
                "hidden volume must lie between {}% and {}%",
                free.start_pct, free.end_pct
            ))
            .into());
        }

        progress.report(0);
        self.session.request(Command::CreateHiddenVolume {
            slot,
            start_pct,
            end_pct,
            password,
        })?;
        self.session.with_device(|d| {
            d.protected.hidden[usize::from(slot)] = HiddenVolume {
                state: HiddenVolumeState::Enabled,
                range: Some((start_pct, end_pct)),
            };
            d.protected.high_water_pct = d.protected.high_water_pct.max(end_pct);
        })?;
        progress.report(100);
        info!(slot, start_pct, end_pct, "hidden volume created");
        Ok(())
    }

    /// Unlock hidden volume `slot`. Any other unlocked hidden volume is
    /// locked by the token.
    ///
    /// The hidden volume password has no retry counter.
    ///
    /// # Errors
    ///
    /// [`KeywardError::WrongPassword`] when rejected, or the precondition
    /// and dispatch errors of [`Self::create_hidden_volume`].
    pub fn enable_hidden_volume(&self, slot: u8, password: &str) -> Result<(), KeywardError> {
        check_hidden_slot(slot)?;
        self.require_storage()?;
        self.require_encrypted_enabled()?;
        let response = self.session.dispatch(Command::EnableHiddenVolume {
            slot,
            password: SecretText::new(password),
        })?;
        match response.status {
            CommandStatus::Ok => {}
            CommandStatus::WrongPassword => {
                warn!(slot, "hidden volume password rejected");
                return Err(KeywardError::WrongPassword {
                    status_code: response.status.code(),
                });
            }
            other => return Err(DeviceError::StatusCode(other.code()).into()),
        }
        self.session.with_device(|d| {
            d.lock_hidden_volumes();
            let hidden = &mut d.protected.hidden[usize::from(slot)];
            hidden.state = HiddenVolumeState::Enabled;
            d.report.hidden_volume_active = true;
        })?;
        info!(slot, "hidden volume enabled");
        Ok(())
    }

    /// Lock hidden volume `slot`.
    ///
    /// # Errors
    ///
    /// [`crate::StateError::ConfirmationRequired`],
    /// [`crate::StateError::PreconditionNotMet`] when the slot is not
    /// unlocked, or dispatch errors.
    pub fn disable_hidden_volume(
        &self,
        slot: u8,
        confirmation: Confirmation,
    ) -> Result<(), KeywardError> {
        confirmation.require()?;
        check_hidden_slot(slot)?;
        self.require_storage()?;
        let state = self
            .session
            .with_device(|d| d.protected.hidden[usize::from(slot)].state)?;
        if state != HiddenVolumeState::Enabled {
            return Err(KeywardError::precondition(format!(
                "hidden volume {slot} is not enabled"
            )));
        }
        self.session.request(Command::DisableHiddenVolume)?;
        self.session
            .with_device(DeviceSession::lock_hidden_volumes)?;
        info!(slot, "hidden volume disabled");
        Ok(())
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Generate new AES keys.
    ///
    /// Every volume, hidden volume configuration and the password safe
    /// become unreadable. Requires Admin authentication.
    ///
    /// # Errors
    ///
    /// [`crate::StateError::ConfirmationRequired`],
    /// [`crate::AuthenticationError::NotAuthenticated`],
    /// [`KeywardError::Cancelled`] when cancelled before anything is sent,
    /// or dispatch errors.
    pub fn regenerate_aes_keys(
        &self,
        confirmation: Confirmation,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<(), KeywardError> {
        confirmation.require()?;
        self.require_admin()?;
        if cancel.is_cancelled() {
            return Err(KeywardError::Cancelled);
        }
        progress.report(0);
        self.session.request(Command::RegenerateAesKeys)?;
        self.session
            .with_device(DeviceSession::apply_key_regeneration)?;
        progress.report(100);
        warn!("AES keys regenerated, protected data discarded");
        Ok(())
    }

    /// Overwrite the whole storage with random data.
    ///
    /// Cancellation is honored only before the token starts; once
    /// started the fill runs to completion. Progress is polled every
    /// `progress_poll_ms`.
    ///
    /// # Errors
    ///
    /// [`KeywardError::Cancelled`] when cancelled before start,
    /// confirmation and Admin errors, or dispatch errors.
    pub fn fill_with_random(
        &self,
        confirmation: Confirmation,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<(), KeywardError> {
        confirmation.require()?;
        self.require_storage()?;
        self.require_admin()?;
        if cancel.is_cancelled() {
            return Err(KeywardError::Cancelled);
        }
        self.session.request(Command::FillWithRandom)?;
        info!("storage fill started");
        progress.report(0);

        let poll = self.session.options().progress_poll();
        let mut last = 0u8;
        loop {
            thread::sleep(poll);
            let response = self.session.dispatch(Command::GetProgress)?;
            let percent = match (response.status, response.payload) {
                (CommandStatus::Busy, _) => last,
                (CommandStatus::Ok, Payload::Progress(p)) => p.min(100).max(last),
                (CommandStatus::Ok, _) => {
                    return Err(self.session.protocol_violation("GetProgress"))
                }
                (other, _) => return Err(DeviceError::StatusCode(other.code()).into()),
            };
            if percent != last {
                debug!(percent, "storage fill progress");
                progress.report(percent);
                last = percent;
            }
            if percent >= 100 {
                break;
            }
        }

        self.session.with_device(DeviceSession::apply_storage_wipe)?;
        info!("storage fill complete");
        Ok(())
    }

    /// Acknowledge the new-SD-card warning.
    ///
    /// # Errors
    ///
    /// Admin and dispatch errors.
    pub fn clear_new_sd_card_warning(&self) -> Result<(), KeywardError> {
        self.require_storage()?;
        self.require_admin()?;
        self.session.request(Command::ClearNewSdCardFlag)?;
        self.session.with_device(|d| d.report.new_sd_card = false)?;
        Ok(())
    }
}

fn check_hidden_slot(slot: u8) -> Result<(), ValidationError> {
    if slot < HIDDEN_VOLUME_SLOT_COUNT {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange(format!(
            "hidden volume slot {slot} (expected 0-{})",
            HIDDEN_VOLUME_SLOT_COUNT.saturating_sub(1)
        )))
    }
}
