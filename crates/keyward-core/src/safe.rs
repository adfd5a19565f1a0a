//! Password safe: unlock, slot access, scrub on lock.
//!
//! Decrypted entries are held in [`SecretText`] inside the device
//! session and are zeroized whenever the safe locks, the keys are
//! regenerated or the session ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keyward_proto::device::{SAFE_LOGIN_LEN, SAFE_NAME_LEN, SAFE_PASSWORD_LEN, SAFE_SLOT_COUNT};
use keyward_proto::{Command, CommandStatus, Payload, PinRole, SafeSlotData, SecretText};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{AuthenticationError, DeviceError, KeywardError, ValidationError};
use crate::session::{Confirmation, SessionManager};
use crate::state::{DeviceSession, SafeState, SafeStatus, UnlockedSafe};

/// Password safe operations.
#[derive(Debug, Clone)]
pub struct PasswordSafeController {
    session: Arc<SessionManager>,
}

impl PasswordSafeController {
    /// Controller over `session`.
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Unlock with the User PIN and load every programmed slot.
    ///
    /// # Errors
    ///
    /// - [`AuthenticationError::NotInitialized`] when the AES keys were
    ///   never generated
    /// - [`AuthenticationError::WrongPin`] /
    ///   [`AuthenticationError::PermanentLockout`] (User counter)
    /// - dispatch errors while loading; nothing is retained on failure
    pub fn unlock(&self, user_pin: &str) -> Result<(), KeywardError> {
        self.session.with_device(|d| {
            if !d.report.aes_initialized {
                return Err(AuthenticationError::NotInitialized);
            }
            d.auth.ensure_usable(PinRole::User)
        })??;

        let response = self.session.dispatch(Command::UnlockSafe {
            pin: SecretText::new(user_pin),
        })?;
        if response.status == CommandStatus::AesNotInitialized {
            self.session
                .with_device(|d| d.report.aes_initialized = false)?;
            return Err(AuthenticationError::NotInitialized.into());
        }
        self.session
            .settle_credential(PinRole::User, response.status)?;

        let slots = self.load_table()?;
        let loaded = slots.iter().filter(|s| s.is_some()).count();
        self.session.with_device(|d| {
            d.protected.safe = SafeState::Unlocked(UnlockedSafe {
                slots,
                unlocked_at: Instant::now(),
            });
        })?;
        info!(loaded, "password safe unlocked");
        Ok(())
    }

    fn load_table(&self) -> Result<Vec<Option<SafeSlotData>>, KeywardError> {
        let programmed = match self.session.request(Command::GetSafeSlotStatus)? {
            Payload::SafeSlots(flags) if flags.len() == usize::from(SAFE_SLOT_COUNT) => flags,
            _ => return Err(self.session.protocol_violation("GetSafeSlotStatus")),
        };
        let mut slots = Vec::with_capacity(programmed.len());
        for (index, programmed) in (0..SAFE_SLOT_COUNT).zip(programmed) {
            if !programmed {
                slots.push(None);
                continue;
            }
            match self.session.request(Command::ReadSafeSlot(index))? {
                Payload::SafeSlot(data) => slots.push(Some(data)),
                _ => return Err(self.session.protocol_violation("ReadSafeSlot")),
            }
        }
        Ok(slots)
    }

    /// Drop the decrypted table. Idempotent.
    ///
    /// # Errors
    ///
    /// Never fails while connected; a disconnected session holds nothing
    /// to scrub and also returns `Ok`.
    pub fn lock(&self) -> Result<(), KeywardError> {
        match self.session.with_device(|d| {
            if matches!(d.protected.safe, SafeState::Unlocked(_)) {
                d.protected.safe = SafeState::Locked;
            }
        }) {
            Ok(()) | Err(KeywardError::Device(DeviceError::Disconnected)) => {}
            Err(KeywardError::State(_)) => {}
            Err(err) => return Err(err),
        }
        debug!("password safe locked");
        Ok(())
    }

    /// Safe state, applying the auto-lock timeout first.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Disconnected`].
    pub fn status(&self) -> Result<SafeStatus, KeywardError> {
        let timeout = self.auto_lock();
        self.session.with_device(|d| {
            expire(d, timeout);
            d.protected.safe.status()
        })
    }

    /// Decrypted contents of slot `index`.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::OutOfRange`] for a bad index
    /// - [`AuthenticationError::NotInitialized`] after key regeneration
    /// - [`crate::StateError::PreconditionNotMet`] while locked or for an
    ///   empty slot
    pub fn read_slot(&self, index: u8) -> Result<SafeSlotData, KeywardError> {
        check_index(index)?;
        let timeout = self.auto_lock();
        self.session.with_device(|d| {
            let safe = unlocked(d, timeout)?;
            safe.slots
                .get(usize::from(index))
                .and_then(Option::as_ref)
                .cloned()
                .ok_or_else(|| KeywardError::precondition(format!("safe slot {index} is empty")))
        })?
    }

    /// Names of all slots; `None` for empty ones.
    ///
    /// # Errors
    ///
    /// As [`Self::read_slot`].
    pub fn list_slots(&self) -> Result<Vec<Option<String>>, KeywardError> {
        let timeout = self.auto_lock();
        self.session.with_device(|d| {
            let safe = unlocked(d, timeout)?;
            Ok(safe
                .slots
                .iter()
                .map(|s| s.as_ref().map(|data| data.name.clone()))
                .collect())
        })?
    }

    /// Store an entry in slot `index`.
    ///
    /// # Errors
    ///
    /// [`ValidationError::BadLength`] when a field exceeds the slot
    /// capacity, the lock errors of [`Self::read_slot`], or
    /// [`KeywardError::WriteFailed`] when the token refuses.
    pub fn write_slot(
        &self,
        index: u8,
        name: &str,
        login: &str,
        password: &str,
    ) -> Result<(), KeywardError> {
        check_index(index)?;
        check_field("name", name, SAFE_NAME_LEN)?;
        if name.is_empty() {
            return Err(ValidationError::BadLength("safe entry name must not be empty".into()).into());
        }
        check_field("login", login, SAFE_LOGIN_LEN)?;
        check_field("password", password, SAFE_PASSWORD_LEN)?;
        self.ensure_unlocked()?;

        let entry = SafeSlotData {
            name: name.to_owned(),
            login: SecretText::new(login),
            password: SecretText::new(password),
        };
        let response = self.session.dispatch(Command::WriteSafeSlot {
            slot: index,
            name: entry.name.clone(),
            login: entry.login.clone(),
            password: entry.password.clone(),
        })?;
        if !response.status.is_ok() {
            warn!(index, code = response.status.code(), "safe slot write refused");
            return Err(KeywardError::WriteFailed(format!(
                "safe slot {index}: token returned status {}",
                response.status.code()
            )));
        }
        self.store(index, Some(entry))?;
        info!(index, "safe slot written");
        Ok(())
    }

    /// Erase slot `index`.
    ///
    /// # Errors
    ///
    /// Confirmation, lock errors, or [`KeywardError::WriteFailed`].
    pub fn erase_slot(&self, index: u8, confirmation: Confirmation) -> Result<(), KeywardError> {
        confirmation.require()?;
        check_index(index)?;
        self.ensure_unlocked()?;
        let response = self.session.dispatch(Command::EraseSafeSlot(index))?;
        match response.status {
            CommandStatus::Ok | CommandStatus::SlotNotProgrammed => {}
            other => {
                return Err(KeywardError::WriteFailed(format!(
                    "safe slot {index}: token returned status {}",
                    other.code()
                )))
            }
        }
        self.store(index, None)?;
        info!(index, "safe slot erased");
        Ok(())
    }

    /// Random alphanumeric password filling the whole password field.
    #[must_use]
    pub fn random_password() -> SecretText {
        let password: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(SAFE_PASSWORD_LEN)
            .map(char::from)
            .collect();
        SecretText::from(password)
    }

    fn auto_lock(&self) -> Option<Duration> {
        self.session.options().safe_auto_lock()
    }

    fn ensure_unlocked(&self) -> Result<(), KeywardError> {
        let timeout = self.auto_lock();
        self.session
            .with_device(|d| unlocked(d, timeout).map(|_| ()))?
    }

    fn store(&self, index: u8, entry: Option<SafeSlotData>) -> Result<(), KeywardError> {
        self.session.with_device(|d| {
            if let SafeState::Unlocked(safe) = &mut d.protected.safe {
                if let Some(slot) = safe.slots.get_mut(usize::from(index)) {
                    *slot = entry;
                }
            }
        })
    }
}

fn expire(d: &mut DeviceSession, timeout: Option<Duration>) {
    if d.protected.safe.expire(timeout) {
        info!("password safe auto-locked");
    }
}

fn unlocked(d: &mut DeviceSession, timeout: Option<Duration>) -> Result<&UnlockedSafe, KeywardError> {
    expire(d, timeout);
    match &d.protected.safe {
        SafeState::Unlocked(safe) => Ok(safe),
        SafeState::Locked => Err(KeywardError::precondition("password safe is locked")),
        SafeState::Invalidated => Err(AuthenticationError::NotInitialized.into()),
    }
}

fn check_index(index: u8) -> Result<(), ValidationError> {
    if index < SAFE_SLOT_COUNT {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange(format!(
            "safe slot {index} (expected 0-{})",
            SAFE_SLOT_COUNT.saturating_sub(1)
        )))
    }
}

fn check_field(label: &str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::BadLength(format!(
            "safe entry {label} must be at most {max} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_capacity_is_in_bytes() {
        assert!(check_field("name", "abcdefghijk", SAFE_NAME_LEN).is_ok());
        assert!(check_field("name", "abcdefghijkl", SAFE_NAME_LEN).is_err());
        // 'é' is two bytes
        assert!(check_field("password", &"é".repeat(11), SAFE_PASSWORD_LEN).is_err());
    }

    #[test]
    fn random_password_fits_the_field() {
        let password = PasswordSafeController::random_password();
        assert_eq!(password.byte_len(), SAFE_PASSWORD_LEN);
        assert!(password.expose().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(check_field("password", password.expose(), SAFE_PASSWORD_LEN).is_ok());
    }

    #[test]
    fn index_bounds() {
        assert!(check_index(15).is_ok());
        assert!(matches!(
            check_index(16),
            Err(ValidationError::OutOfRange(_))
        ));
    }
}
