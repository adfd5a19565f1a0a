//! Firmware update mode, firmware lock and firmware image export.

use std::io::Write;
use std::sync::Arc;

use keyward_proto::device::{FIRMWARE_CHUNK_LEN, FIRMWARE_IMAGE_MAX};
use keyward_proto::{Command, Payload, PinRole, SecretText};
use tracing::{debug, info, warn};

use crate::auth::PinAuthenticator;
use crate::error::{KeywardError, TerminalMode};
use crate::progress::{percent_of, CancelFlag, ProgressSink};
use crate::session::{Confirmation, SessionManager};

/// Firmware operations of a storage token.
#[derive(Debug, Clone)]
pub struct FirmwareModeController {
    session: Arc<SessionManager>,
}

impl FirmwareModeController {
    /// Controller over `session`.
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    fn require_storage(&self) -> Result<(), KeywardError> {
        if self.session.with_device(|d| d.model().has_storage())? {
            Ok(())
        } else {
            Err(KeywardError::precondition("token has no updatable firmware"))
        }
    }

    /// Switch the token into update mode with the firmware password.
    ///
    /// On success the session is terminal: the token re-enumerates as a
    /// bootloader and must be reconnected after the update.
    ///
    /// # Errors
    ///
    /// - [`crate::StateError::ConfirmationRequired`]
    /// - [`crate::ValidationError::BadLength`] for the password policy
    /// - [`crate::StateError::PreconditionNotMet`] when the firmware is locked
    /// - the Firmware role's authentication errors
    pub fn enter_update_mode(
        &self,
        password: &str,
        confirmation: Confirmation,
    ) -> Result<(), KeywardError> {
        confirmation.require()?;
        PinAuthenticator::validate_policy(PinRole::Firmware, password)?;
        self.require_storage()?;
        self.session.with_device(|d| {
            if d.report.firmware_locked {
                return Err(KeywardError::precondition("firmware is locked"));
            }
            Ok(d.auth.ensure_usable(PinRole::Firmware)?)
        })??;

        let response = self.session.dispatch(Command::EnterUpdateMode {
            password: SecretText::new(password),
        })?;
        self.session
            .settle_credential(PinRole::Firmware, response.status)?;
        warn!("token entered firmware update mode");
        self.session.enter_terminal(TerminalMode::UpdateMode);
        Ok(())
    }

    /// Permanently disable firmware updates. There is no way back.
    ///
    /// # Errors
    ///
    /// Confirmation, Admin, or dispatch errors.
    pub fn lock_firmware_hardware(&self, confirmation: Confirmation) -> Result<(), KeywardError> {
        confirmation.require()?;
        self.require_storage()?;
        let already = self.session.with_device(|d| {
            d.auth
                .require(PinRole::Admin)
                .map(|()| d.report.firmware_locked)
        })??;
        if already {
            debug!("firmware already locked");
            return Ok(());
        }
        self.session.request(Command::LockFirmware)?;
        self.session
            .with_device(|d| d.report.firmware_locked = true)?;
        warn!("firmware permanently locked");
        Ok(())
    }

    /// Read the firmware image into `destination`. Returns the byte count.
    ///
    /// The cancel flag is checked between chunks; a partially written
    /// destination is left for the caller to discard.
    ///
    /// # Errors
    ///
    /// Admin and dispatch errors, [`KeywardError::Io`] from the
    /// destination, or [`KeywardError::Cancelled`].
    pub fn export_firmware(
        &self,
        destination: &mut dyn Write,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<u64, KeywardError> {
        self.require_storage()?;
        self.session
            .with_device(|d| d.auth.require(PinRole::Admin))??;

        let mut offset: u32 = 0;
        progress.report(0);
        while offset < FIRMWARE_IMAGE_MAX {
            if cancel.is_cancelled() {
                info!(offset, "firmware export cancelled");
                return Err(KeywardError::Cancelled);
            }
            let chunk = match self.session.request(Command::ReadFirmware {
                offset,
                len: FIRMWARE_CHUNK_LEN,
            })? {
                Payload::FirmwareChunk(bytes) if bytes.len() <= usize::from(FIRMWARE_CHUNK_LEN) => {
                    bytes
                }
                _ => return Err(self.session.protocol_violation("ReadFirmware")),
            };
            destination.write_all(&chunk)?;
            let read = u32::try_from(chunk.len()).unwrap_or(0);
            offset = offset.saturating_add(read);
            progress.report(percent_of(u64::from(offset), u64::from(FIRMWARE_IMAGE_MAX)));
            if chunk.len() < usize::from(FIRMWARE_CHUNK_LEN) {
                break;
            }
        }
        destination.flush()?;
        progress.report(100);
        info!(bytes = offset, "firmware exported");
        Ok(u64::from(offset))
    }
}
