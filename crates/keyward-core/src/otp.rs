//! OTP slot programming and code generation.

use std::sync::Arc;

use keyward_proto::device::OTP_NAME_LEN;
use keyward_proto::{
    check_secret, decode_secret, encode_secret, Command, CommandStatus, OtpDigits, OtpKind, OtpSlotId,
    OtpSlotInfo, OtpSlotWrite, Payload, PinRole, SecretEncoding, SecretText, TokenId,
};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::{KeywardError, StateError, ValidationError};
use crate::session::{Confirmation, SessionManager};
use crate::state::otp_slot_exists;

/// Initial HOTP moving factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterInit {
    /// Start at 0.
    Zero,
    /// Random value within the model's counter range.
    Random,
    /// Explicit value.
    Value(u64),
}

/// Caller input for [`OtpSlotManager::write_slot`].
#[derive(Debug, Clone)]
pub struct OtpSlotConfig {
    /// Slot label, 1 to 15 bytes.
    pub name: String,
    /// Encoded shared secret.
    pub secret: String,
    /// Encoding of `secret`.
    pub encoding: SecretEncoding,
    /// HOTP initial counter; ignored for TOTP.
    pub counter: CounterInit,
    /// TOTP time step in seconds; ignored for HOTP.
    pub interval_secs: u16,
    /// Code length.
    pub digits: OtpDigits,
    /// Optional OATH token identification.
    pub token_id: Option<TokenId>,
}

/// Result of [`OtpSlotManager::erase_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EraseOutcome {
    /// The slot was programmed and is now erased.
    Erased,
    /// The slot was already empty; nothing was sent.
    AlreadyErased,
}

/// OTP operations.
#[derive(Debug, Clone)]
pub struct OtpSlotManager {
    session: Arc<SessionManager>,
}

impl OtpSlotManager {
    /// Manager over `session`.
    #[must_use]
    pub const fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Program slot `id`. Requires Admin authentication.
    ///
    /// # Errors
    ///
    /// - [`ValidationError`] for name, secret, counter, interval or token id
    /// - [`crate::AuthenticationError::NotAuthenticated`] without Admin
    /// - [`KeywardError::WriteFailed`] when the token refuses
    pub fn write_slot(&self, id: OtpSlotId, config: &OtpSlotConfig) -> Result<(), KeywardError> {
        check_slot(id)?;
        let name = config.name.trim();
        if name.is_empty() || name.len() > OTP_NAME_LEN {
            return Err(ValidationError::BadLength(format!(
                "slot name must be 1-{OTP_NAME_LEN} bytes"
            ))
            .into());
        }
        let (limits, model) = self.session.with_device(|d| (d.limits, d.model()))?;
        let secret = decode_secret(&config.secret, config.encoding)?;
        check_secret(secret.expose(), &limits)?;

        let (counter, interval_secs) = match id.kind {
            OtpKind::Hotp => {
                let counter = match config.counter {
                    CounterInit::Zero => 0,
                    CounterInit::Random => rand::thread_rng().gen_range(0..=limits.hotp_counter_max),
                    CounterInit::Value(v) if v <= limits.hotp_counter_max => v,
                    CounterInit::Value(v) => {
                        return Err(ValidationError::OutOfRange(format!(
                            "HOTP counter {v} exceeds {} for the {} model",
                            limits.hotp_counter_max,
                            model.as_str()
                        ))
                        .into())
                    }
                };
                (counter, 0)
            }
            OtpKind::Totp => {
                if config.interval_secs == 0 {
                    return Err(
                        ValidationError::OutOfRange("TOTP interval must be positive".into()).into(),
                    );
                }
                (0, config.interval_secs)
            }
        };
        if let Some(token_id) = &config.token_id {
            check_token_id(token_id)?;
        }

        self.session
            .with_device(|d| d.auth.require(PinRole::Admin))??;
        let response = self.session.dispatch(Command::WriteOtpSlot(Box::new(OtpSlotWrite {
            slot: id,
            name: name.to_owned(),
            secret,
            counter,
            interval_secs,
            digits: config.digits,
            token_id: config.token_id.clone(),
        })))?;
        if !response.status.is_ok() {
            warn!(%id, code = response.status.code(), "slot write refused");
            return Err(KeywardError::WriteFailed(format!(
                "{id}: token returned status {}",
                response.status.code()
            )));
        }

        self.session.with_device(|d| {
            if let Some(slot) = d.otp_slot_mut(id) {
                *slot = OtpSlotInfo {
                    slot: id,
                    programmed: true,
                    name: name.to_owned(),
                    digits: config.digits,
                    interval_secs,
                };
            }
        })?;
        info!(%id, "slot written");
        Ok(())
    }

    /// Random secret of the largest size the connected token accepts,
    /// encoded for [`OtpSlotConfig::secret`].
    ///
    /// # Errors
    ///
    /// [`crate::DeviceError::Disconnected`] or [`StateError::Terminal`].
    pub fn random_secret(&self, encoding: SecretEncoding) -> Result<SecretText, KeywardError> {
        let limits = self.session.with_device(|d| d.limits)?;
        let mut rng = OsRng;
        let mut bytes = Zeroizing::new(vec![0u8; limits.otp_secret_max]);
        rng.fill(bytes.as_mut_slice());
        if limits.rejects_leading_zero_secret {
            if let Some(first) = bytes.first_mut().filter(|b| **b == 0) {
                *first = rng.gen_range(1..=u8::MAX);
            }
        }
        Ok(SecretText::from(encode_secret(&bytes, encoding)))
    }

    /// Erase slot `id`. Requires Admin authentication.
    ///
    /// # Errors
    ///
    /// Confirmation, Admin, or [`KeywardError::WriteFailed`].
    pub fn erase_slot(
        &self,
        id: OtpSlotId,
        confirmation: Confirmation,
    ) -> Result<EraseOutcome, KeywardError> {
        confirmation.require()?;
        check_slot(id)?;
        let programmed = self.session.with_device(|d| {
            d.auth
                .require(PinRole::Admin)
                .map(|()| d.otp_slot(id).is_some_and(|s| s.programmed))
        })??;
        if !programmed {
            return Ok(EraseOutcome::AlreadyErased);
        }

        let response = self.session.dispatch(Command::EraseOtpSlot(id))?;
        match response.status {
            CommandStatus::Ok | CommandStatus::SlotNotProgrammed => {}
            other => {
                return Err(KeywardError::WriteFailed(format!(
                    "{id}: token returned status {}",
                    other.code()
                )))
            }
        }
        self.session.with_device(|d| {
            if let Some(slot) = d.otp_slot_mut(id) {
                slot.programmed = false;
                slot.name.clear();
            }
        })?;
        info!(%id, "slot erased");
        Ok(EraseOutcome::Erased)
    }

    /// Compute the current code of slot `id`, zero-padded to its digits.
    ///
    /// # Errors
    ///
    /// - [`StateError::TimeOutOfSync`] for TOTP while the clocks disagree
    /// - [`crate::AuthenticationError::NotAuthenticated`] when codes are
    ///   PIN-protected and the User role has not authenticated
    /// - [`StateError::PreconditionNotMet`] for an empty slot
    pub fn generate_otp(&self, id: OtpSlotId) -> Result<String, KeywardError> {
        check_slot(id)?;
        let digits = self.session.with_device(|d| -> Result<OtpDigits, KeywardError> {
            let slot = d
                .otp_slot(id)
                .filter(|s| s.programmed)
                .ok_or_else(|| KeywardError::precondition(format!("{id} is not programmed")))?;
            if id.kind == OtpKind::Totp && d.time.out_of_sync {
                return Err(StateError::TimeOutOfSync.into());
            }
            if d.report.otp_user_pin_protected {
                d.auth.require(PinRole::User)?;
            }
            Ok(slot.digits)
        })??;

        let unix_time = match id.kind {
            OtpKind::Hotp => None,
            OtpKind::Totp => Some(self.session.now_unix()),
        };
        let code = match self
            .session
            .request(Command::GetOtpCode { slot: id, unix_time })?
        {
            Payload::OtpCode(code) => code,
            _ => return Err(self.session.protocol_violation("GetOtpCode")),
        };
        Ok(format_code(code, digits))
    }

    /// Metadata of every slot, HOTP bank first.
    ///
    /// # Errors
    ///
    /// [`crate::DeviceError::Disconnected`].
    pub fn list_slots(&self) -> Result<Vec<OtpSlotInfo>, KeywardError> {
        self.session.with_device(|d| d.otp.clone())
    }
}

fn check_slot(id: OtpSlotId) -> Result<(), ValidationError> {
    if otp_slot_exists(id) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange(format!("no such slot {id}")))
    }
}

fn check_token_id(token_id: &TokenId) -> Result<(), ValidationError> {
    let fields = [
        ("manufacturer", &token_id.manufacturer, 2),
        ("token type", &token_id.token_type, 2),
        ("unique id", &token_id.unique_id, 8),
    ];
    for (label, value, max) in fields {
        if value.len() > max {
            return Err(ValidationError::BadLength(format!(
                "token {label} must be at most {max} characters"
            )));
        }
    }
    Ok(())
}

/// Reduce `code` to `digits` digits and left-pad it with zeros.
fn format_code(code: u32, digits: OtpDigits) -> String {
    let modulus = 10u32.checked_pow(u32::from(digits.value())).unwrap_or(u32::MAX);
    let code = code.checked_rem(modulus).unwrap_or(code);
    let width = usize::from(digits.value());
    format!("{code:0>width$}")
}
