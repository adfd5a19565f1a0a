//! PIN authentication state and retry counters.
//!
//! [`PinAuthenticator`] is pure bookkeeping: it mirrors the token's
//! retry counters and records which roles have authenticated in the
//! current session. The credential-bearing operations live on
//! [`SessionManager`] so they can dispatch commands.
//!
//! # Invariants
//!
//! - A counter never leaves `0..=MAX_RETRIES`.
//! - A counter of 0 is terminal: no command for that role is sent again.
//! - Every successful authentication resets the counter to `MAX_RETRIES`.

use keyward_proto::{
    check_candidate, Command, CommandStatus, PinRole, PolicyVerdict, SecretText, MAX_RETRIES,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AuthenticationError, DeviceError, KeywardError, ValidationError};
use crate::session::{Confirmation, SessionManager};

/// Authentication state of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthState {
    /// Not authenticated in this session.
    Locked,
    /// Authenticated; protected operations for the role are allowed.
    Authenticated,
    /// Retry counter exhausted.
    PermanentlyLockedOut,
}

#[derive(Debug, Clone, Copy)]
struct RoleAuth {
    state: AuthState,
    retries: u8,
}

impl RoleAuth {
    const fn from_counter(retries: u8) -> Self {
        let retries = if retries > MAX_RETRIES {
            MAX_RETRIES
        } else {
            retries
        };
        let state = if retries == 0 {
            AuthState::PermanentlyLockedOut
        } else {
            AuthState::Locked
        };
        Self { state, retries }
    }
}

/// Per-role authentication bookkeeping for one device session.
#[derive(Debug, Clone)]
pub struct PinAuthenticator {
    roles: [RoleAuth; 3],
}

impl Default for PinAuthenticator {
    fn default() -> Self {
        Self::from_counters([MAX_RETRIES; 3])
    }
}

impl PinAuthenticator {
    /// Seed from device-reported counters, indexed by [`PinRole::index`].
    #[must_use]
    pub const fn from_counters(counters: [u8; 3]) -> Self {
        Self {
            roles: [
                RoleAuth::from_counter(counters[0]),
                RoleAuth::from_counter(counters[1]),
                RoleAuth::from_counter(counters[2]),
            ],
        }
    }

    /// Check a candidate against the role's length policy.
    ///
    /// A factory-default candidate is accepted with
    /// [`PolicyVerdict::FactoryDefault`] so the caller can warn.
    ///
    /// # Errors
    ///
    /// [`ValidationError::BadLength`] when the candidate is too short or too long.
    pub fn validate_policy(role: PinRole, candidate: &str) -> Result<PolicyVerdict, ValidationError> {
        check_candidate(role, candidate).map_err(ValidationError::from)
    }

    /// Current state of `role`.
    #[must_use]
    pub const fn state(&self, role: PinRole) -> AuthState {
        self.roles[role.index()].state
    }

    /// Remaining attempts for `role`.
    #[must_use]
    pub const fn retries(&self, role: PinRole) -> u8 {
        self.roles[role.index()].retries
    }

    /// Whether `role` authenticated in this session.
    #[must_use]
    pub fn is_authenticated(&self, role: PinRole) -> bool {
        self.state(role) == AuthState::Authenticated
    }

    /// Refuse up front when the role is locked out, so no command is sent.
    ///
    /// # Errors
    ///
    /// [`AuthenticationError::PermanentLockout`] when the counter is 0.
    pub fn ensure_usable(&self, role: PinRole) -> Result<(), AuthenticationError> {
        if self.state(role) == AuthState::PermanentlyLockedOut {
            return Err(AuthenticationError::PermanentLockout(role));
        }
        Ok(())
    }

    /// Gate for operations protected by `role`.
    ///
    /// # Errors
    ///
    /// [`AuthenticationError::PermanentLockout`] or
    /// [`AuthenticationError::NotAuthenticated`].
    pub fn require(&self, role: PinRole) -> Result<(), AuthenticationError> {
        match self.state(role) {
            AuthState::Authenticated => Ok(()),
            AuthState::Locked => Err(AuthenticationError::NotAuthenticated(role)),
            AuthState::PermanentlyLockedOut => Err(AuthenticationError::PermanentLockout(role)),
        }
    }

    /// The token accepted the credential.
    pub fn record_success(&mut self, role: PinRole) {
        self.roles[role.index()] = RoleAuth {
            state: AuthState::Authenticated,
            retries: MAX_RETRIES,
        };
    }

    /// The token rejected the credential. Returns the error to surface.
    pub fn record_failure(&mut self, role: PinRole) -> AuthenticationError {
        let entry = &mut self.roles[role.index()];
        entry.retries = entry.retries.saturating_sub(1);
        if entry.retries == 0 {
            entry.state = AuthState::PermanentlyLockedOut;
            AuthenticationError::PermanentLockout(role)
        } else {
            entry.state = AuthState::Locked;
            AuthenticationError::WrongPin {
                role,
                tries_left: entry.retries,
            }
        }
    }

    /// Adopt a device-reported counter. An authentication survives unless
    /// the token reports the role as locked out.
    pub fn sync_counter(&mut self, role: PinRole, retries: u8) {
        let fresh = RoleAuth::from_counter(retries);
        let entry = &mut self.roles[role.index()];
        entry.retries = fresh.retries;
        if fresh.state == AuthState::PermanentlyLockedOut
            || entry.state == AuthState::PermanentlyLockedOut
        {
            entry.state = fresh.state;
        }
    }

    /// Forget every authentication; counters are kept.
    pub fn deauthenticate_all(&mut self) {
        for entry in &mut self.roles {
            if entry.state == AuthState::Authenticated {
                entry.state = AuthState::Locked;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Credential operations
// ---------------------------------------------------------------------------

impl SessionManager {
    /// Present `candidate` for `role`.
    ///
    /// # Errors
    ///
    /// - [`AuthenticationError::PermanentLockout`] before sending anything
    ///   when the counter is already 0, or after the third failure
    /// - [`AuthenticationError::WrongPin`] with the remaining tries
    /// - [`KeywardError::Device`] for transport and token failures
    pub fn authenticate(&self, role: PinRole, candidate: &str) -> Result<(), KeywardError> {
        self.with_device(|d| d.auth.ensure_usable(role))??;
        let response = self.dispatch(Command::Authenticate {
            role,
            pin: SecretText::new(candidate),
        })?;
        self.settle_credential(role, response.status)?;
        info!(%role, "authenticated");
        Ok(())
    }

    /// Replace the credential of `role`.
    ///
    /// `new` and `confirm` must match and satisfy the role's policy; both
    /// checks run before anything is sent. The old credential is then
    /// verified with [`Self::authenticate`], which moves the counter on
    /// failure.
    ///
    /// # Errors
    ///
    /// [`ValidationError::Mismatch`], [`ValidationError::BadLength`], any
    /// error of [`Self::authenticate`], or [`KeywardError::Device`] when the
    /// token refuses the change.
    pub fn change_credential(
        &self,
        role: PinRole,
        old: &str,
        new: &str,
        confirm: &str,
    ) -> Result<PolicyVerdict, KeywardError> {
        let (new, confirm) = (SecretText::new(new), SecretText::new(confirm));
        if !new.matches(&confirm) {
            return Err(ValidationError::Mismatch.into());
        }
        let verdict = PinAuthenticator::validate_policy(role, new.expose())?;
        if verdict.is_warning() {
            warn!(%role, "new credential equals the factory default");
        }

        self.authenticate(role, old)?;
        let response = self.dispatch(Command::ChangePin {
            role,
            old: SecretText::new(old),
            new,
        })?;
        self.settle_credential(role, response.status)?;
        info!(%role, "credential changed");
        Ok(verdict)
    }

    /// Wipe the token back to factory state.
    ///
    /// Requires explicit confirmation and the Admin PIN, which is checked
    /// against the Admin counter. On success the session becomes terminal
    /// and must be reconnected.
    ///
    /// # Errors
    ///
    /// [`crate::StateError::ConfirmationRequired`], the authentication
    /// errors of the Admin role, or [`KeywardError::Device`].
    pub fn factory_reset(
        &self,
        admin_pin: &str,
        confirmation: Confirmation,
    ) -> Result<(), KeywardError> {
        confirmation.require()?;
        self.with_device(|d| d.auth.ensure_usable(PinRole::Admin))??;
        let response = self.dispatch(Command::FactoryReset {
            admin_pin: SecretText::new(admin_pin),
        })?;
        self.settle_credential(PinRole::Admin, response.status)?;
        warn!("token reset to factory state");
        self.enter_terminal(crate::error::TerminalMode::FactoryReset);
        Ok(())
    }

    /// Apply the token's verdict on a credential to the retry counter.
    pub(crate) fn settle_credential(
        &self,
        role: PinRole,
        status: CommandStatus,
    ) -> Result<(), KeywardError> {
        match status {
            CommandStatus::Ok => {
                self.with_device(|d| d.auth.record_success(role))?;
                Ok(())
            }
            CommandStatus::WrongPassword => {
                let err = self.with_device(|d| d.auth.record_failure(role))?;
                warn!(%role, %err, "credential rejected");
                Err(err.into())
            }
            other => Err(DeviceError::StatusCode(other.code()).into()),
        }
    }
}
