//! PIN and password policy: roles, length bounds and factory defaults.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Consecutive failures allowed before a role is permanently locked out.
pub const MAX_RETRIES: u8 = 3;

/// Factory-default User PIN.
pub const DEFAULT_USER_PIN: &str = "123456";

/// Factory-default Admin PIN.
pub const DEFAULT_ADMIN_PIN: &str = "12345678";

/// Factory-default firmware update password.
pub const DEFAULT_FIRMWARE_PASSWORD: &str = "12345678";

/// Credential role on the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PinRole {
    /// Unlocks volumes, the password safe and protected OTP codes.
    User,
    /// Configures slots and performs destructive administration.
    Admin,
    /// Gates entry into firmware update mode.
    Firmware,
}

impl PinRole {
    /// Every role, in a stable order.
    pub const ALL: [Self; 3] = [Self::User, Self::Admin, Self::Firmware];

    /// Length policy for this role.
    #[must_use]
    pub const fn policy(self) -> PinPolicy {
        match self {
            Self::User => PinPolicy { min: 6, max: 30 },
            Self::Admin => PinPolicy { min: 8, max: 30 },
            Self::Firmware => PinPolicy { min: 8, max: 20 },
        }
    }

    /// The well-known factory value for this role.
    #[must_use]
    pub const fn factory_default(self) -> &'static str {
        match self {
            Self::User => DEFAULT_USER_PIN,
            Self::Admin => DEFAULT_ADMIN_PIN,
            Self::Firmware => DEFAULT_FIRMWARE_PASSWORD,
        }
    }

    /// Stable index used for per-role tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::User => 0,
            Self::Admin => 1,
            Self::Firmware => 2,
        }
    }
}

impl fmt::Display for PinRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Firmware => "firmware",
        })
    }
}

/// Inclusive length bounds, counted in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinPolicy {
    /// Shortest accepted candidate.
    pub min: usize,
    /// Longest accepted candidate.
    pub max: usize,
}

/// Non-blocking outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyVerdict {
    /// Candidate is acceptable.
    Accepted,
    /// Candidate is acceptable but equals the factory default.
    FactoryDefault,
}

impl PolicyVerdict {
    /// Whether the caller should show a warning.
    #[must_use]
    pub const fn is_warning(self) -> bool {
        matches!(self, Self::FactoryDefault)
    }
}

/// Check a candidate credential against the role's length policy.
///
/// # Errors
///
/// Returns [`ProtoError::BadLength`] when the candidate is too short or too long.
pub fn check_candidate(role: PinRole, candidate: &str) -> Result<PolicyVerdict, ProtoError> {
    let policy = role.policy();
    let len = candidate.len();
    if len < policy.min {
        return Err(ProtoError::BadLength(format!(
            "{role} credential must be at least {} characters",
            policy.min
        )));
    }
    if len > policy.max {
        return Err(ProtoError::BadLength(format!(
            "{role} credential must be at most {} characters",
            policy.max
        )));
    }
    if candidate == role.factory_default() {
        return Ok(PolicyVerdict::FactoryDefault);
    }
    Ok(PolicyVerdict::Accepted)
}
