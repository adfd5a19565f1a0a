//! OTP secret input codec.
//!
//! Secrets arrive from users either as hex (as printed by most
//! provisioning tools) or as RFC 4648 base32 (as embedded in
//! `otpauth://` URIs). Both are decoded with `data-encoding` into a
//! [`SecretBuffer`]; intermediate copies are zeroized.

use data_encoding::{BASE32, BASE32_NOPAD, HEXLOWER, HEXLOWER_PERMISSIVE};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::device::DeviceLimits;
use crate::error::ProtoError;
use crate::memory::SecretBuffer;

/// Textual encoding of a user-supplied OTP secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretEncoding {
    /// Case-insensitive hexadecimal.
    Hex,
    /// RFC 4648 base32, padding optional, case-insensitive.
    Base32,
}

/// Decode a textual secret into bytes.
///
/// Whitespace is ignored in both encodings (users paste grouped strings
/// such as `JBSW Y3DP EHPK 3PXP`).
///
/// # Errors
///
/// Returns [`ProtoError::BadFormat`] if the input is empty or not valid
/// in the declared encoding.
pub fn decode_secret(input: &str, encoding: SecretEncoding) -> Result<SecretBuffer, ProtoError> {
    let mut compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ProtoError::BadFormat("secret must not be empty".into()));
    }

    let decoded = match encoding {
        SecretEncoding::Hex => HEXLOWER_PERMISSIVE
            .decode(compact.as_bytes())
            .map_err(|e| ProtoError::BadFormat(format!("invalid hex secret: {e}"))),
        SecretEncoding::Base32 => {
            compact.make_ascii_uppercase();
            let unpadded = compact.trim_end_matches('=');
            BASE32_NOPAD
                .decode(unpadded.as_bytes())
                .map_err(|e| ProtoError::BadFormat(format!("invalid base32 secret: {e}")))
        }
    };
    compact.zeroize();

    let mut bytes = decoded?;
    let buffer = SecretBuffer::new(&bytes);
    bytes.zeroize();
    Ok(buffer)
}

/// Encode secret bytes for display or export.
///
/// Hex is lowercase; base32 is uppercase with padding.
#[must_use]
pub fn encode_secret(secret: &[u8], encoding: SecretEncoding) -> String {
    match encoding {
        SecretEncoding::Hex => HEXLOWER.encode(secret),
        SecretEncoding::Base32 => BASE32.encode(secret),
    }
}

/// Check decoded secret bytes against what the connected device accepts.
///
/// # Errors
///
/// - [`ProtoError::BadLength`] if the secret is empty or exceeds device capacity
/// - [`ProtoError::Unsupported`] if the device is of the older class and
///   the secret starts with a zero byte
pub fn check_secret(secret: &[u8], limits: &DeviceLimits) -> Result<(), ProtoError> {
    if secret.is_empty() {
        return Err(ProtoError::BadLength("secret must not be empty".into()));
    }
    if secret.len() > limits.otp_secret_max {
        return Err(ProtoError::BadLength(format!(
            "secret is {} bytes, device supports at most {}",
            secret.len(),
            limits.otp_secret_max
        )));
    }
    if limits.rejects_leading_zero_secret && secret.first() == Some(&0) {
        return Err(ProtoError::Unsupported(
            "this firmware does not support secrets starting with a null byte".into(),
        ));
    }
    Ok(())
}
