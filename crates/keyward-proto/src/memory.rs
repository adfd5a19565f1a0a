//! Secret-carrying wrappers for PINs, passwords and OTP key material.
//!
//! Both are zeroed on drop through `secrecy` and print as `***` in
//! `Debug` and `Display`. Contents are only reachable as a borrow via
//! `expose()`.

use std::fmt;

use secrecy::{ExposeSecret, SecretSlice, SecretString};

// ---------------------------------------------------------------------------
// SecretBuffer: raw bytes
// ---------------------------------------------------------------------------

/// Variable-length buffer for sensitive bytes (OTP secrets).
///
/// Wraps [`SecretSlice<u8>`] from the `secrecy` crate. The source data
/// is copied, so callers holding their own copy should zeroize it.
pub struct SecretBuffer {
    inner: SecretSlice<u8>,
}

impl SecretBuffer {
    /// Copy `data` into a scrubbed buffer.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            inner: data.to_vec().into(),
        }
    }

    /// Expose the underlying bytes. Keep the borrow short-lived.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expose().len()
    }

    /// No key material.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for SecretBuffer {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl From<Vec<u8>> for SecretBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { inner: data.into() }
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

impl fmt::Display for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

// ---------------------------------------------------------------------------
// SecretText: UTF-8 text
// ---------------------------------------------------------------------------

/// UTF-8 secret: PINs, volume passwords, password-safe logins and passwords.
pub struct SecretText {
    inner: SecretString,
}

impl SecretText {
    /// Copy `text` into a new zeroize-on-drop allocation.
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            inner: SecretString::from(text.to_owned()),
        }
    }

    /// Expose the underlying text. Keep the borrow short-lived.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }

    /// Length in bytes (the unit device field capacities are expressed in).
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.expose().len()
    }

    /// Constant-time equality against another secret.
    ///
    /// The early return on length mismatch is acceptable: lengths are
    /// bounded by public policy, the content is what must not leak.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let a = self.expose().as_bytes();
        let b = other.expose().as_bytes();
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

impl Clone for SecretText {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl From<&str> for SecretText {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for SecretText {
    fn from(text: String) -> Self {
        Self {
            inner: SecretString::from(text),
        }
    }
}

impl fmt::Debug for SecretText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretText(***)")
    }
}

impl fmt::Display for SecretText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretText(***)")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
