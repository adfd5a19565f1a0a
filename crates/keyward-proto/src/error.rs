//! Error types for `keyward-proto`.

use thiserror::Error;

/// Errors produced while validating or decoding caller input locally.
///
/// Every variant is raised before anything is sent to the token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Input is not valid in its declared encoding (hex, base32).
    #[error("malformed input: {0}")]
    BadFormat(String),

    /// Input is shorter or longer than the field allows.
    #[error("bad length: {0}")]
    BadLength(String),

    /// Numeric value or index outside its permitted range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Value is well-formed but the connected hardware cannot accept it.
    #[error("unsupported by this device: {0}")]
    Unsupported(String),
}
