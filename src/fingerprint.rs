//! Fingerprint tokens
//!
//! A fingerprint is the message payload: a lowercase hex SHA-1 digest of
//! some producer-side token. The consumer treats it as opaque; it only
//! requires the payload to be non-empty UTF-8.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::Arc;

/// Length of a hex-encoded SHA-1 digest
pub const SHA1_HEX_LEN: usize = 40;

/// Error decoding a payload into a fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    /// Zero-length payload
    Empty,
    /// Payload bytes are not UTF-8
    InvalidUtf8 { valid_up_to: usize },
}

impl fmt::Display for FingerprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FingerprintError::Empty => write!(f, "empty fingerprint payload"),
            FingerprintError::InvalidUtf8 { valid_up_to } => {
                write!(f, "fingerprint payload is not UTF-8 (valid up to byte {})", valid_up_to)
            }
        }
    }
}

impl std::error::Error for FingerprintError {}

/// Immutable content-hash token. Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// Lowercase hex SHA-1 of `input`
    pub fn sha1_of(input: &[u8]) -> Self {
        let digest = Sha1::digest(input);
        let mut hex = String::with_capacity(SHA1_HEX_LEN);
        for byte in digest.iter() {
            hex.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
            hex.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
        }
        Fingerprint(Arc::from(hex))
    }

    /// Decode a raw message body
    pub fn from_payload(payload: &[u8]) -> Result<Self, FingerprintError> {
        if payload.is_empty() {
            return Err(FingerprintError::Empty);
        }
        let text = std::str::from_utf8(payload).map_err(|e| FingerprintError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })?;
        Ok(Fingerprint(Arc::from(text)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Message body for publishing
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Fingerprint(Arc::from(s))
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(Arc::from(s))
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        let fp = Fingerprint::sha1_of(b"abc");
        assert_eq!(fp.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(fp.as_str().len(), SHA1_HEX_LEN);
    }

    #[test]
    fn test_from_payload_roundtrips_body() {
        let fp = Fingerprint::from_payload(b"deadbeef").unwrap();
        assert_eq!(fp.as_bytes(), b"deadbeef");
    }

    #[test]
    fn test_from_payload_rejects_empty() {
        assert_eq!(Fingerprint::from_payload(b""), Err(FingerprintError::Empty));
    }

    #[test]
    fn test_from_payload_rejects_invalid_utf8() {
        let err = Fingerprint::from_payload(&[b'a', 0xff, b'b']).unwrap_err();
        assert_eq!(err, FingerprintError::InvalidUtf8 { valid_up_to: 1 });
    }

    #[test]
    fn test_serde_is_plain_string() {
        let fp = Fingerprint::from("abc123");
        assert_eq!(serde_json::to_string(&fp).unwrap(), "\"abc123\"");
    }
}
