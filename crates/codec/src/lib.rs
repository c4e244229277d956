//! Wire layer shared by the hub and the agent runtime.
//!
//! Both channels of the fabric carry the same byte-level grammar: a stream
//! of UTF-8 JSON objects, each terminated by a single `\n`. On top of that
//! this crate provides the session crypto (X25519 agreement, AES-256-GCM
//! sealing) and the typed message sets for the peer channel and the hub
//! control channel.

pub mod control;
pub mod crypto;
pub mod frame;
pub mod peer;

use rand::RngCore;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// A line arrived that is not a JSON object.
    InvalidJson,
    /// A line exceeded the frame size cap without a terminator.
    FrameTooLarge,
    /// A public key that is not a valid base64 X25519 SPKI envelope.
    InvalidPublicKey,
    /// AEAD authentication failed or the token is malformed.
    DecryptionFailed,
    /// A frame could not be serialized.
    EncodeFailed,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid json frame"),
            Self::FrameTooLarge => write!(f, "frame too large"),
            Self::InvalidPublicKey => write!(f, "invalid public key"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
            Self::EncodeFailed => write!(f, "frame encode failed"),
        }
    }
}

/// Mint a correlation id: 8 random bytes, hex encoded.
///
/// Correlation ids are opaque 16-character tokens carrying 64 bits of
/// entropy, used to pair requests with replies on both channels.
///
/// # Example
///
/// ```
/// let id = m2m_codec::correlation_id();
///
/// assert_eq!(id.len(), 16);
/// assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
/// ```
pub fn correlation_id() -> String {
    hex_token(8)
}

/// Hex encode `size` random bytes.
pub fn hex_token(size: usize) -> String {
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut out = String::with_capacity(size * 2);
    for byte in &bytes {
        out.push_str(&format!("{:02x}", byte));
    }

    out
}
