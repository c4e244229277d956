use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};

use base64::{prelude::BASE64_STANDARD, Engine};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::Error;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// DER header of an X25519 SubjectPublicKeyInfo (RFC 8410): a fixed
/// 12-byte sequence followed by the 32 raw key bytes. Peers exchange keys
/// in exactly this envelope, base64 encoded with standard padding.
const SPKI_HEADER: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// An ephemeral X25519 keypair, generated once per session.
///
/// # Example
///
/// ```
/// use m2m_codec::crypto::Keypair;
///
/// let a = Keypair::generate();
/// let b = Keypair::generate();
///
/// let k1 = a.derive(&b.public_spki()).unwrap();
/// let k2 = b.derive(&a.public_spki()).unwrap();
///
/// assert_eq!(k1, k2);
/// ```
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key in its wire form: base64 of the SPKI DER encoding.
    pub fn public_spki(&self) -> String {
        let mut der = Vec::with_capacity(SPKI_HEADER.len() + 32);
        der.extend_from_slice(&SPKI_HEADER);
        der.extend_from_slice(self.public.as_bytes());
        BASE64_STANDARD.encode(der)
    }

    /// Run ECDH against a peer's wire-form public key.
    ///
    /// The raw 32-byte shared secret is the session key, used directly as
    /// the AES-256-GCM key without a KDF step.
    pub fn derive(&self, peer_spki_b64: &str) -> Result<[u8; 32], Error> {
        let peer = import_public(peer_spki_b64)?;
        Ok(self.secret.diffie_hellman(&peer).to_bytes())
    }
}

/// Decode a base64 SPKI envelope into an X25519 public key.
pub fn import_public(spki_b64: &str) -> Result<PublicKey, Error> {
    let der = BASE64_STANDARD
        .decode(spki_b64)
        .map_err(|_| Error::InvalidPublicKey)?;

    if der.len() != SPKI_HEADER.len() + 32 || der[..SPKI_HEADER.len()] != SPKI_HEADER {
        return Err(Error::InvalidPublicKey);
    }

    let mut raw = [0u8; 32];
    raw.copy_from_slice(&der[SPKI_HEADER.len()..]);
    Ok(PublicKey::from(raw))
}

/// Seal a plaintext under a session key.
///
/// A fresh 12-byte nonce is drawn for every call. The on-wire token is
/// `base64(nonce ‖ tag ‖ ciphertext)`.
///
/// # Example
///
/// ```
/// use m2m_codec::crypto::{open, seal};
///
/// let key = [7u8; 32];
/// let token = seal(&key, b"hello").unwrap();
///
/// assert_eq!(open(&key, &token).unwrap(), b"hello");
/// assert!(open(&[8u8; 32], &token).is_err());
/// ```
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<String, Error> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    // The aead crate appends the tag to the ciphertext; the wire token
    // wants it between the nonce and the ciphertext.
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::EncodeFailed)?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut token = Vec::with_capacity(NONCE_LEN + sealed.len());
    token.extend_from_slice(&nonce);
    token.extend_from_slice(tag);
    token.extend_from_slice(body);
    Ok(BASE64_STANDARD.encode(token))
}

/// Open a sealed token. Authentication failure and malformed tokens both
/// collapse to [`Error::DecryptionFailed`]; nothing about the failure mode
/// is reported to the peer.
pub fn open(key: &[u8; 32], token: &str) -> Result<Vec<u8>, Error> {
    let raw = BASE64_STANDARD
        .decode(token)
        .map_err(|_| Error::DecryptionFailed)?;

    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::DecryptionFailed);
    }

    let nonce = &raw[..NONCE_LEN];
    let tag = &raw[NONCE_LEN..NONCE_LEN + TAG_LEN];
    let body = &raw[NONCE_LEN + TAG_LEN..];

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
        .map_err(|_| Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        for _ in 0..8 {
            let a = Keypair::generate();
            let b = Keypair::generate();
            assert_eq!(
                a.derive(&b.public_spki()).unwrap(),
                b.derive(&a.public_spki()).unwrap()
            );
        }
    }

    #[test]
    fn seal_open_round_trip() {
        let key = [3u8; 32];
        let payload = vec![0xabu8; 4096];
        let token = seal(&key, &payload).unwrap();
        assert_eq!(open(&key, &token).unwrap(), payload);
    }

    #[test]
    fn open_rejects_wrong_key() {
        let token = seal(&[1u8; 32], b"secret").unwrap();
        assert_eq!(open(&[2u8; 32], &token), Err(Error::DecryptionFailed));
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let key = [9u8; 32];
        let token = seal(&key, b"payload").unwrap();

        let mut raw = BASE64_STANDARD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64_STANDARD.encode(raw);

        assert_eq!(open(&key, &tampered), Err(Error::DecryptionFailed));
    }

    #[test]
    fn open_rejects_short_tokens() {
        let short = BASE64_STANDARD.encode([0u8; 27]);
        assert_eq!(open(&[0u8; 32], &short), Err(Error::DecryptionFailed));
        assert_eq!(open(&[0u8; 32], "not base64!"), Err(Error::DecryptionFailed));
    }

    #[test]
    fn spki_envelope_shape() {
        let keypair = Keypair::generate();
        let der = BASE64_STANDARD.decode(keypair.public_spki()).unwrap();
        assert_eq!(der.len(), 44);
        assert_eq!(&der[..12], &SPKI_HEADER);
        assert!(import_public(&keypair.public_spki()).is_ok());
    }

    #[test]
    fn import_rejects_garbage() {
        assert!(import_public("AAAA").is_err());
        let wrong_header = BASE64_STANDARD.encode([0u8; 44]);
        assert!(import_public(&wrong_header).is_err());
    }
}
