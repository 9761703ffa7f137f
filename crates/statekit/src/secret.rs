//! Secret values and the passphrase-keyed codec that seals them
//!
//! A [`Secret`] is wrapped at declaration time so its plaintext never shows up in
//! logs, diffs or events. When a record is persisted, each secret is sealed by a
//! [`SecretCodec`]:
//!
//! - key: PBKDF2-HMAC-SHA256 over the passphrase and a random 16-byte salt
//! - cipher: ChaCha20-Poly1305 with a random 96-bit nonce per value
//! - encoding: `v1.<salt>.<nonce>.<ciphertext+tag>`, each part base64 without padding
//!
//! Losing or rotating the passphrase makes previously sealed values unreadable.
//! Opening them fails with [`Error::Decryption`]; it never yields garbage plaintext.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Mutex;

const VERSION: &str = "v1";
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(100_000).unwrap();

const REDACTED: &str = "***REDACTED***";

/// A sensitive scalar that redacts itself in Debug and Display
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(plaintext: impl Into<String>) -> Self {
        Self(plaintext.into())
    }

    /// Expose the plaintext
    ///
    /// Only provider handlers that hand the value to the target platform should
    /// call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// User-supplied passphrase the secret key is derived from
#[derive(Clone)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(passphrase.into())
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Seals and opens secret values with a passphrase-derived key
pub struct SecretCodec {
    passphrase: Passphrase,
    salt: [u8; SALT_LEN],
    rng: SystemRandom,
    /// Derived keys by salt, so opening many values sealed under one salt
    /// derives the key once.
    keys: Mutex<HashMap<[u8; SALT_LEN], [u8; KEY_LEN]>>,
}

impl SecretCodec {
    /// Create a codec with a fresh random salt for sealing
    pub fn new(passphrase: Passphrase) -> Result<Self> {
        let rng = SystemRandom::new();
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt)
            .map_err(|_| std::io::Error::other("system randomness unavailable"))?;

        Ok(Self {
            passphrase,
            salt,
            rng,
            keys: Mutex::new(HashMap::new()),
        })
    }

    /// Seal a secret into its encoded form
    pub fn seal(&self, secret: &Secret) -> Result<String> {
        let key = self.key_for(&self.salt)?;

        let mut nonce_bytes = [0u8; aead::NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| std::io::Error::other("system randomness unavailable"))?;

        let mut in_out = secret.expose().as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| decryption("sealing failed"))?;

        Ok(format!(
            "{VERSION}.{}.{}.{}",
            STANDARD_NO_PAD.encode(self.salt),
            STANDARD_NO_PAD.encode(nonce_bytes),
            STANDARD_NO_PAD.encode(&in_out)
        ))
    }

    /// Open an encoded secret, re-wrapping the plaintext as a [`Secret`]
    pub fn open(&self, sealed: &str) -> Result<Secret> {
        let mut parts = sealed.split('.');
        let (Some(version), Some(salt), Some(nonce), Some(body), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(decryption("malformed sealed value"));
        };

        if version != VERSION {
            return Err(decryption(&format!("unsupported secret version '{version}'")));
        }

        let salt: [u8; SALT_LEN] = decode_fixed(salt, "salt")?;
        let nonce: [u8; aead::NONCE_LEN] = decode_fixed(nonce, "nonce")?;
        let mut in_out = STANDARD_NO_PAD
            .decode(body)
            .map_err(|e| decryption(&format!("invalid ciphertext encoding: {e}")))?;

        let key = self.key_for(&salt)?;
        let plaintext = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| decryption("authentication failed (wrong passphrase or tampered value)"))?;

        let plaintext = String::from_utf8(plaintext.to_vec())
            .map_err(|_| decryption("plaintext is not valid UTF-8"))?;

        Ok(Secret::new(plaintext))
    }

    fn key_for(&self, salt: &[u8; SALT_LEN]) -> Result<LessSafeKey> {
        let mut keys = match self.keys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let raw = *keys.entry(*salt).or_insert_with(|| {
            let mut raw = [0u8; KEY_LEN];
            pbkdf2::derive(
                pbkdf2::PBKDF2_HMAC_SHA256,
                PBKDF2_ITERATIONS,
                salt,
                self.passphrase.as_bytes(),
                &mut raw,
            );
            raw
        });

        let unbound = UnboundKey::new(&aead::CHACHA20_POLY1305, &raw)
            .map_err(|_| decryption("invalid key length"))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec")
            .field("passphrase", &self.passphrase)
            .finish_non_exhaustive()
    }
}

fn decryption(reason: &str) -> Error {
    Error::Decryption {
        key: None,
        reason: reason.to_string(),
    }
}

fn decode_fixed<const N: usize>(part: &str, what: &str) -> Result<[u8; N]> {
    let bytes = STANDARD_NO_PAD
        .decode(part)
        .map_err(|e| decryption(&format!("invalid {what} encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| decryption(&format!("{what} has wrong length")))
}
