//! Session AEAD ciphers
//!
//! This module provides the per-session authenticated encryption used on
//! the overlay transport. Supported algorithms:
//! - AES-256-GCM: fast with hardware AES acceleration
//! - ChaCha20-Poly1305: fast everywhere, used by modern VPN protocols
//!
//! Unlike a random-nonce design, the nonce is derived from the sender's
//! monotonic message counter, so the counter on the wire is all a receiver
//! needs to decrypt. The 16-byte overlay header travels as associated data.

pub mod aes256;
pub mod chacha20;

use crate::crypto::aes256::Aes256GcmCipher;
use crate::crypto::chacha20::ChaCha20Cipher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

/// AEAD failure kinds
#[derive(Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// Tag verification failed: tampered data, wrong key, or wrong AD
    Decrypt,
    /// Encryption failed (should not happen with a valid key)
    Encrypt,
}

impl std::error::Error for CryptoError {}

impl Display for CryptoError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CryptoError::Decrypt => "AEAD decryption failed".fmt(fmt),
            CryptoError::Encrypt => "AEAD encryption failed".fmt(fmt),
        }
    }
}

/// Core session encryption trait
///
/// Implementations are `Send + Sync` so a session's keys can be shared
/// across worker threads. The caller supplies a reusable 12-byte nonce
/// scratch buffer; implementations write the counter-derived nonce into it
/// rather than allocating.
pub trait SessionCipher: Send + Sync {
    /// Encrypts `plaintext` and appends ciphertext plus tag to `buf`
    ///
    /// The current contents of `buf` (typically the encoded overlay header)
    /// are the associated data. With an empty `plaintext` this produces a
    /// bare authentication tag over `buf`, which is how relayed datagrams
    /// are signed without a second encryption layer.
    fn seal(
        &self,
        buf: &mut Vec<u8>,
        plaintext: &[u8],
        counter: u64,
        nb: &mut [u8; 12],
    ) -> Result<(), CryptoError>;

    /// Decrypts `ciphertext` (which includes the trailing tag) into `out`
    ///
    /// `out` is cleared first; on success it holds the plaintext. `ad` must
    /// byte-match what the sender sealed over or the tag check fails.
    fn open(
        &self,
        out: &mut Vec<u8>,
        ad: &[u8],
        ciphertext: &[u8],
        counter: u64,
        nb: &mut [u8; 12],
    ) -> Result<(), CryptoError>;
}

/// Derives the 12-byte AEAD nonce from a message counter
///
/// Leading 4 bytes zero, trailing 8 bytes the counter big-endian. Counter
/// reuse under the same key is a protocol violation upstream; this layer
/// trusts the replay window to never admit a counter twice.
pub(crate) fn counter_nonce(counter: u64, nb: &mut [u8; 12]) {
    nb[0..4].fill(0);
    nb[4..12].copy_from_slice(&counter.to_be_bytes());
}

/// Cipher selection, as it appears in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    Aes256,
    Chacha20,
}

/// Factory function to create a session cipher from a raw 32-byte key
pub fn new_cipher(kind: CipherKind, key: &[u8; 32]) -> Box<dyn SessionCipher> {
    match kind {
        CipherKind::Aes256 => Box::new(Aes256GcmCipher::new(key)),
        CipherKind::Chacha20 => Box::new(ChaCha20Cipher::new(key)),
    }
}
