//! AES-256-GCM session cipher
//!
//! AES-256-GCM (Galois/Counter Mode) is an industry-standard authenticated
//! encryption algorithm that provides both confidentiality and authenticity.
//! It offers excellent performance on platforms with hardware AES
//! acceleration (AES-NI).

use super::{CryptoError, SessionCipher, counter_nonce};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};

/// AES-256-GCM session cipher
///
/// Uses a 256-bit key and a 96-bit nonce derived from the message counter.
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    /// Creates a new AES-256-GCM cipher from a 32-byte session key
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(key.into());
        Self { cipher }
    }
}

impl SessionCipher for Aes256GcmCipher {
    fn seal(
        &self,
        buf: &mut Vec<u8>,
        plaintext: &[u8],
        counter: u64,
        nb: &mut [u8; 12],
    ) -> Result<(), CryptoError> {
        counter_nonce(counter, nb);
        let ct = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nb[..]),
                Payload {
                    msg: plaintext,
                    aad: buf.as_slice(),
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        buf.extend_from_slice(&ct);
        Ok(())
    }

    fn open(
        &self,
        out: &mut Vec<u8>,
        ad: &[u8],
        ciphertext: &[u8],
        counter: u64,
        nb: &mut [u8; 12],
    ) -> Result<(), CryptoError> {
        counter_nonce(counter, nb);
        let pt = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nb[..]),
                Payload {
                    msg: ciphertext,
                    aad: ad,
                },
            )
            .map_err(|_| CryptoError::Decrypt)?;
        out.clear();
        out.extend_from_slice(&pt);
        Ok(())
    }
}
