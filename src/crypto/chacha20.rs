//! ChaCha20-Poly1305 session cipher
//!
//! ChaCha20-Poly1305 is a modern authenticated encryption algorithm that is
//! faster than AES on platforms without hardware AES acceleration and is
//! used in protocols like TLS 1.3 and WireGuard.

use super::{CryptoError, SessionCipher, counter_nonce};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};

/// ChaCha20-Poly1305 session cipher
///
/// Uses a 256-bit key and a 96-bit nonce derived from the message counter.
pub struct ChaCha20Cipher {
    cipher: ChaCha20Poly1305,
}

impl ChaCha20Cipher {
    /// Creates a new ChaCha20-Poly1305 cipher from a 32-byte session key
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(key.into());
        Self { cipher }
    }
}

impl SessionCipher for ChaCha20Cipher {
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
