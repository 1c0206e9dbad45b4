//! Established session state
//!
//! A session's keys are produced by the external handshake and are
//! immutable for the session's lifetime; only the replay window and the
//! outbound counter advance.

pub mod replay;

use crate::crypto::SessionCipher;
use crate::session::replay::ReplayWindow;
use std::sync::atomic::{AtomicU64, Ordering};

/// Keys and replay state for one established session
pub struct ConnectionState {
    /// Cipher for inbound datagrams (peer's send key)
    pub decrypt: Box<dyn SessionCipher>,
    /// Cipher for outbound datagrams (our send key)
    pub encrypt: Box<dyn SessionCipher>,
    pub window: ReplayWindow,
    message_counter: AtomicU64,
}

impl ConnectionState {
    pub fn new(decrypt: Box<dyn SessionCipher>, encrypt: Box<dyn SessionCipher>) -> Self {
        ConnectionState {
            decrypt,
            encrypt,
            window: ReplayWindow::default(),
            message_counter: AtomicU64::new(0),
        }
    }

    /// Next outbound message counter; the first value handed out is 1
    pub fn next_counter(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}
