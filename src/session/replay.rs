//! Sliding replay window
//!
//! A bitmap of recently accepted message counters enforcing at-most-once
//! delivery. Workers may decrypt packets for the same session out of order;
//! the window tolerates reordering up to its size (default 1024).
//!
//! Two-phase use is mandatory: a cheap `check` before crypto weeds out
//! obvious replays without paying for AEAD, and the authoritative `update`
//! after a successful decrypt commits the counter. When two workers race on
//! the same counter, the second `update` returns false and that packet is
//! dropped.

use std::sync::RwLock;

/// Default window size in counters; must be a multiple of 64
pub const DEFAULT_REPLAY_WINDOW: u64 = 1024;

struct Window {
    /// Highest counter committed so far
    current: u64,
    /// Ring of 64-bit blocks covering (current - size, current]
    blocks: Vec<u64>,
}

impl Window {
    fn bit_set(&self, counter: u64) -> bool {
        let block = (counter / 64) as usize % self.blocks.len();
        self.blocks[block] & (1u64 << (counter % 64)) != 0
    }

    fn set_bit(&mut self, counter: u64) {
        let block = (counter / 64) as usize % self.blocks.len();
        self.blocks[block] |= 1u64 << (counter % 64);
    }
}

pub struct ReplayWindow {
    size: u64,
    state: RwLock<Window>,
}

impl ReplayWindow {
    pub fn new(size: u64) -> Self {
        assert!(size >= 64 && size % 64 == 0);
        ReplayWindow {
            size,
            state: RwLock::new(Window {
                current: 0,
                blocks: vec![0; (size / 64) as usize],
            }),
        }
    }

    /// Non-destructive admission test
    ///
    /// Returns true when `counter` could still be accepted: not clearly
    /// older than the window below the high-water mark and not already
    /// seen. Counter 0 is never accepted; senders start at 1.
    pub fn check(&self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }
        let w = self.state.read().unwrap_or_else(|e| e.into_inner());
        if counter > w.current {
            return true;
        }
        if w.current - counter >= self.size {
            return false;
        }
        !w.bit_set(counter)
    }

    /// Commits `counter` into the window
    ///
    /// Returns false when the counter is out of window or already set,
    /// which happens when another worker committed it (or advanced the
    /// high-water mark past it) while this packet was being decrypted.
    pub fn update(&self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }
        let mut w = self.state.write().unwrap_or_else(|e| e.into_inner());
        if counter > w.current {
            let n_blocks = w.blocks.len() as u64;
            let span = counter / 64 - w.current / 64;
            if span >= n_blocks {
                w.blocks.fill(0);
            } else {
                for i in (w.current / 64 + 1)..=(counter / 64) {
                    let idx = (i % n_blocks) as usize;
                    w.blocks[idx] = 0;
                }
            }
            w.current = counter;
            w.set_bit(counter);
            return true;
        }
        if w.current - counter >= self.size {
            return false;
        }
        if w.bit_set(counter) {
            return false;
        }
        w.set_bit(counter);
        true
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        ReplayWindow::new(DEFAULT_REPLAY_WINDOW)
    }
}
