//! Connection manager traffic bookkeeping
//!
//! Tracks which sessions have seen authenticated traffic so the liveness
//! sweeper (outside this crate's inbound scope) can decide what to probe
//! and what to tear down. The inbound path only marks and releases.

use std::collections::HashSet;
use std::sync::RwLock;

#[derive(Default)]
struct TrafficState {
    inbound: HashSet<u32>,
    outbound: HashSet<u32>,
    pending_deletion: HashSet<u32>,
}

#[derive(Default)]
pub struct ConnectionManager {
    state: RwLock<TrafficState>,
}

impl ConnectionManager {
    pub fn new() -> ConnectionManager {
        ConnectionManager::default()
    }

    /// Records authenticated inbound traffic for a session
    pub fn mark_in(&self, local_index: u32) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.inbound.insert(local_index);
        state.pending_deletion.remove(&local_index);
    }

    pub fn mark_out(&self, local_index: u32) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.outbound.insert(local_index);
    }

    /// Clears both the live-traffic and pending-deletion records for a
    /// closing tunnel
    pub fn release(&self, local_index: u32) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.inbound.remove(&local_index);
        state.outbound.remove(&local_index);
        state.pending_deletion.remove(&local_index);
    }

    pub fn saw_in(&self, local_index: u32) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.inbound.contains(&local_index)
    }
}
