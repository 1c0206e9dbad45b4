//! Concurrent session registry
//!
//! Bidirectional map from session index, relay index, and overlay address
//! to `HostInfo`. Lookups on the packet path take a short read lock; the
//! handshake manager and the teardown path take the write lock.

pub mod hostinfo;

pub use hostinfo::{HostInfo, Relay, RelayStatus, RelayType};

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct HostMapState {
    by_index: HashMap<u32, Arc<HostInfo>>,
    by_relay_index: HashMap<u32, Arc<HostInfo>>,
    by_vpn_ip: HashMap<Ipv4Addr, Vec<Arc<HostInfo>>>,
}

#[derive(Default)]
pub struct HostMap {
    state: RwLock<HostMapState>,
}

impl HostMap {
    pub fn new() -> HostMap {
        HostMap::default()
    }

    pub fn add(&self, hi: Arc<HostInfo>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.by_index.insert(hi.local_index_id, hi.clone());
        state.by_vpn_ip.entry(hi.vpn_ip).or_default().push(hi);
    }

    /// Registers a relay-leg index owned by `hi`
    pub fn add_relay_index(&self, idx: u32, hi: Arc<HostInfo>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.by_relay_index.insert(idx, hi);
    }

    pub fn get_by_index(&self, idx: u32) -> Option<Arc<HostInfo>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_index.get(&idx).cloned()
    }

    pub fn get_by_relay_index(&self, idx: u32) -> Option<Arc<HostInfo>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_relay_index.get(&idx).cloned()
    }

    pub fn get_by_vpn_ip(&self, ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_vpn_ip.get(&ip).and_then(|v| v.first().cloned())
    }

    /// Drops the session registered under `idx`, if any
    ///
    /// Used by the recv-error path to clear pending handshakes by reverse
    /// index.
    pub fn delete_index(&self, idx: u32) -> Option<Arc<HostInfo>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let hi = state.by_index.remove(&idx)?;
        if let Some(list) = state.by_vpn_ip.get_mut(&hi.vpn_ip) {
            list.retain(|other| other.local_index_id != idx);
            if list.is_empty() {
                state.by_vpn_ip.remove(&hi.vpn_ip);
            }
        }
        Some(hi)
    }

    /// Removes a tunnel and all of its indices
    ///
    /// Returns true when this was the last tunnel for the peer's overlay
    /// address, in which case the caller purges discovery state too.
    pub fn delete_hostinfo(&self, hi: &Arc<HostInfo>) -> bool {
        let relay_indices = {
            let inner = hi.lock();
            inner.relay_state.indices()
        };

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.by_index.remove(&hi.local_index_id);
        for idx in relay_indices {
            state.by_relay_index.remove(&idx);
        }

        match state.by_vpn_ip.get_mut(&hi.vpn_ip) {
            Some(list) => {
                list.retain(|other| other.local_index_id != hi.local_index_id);
                if list.is_empty() {
                    state.by_vpn_ip.remove(&hi.vpn_ip);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }
}
