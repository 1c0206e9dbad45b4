//! Per-peer session state
//!
//! A `HostInfo` identifies one established (or pending) tunnel to a peer.
//! Immutable identity and keys live directly on the struct; the fields that
//! change over a tunnel's lifetime (remote endpoint, roaming history, relay
//! entries, recv-error count) sit behind a per-host mutex. The inbound path
//! takes that lock only to mutate roaming fields, to look up relays, and in
//! the recv-error teardown.

use crate::session::ConnectionState;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Role of a relay entry from the owner's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayType {
    /// We are the final target of relayed traffic on this index
    Terminal,
    /// We pass relayed traffic through to another peer
    Forwarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Requested,
    PeerRequested,
    Established,
    Disestablished,
}

/// One leg of a relayed path
#[derive(Debug, Clone)]
pub struct Relay {
    pub kind: RelayType,
    pub state: RelayStatus,
    /// Overlay address of the far end of the relayed path
    pub peer_ip: Ipv4Addr,
    /// Our index on this relay leg
    pub local_index: u32,
    /// The peer's index on this relay leg
    pub remote_index: u32,
}

/// Relay entries indexed two ways: by our local index on the relay leg and
/// by the far end's overlay address
#[derive(Default)]
pub struct RelayState {
    by_idx: HashMap<u32, Relay>,
    by_ip: HashMap<Ipv4Addr, Relay>,
}

impl RelayState {
    pub fn insert(&mut self, relay: Relay) {
        self.by_idx.insert(relay.local_index, relay.clone());
        self.by_ip.insert(relay.peer_ip, relay);
    }

    pub fn for_idx(&self, idx: u32) -> Option<&Relay> {
        self.by_idx.get(&idx)
    }

    pub fn for_ip(&self, ip: Ipv4Addr) -> Option<&Relay> {
        self.by_ip.get(&ip)
    }

    pub fn indices(&self) -> Vec<u32> {
        self.by_idx.keys().copied().collect()
    }
}

pub struct HostInfoInner {
    /// Current UDP endpoint of the peer; updated by roaming
    pub remote: Option<SocketAddr>,
    pub last_roam: Option<Instant>,
    pub last_roam_remote: Option<SocketAddr>,
    /// Advisory recv-error tombstones seen for this tunnel
    pub recv_error_seen: u8,
    pub relay_state: RelayState,
}

pub struct HostInfo {
    pub vpn_ip: Ipv4Addr,
    /// Our 32-bit session handle; peers put this on the wire as the
    /// remote index
    pub local_index_id: u32,
    /// The peer's session handle; we put this on outbound headers
    pub remote_index_id: u32,
    /// Keys and replay window, absent until the handshake completes
    pub connection_state: Option<ConnectionState>,
    inner: Mutex<HostInfoInner>,
}

impl HostInfo {
    pub fn new(
        vpn_ip: Ipv4Addr,
        local_index_id: u32,
        remote_index_id: u32,
        connection_state: Option<ConnectionState>,
    ) -> Self {
        HostInfo {
            vpn_ip,
            local_index_id,
            remote_index_id,
            connection_state,
            inner: Mutex::new(HostInfoInner {
                remote: None,
                last_roam: None,
                last_roam_remote: None,
                recv_error_seen: 0,
                relay_state: RelayState::default(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HostInfoInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.lock().remote
    }

    pub fn set_remote(&self, addr: SocketAddr) {
        self.lock().remote = Some(addr);
    }

    pub fn relay_for_idx(&self, idx: u32) -> Option<Relay> {
        self.lock().relay_state.for_idx(idx).cloned()
    }

    pub fn relay_for_ip(&self, ip: Ipv4Addr) -> Option<Relay> {
        self.lock().relay_state.for_ip(ip).cloned()
    }

    pub fn add_relay(&self, relay: Relay) {
        self.lock().relay_state.insert(relay);
    }
}
