//! Discovery collaborator contract
//!
//! The lighthouse advises peers of each other's UDP endpoints. The inbound
//! core needs three things from it: the remote allow list consulted before
//! a roam, the handler invoked with decrypted lighthouse payloads, and a
//! purge hook fired when the last tunnel for an overlay address closes.

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

/// One allow-list entry
///
/// `vpn_ip` scopes the entry to a peer's overlay range (unset applies to
/// everyone); `remote` is the physical address range being ruled on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowEntry {
    #[serde(default)]
    pub vpn_ip: Option<ipnet::Ipv4Net>,
    pub remote: IpNet,
    pub allow: bool,
}

/// Remote allow list for roaming decisions
///
/// The most specific `remote` prefix that matches wins; an empty list
/// allows everything.
#[derive(Debug, Clone, Default)]
pub struct RemoteAllowList {
    entries: Vec<AllowEntry>,
}

impl RemoteAllowList {
    pub fn new(entries: Vec<AllowEntry>) -> Self {
        RemoteAllowList { entries }
    }

    pub fn allow(&self, vpn_ip: Ipv4Addr, remote: IpAddr) -> bool {
        let mut best: Option<(u8, bool)> = None;
        for entry in &self.entries {
            if let Some(scope) = &entry.vpn_ip {
                if !scope.contains(&vpn_ip) {
                    continue;
                }
            }
            if !entry.remote.contains(&remote) {
                continue;
            }
            let prefix = entry.remote.prefix_len();
            if best.map(|(p, _)| prefix >= p).unwrap_or(true) {
                best = Some((prefix, entry.allow));
            }
        }
        best.map(|(_, allow)| allow).unwrap_or(true)
    }
}

/// Lighthouse seam used by the inbound dispatcher
#[async_trait]
pub trait Lighthouse: Send + Sync {
    /// May this peer roam to `remote`?
    fn remote_allowed(&self, vpn_ip: Ipv4Addr, remote: IpAddr) -> bool;

    /// Invoked with the decrypted payload of a LightHouse datagram
    async fn handle_request(&self, addr: Option<SocketAddr>, vpn_ip: Ipv4Addr, payload: &[u8]);

    /// Forget discovery state for an overlay address
    fn purge(&self, vpn_ip: Ipv4Addr);
}

/// Minimal lighthouse: a static allow list plus a table of learned
/// endpoints, enough for non-lighthouse nodes
pub struct StaticLighthouse {
    allow: RemoteAllowList,
    learned: Mutex<HashMap<Ipv4Addr, Vec<SocketAddr>>>,
}

impl StaticLighthouse {
    pub fn new(allow: RemoteAllowList) -> Self {
        StaticLighthouse {
            allow,
            learned: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Lighthouse for StaticLighthouse {
    fn remote_allowed(&self, vpn_ip: Ipv4Addr, remote: IpAddr) -> bool {
        self.allow.allow(vpn_ip, remote)
    }

    async fn handle_request(&self, addr: Option<SocketAddr>, vpn_ip: Ipv4Addr, payload: &[u8]) {
        tracing::debug!(
            "lighthouse request from {} ({:?}), {} bytes",
            vpn_ip,
            addr,
            payload.len()
        );
        if let Some(addr) = addr {
            let mut learned = self.learned.lock().unwrap_or_else(|e| e.into_inner());
            let list = learned.entry(vpn_ip).or_default();
            if !list.contains(&addr) {
                list.push(addr);
            }
        }
    }

    fn purge(&self, vpn_ip: Ipv4Addr) {
        let mut learned = self.learned.lock().unwrap_or_else(|e| e.into_inner());
        if learned.remove(&vpn_ip).is_some() {
            tracing::debug!("purged lighthouse state for {}", vpn_ip);
        }
    }
}
