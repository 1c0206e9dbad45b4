//! Peer roaming
//!
//! When an authenticated packet arrives from a UDP endpoint other than the
//! one we remember for the peer, the peer has moved (new NAT binding, new
//! uplink) and we update the remembered endpoint so outbound traffic
//! follows it. Two guards apply: the lighthouse allow list, and a
//! suppression window that stops a peer flapping between two endpoints
//! from rewriting the remote on every packet.

use crate::hostmap::HostInfo;
use crate::inbound::Interface;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

impl Interface {
    pub(crate) fn handle_host_roaming(&self, hi: &Arc<HostInfo>, addr: Option<SocketAddr>) {
        let Some(addr) = addr else { return };

        let mut inner = hi.lock();
        if inner.remote == Some(addr) {
            return;
        }

        if !self.lighthouse.remote_allowed(hi.vpn_ip, addr.ip()) {
            tracing::debug!(
                "lighthouse allow list blocked roam of {} to {}",
                hi.vpn_ip,
                addr
            );
            return;
        }

        // suppress an immediate bounce back to the endpoint we just left
        if let (Some(last_roam), Some(last_remote)) = (inner.last_roam, inner.last_roam_remote) {
            if last_remote == addr && last_roam.elapsed() < self.roaming_suppress {
                tracing::debug!(
                    "suppressing roam of {} back to {} ({:?} since last roam)",
                    hi.vpn_ip,
                    addr,
                    last_roam.elapsed()
                );
                return;
            }
        }

        tracing::info!(
            "host {} roamed from {:?} to {}",
            hi.vpn_ip,
            inner.remote,
            addr
        );
        inner.last_roam_remote = inner.remote;
        inner.last_roam = Some(Instant::now());
        inner.remote = Some(addr);
    }
}
