//! Recv-error tombstones
//!
//! When a node receives traffic for a session it does not know (it
//! restarted, or tore the tunnel down), it can answer with a header-only
//! RecvError datagram carrying the offending index. The message is
//! unsigned and therefore advisory only: a receiver demands repetition
//! beyond a per-tunnel threshold and a source address matching the
//! remembered remote before acting on it.

use crate::codec::header::{Header, MsgType};
use crate::hostmap::HostInfo;
use crate::inbound::{Interface, MAX_RECV_ERROR};
use std::net::SocketAddr;
use std::sync::Arc;

impl Interface {
    /// Answers an unknown session with a tombstone, subject to the
    /// per-remote-IP rate limit and policy
    pub(crate) async fn maybe_send_recv_error(&self, addr: SocketAddr, remote_index: u32) {
        if !self.recv_error_gate.allows(addr) {
            return;
        }

        tracing::debug!("sending recv error for index {} to {}", remote_index, addr);
        let h = Header::new(MsgType::RecvError, 0, remote_index, 0);
        if let Err(e) = self.outside.send_to(&h.encode(), addr).await {
            tracing::debug!("failed to send recv error to {}: {}", addr, e);
        }
    }

    /// Acts on a received tombstone
    ///
    /// The index on the wire is ours (the sender echoes back what it could
    /// not decrypt), so lookups here are by reverse index. A tombstone is
    /// only ever emitted as a bare datagram to a physical sender; one
    /// arriving through the relay peel loop carries attacker-chosen inner
    /// bytes and no source address to hold the endpoint match against, so
    /// it is refused outright.
    pub(crate) fn handle_recv_error(&self, addr: Option<SocketAddr>, h: &Header) {
        let Some(addr) = addr else {
            tracing::info!(
                "dropping relayed recv error for index {}, no physical sender",
                h.remote_index
            );
            return;
        };
        tracing::debug!("recv error received from {} for index {}", addr, h.remote_index);

        // a stuck pending handshake on this index will never complete;
        // clearing it lets the peer reconnect immediately
        self.pending.delete_index(h.remote_index);

        let Some(hi) = self.hostmap.get_by_index(h.remote_index) else {
            return;
        };

        {
            let mut inner = hi.lock();
            inner.recv_error_seen = inner.recv_error_seen.saturating_add(1);
            if inner.recv_error_seen <= MAX_RECV_ERROR {
                tracing::debug!(
                    "recv error count {} for {} below threshold, ignoring",
                    inner.recv_error_seen,
                    hi.vpn_ip
                );
                return;
            }

            if inner.remote != Some(addr) {
                tracing::info!(
                    "potential spoofed recv error for {} from {}, remote is {:?}",
                    hi.vpn_ip,
                    addr,
                    inner.remote
                );
                return;
            }
        }

        self.close_tunnel(&hi);
    }

    /// Tears a tunnel down locally: releases the connection manager
    /// records, drops every hostmap index, and purges discovery state when
    /// this was the last tunnel for the overlay address
    pub(crate) fn close_tunnel(&self, hi: &Arc<HostInfo>) {
        self.connmgr.release(hi.local_index_id);
        let last = self.hostmap.delete_hostinfo(hi);
        if last {
            self.lighthouse.purge(hi.vpn_ip);
        }
        tracing::info!("closed tunnel to {} (index {})", hi.vpn_ip, hi.local_index_id);
    }
}
