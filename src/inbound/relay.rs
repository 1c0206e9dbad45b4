//! Relay termination and forwarding
//!
//! A `Message/Relay` datagram is authenticated but not encrypted: the AEAD
//! tag at the tail covers everything before it, and the authenticated
//! region carries a complete inner overlay datagram starting right after
//! the outer header. Whether we are the destination (terminal) or the
//! middle hop (forwarding) is decided by the relay entry registered under
//! the outer remote index.
//!
//! All lookup misses and state mismatches drop the packet with a log; no
//! error ever goes back to the origin.

use crate::codec::header::{HEADER_LEN, Header, MsgType, SUB_RELAY, TAG_LEN};
use crate::hostmap::{HostInfo, Relay, RelayStatus, RelayType};
use crate::inbound::dispatch::Dispatch;
use crate::inbound::{Interface, ViaSender};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

impl Interface {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn handle_relay<'a>(
        &self,
        addr: Option<SocketAddr>,
        via: Option<ViaSender>,
        packet: &'a [u8],
        h: &Header,
        hostinfo: Option<Arc<HostInfo>>,
        out: &mut Vec<u8>,
        nb: &mut [u8; 12],
    ) -> Dispatch<'a> {
        let Some((hi, ci)) = self.admit(addr, h, hostinfo.as_ref()).await else {
            return Dispatch::Done;
        };

        if packet.len() < HEADER_LEN + TAG_LEN {
            self.stats.malformed_header.fetch_add(1, Ordering::Relaxed);
            tracing::info!("dropping truncated relay packet from {:?}", addr);
            return Dispatch::Done;
        }

        // associated data is the entire wrapper minus the trailing tag;
        // the "plaintext" is empty
        let split = packet.len() - TAG_LEN;
        if let Err(e) = ci
            .decrypt
            .open(out, &packet[..split], &packet[split..], h.counter, nb)
        {
            self.stats.decrypt_failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                packet = ?packet,
                "failed to authenticate relay packet from {:?} ({}): {}",
                addr,
                h,
                e
            );
            return Dispatch::Done;
        }
        if !ci.window.update(h.counter) {
            self.stats.out_of_window.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("dropping out of window relay packet, counter {}", h.counter);
            return Dispatch::Done;
        }

        let Some(relay) = hi.relay_for_idx(h.remote_index) else {
            self.stats.relay_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "no relay entry on {} for index {}, dropping",
                hi.vpn_ip,
                h.remote_index
            );
            return Dispatch::Done;
        };

        match relay.kind {
            RelayType::Terminal => {
                // we are the target: peel the wrapper and restart dispatch.
                // the relay peer authenticated this packet, so it roams and
                // is marked before the inner level runs.
                self.finish_authenticated(hi, addr, via.as_ref());
                Dispatch::Relayed {
                    inner: &packet[HEADER_LEN..split],
                    via: ViaSender {
                        relay_hostinfo: hi.clone(),
                        remote_index: h.remote_index,
                        relay,
                    },
                }
            }
            RelayType::Forwarding => {
                self.forward_relay(hi, &relay, &packet[HEADER_LEN..split], out, nb)
                    .await;
                self.finish_authenticated(hi, addr, via.as_ref());
                Dispatch::Done
            }
        }
    }

    /// Middle-hop leg: pass the still-wrapped datagram on to the far peer
    async fn forward_relay(
        &self,
        from: &Arc<HostInfo>,
        relay: &Relay,
        wrapped: &[u8],
        buf: &mut Vec<u8>,
        nb: &mut [u8; 12],
    ) {
        let Some(target) = self.hostmap.get_by_vpn_ip(relay.peer_ip) else {
            self.stats.relay_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::info!("no tunnel to relay target {}, dropping", relay.peer_ip);
            return;
        };

        // the reverse entry on the target leg is keyed by the originator
        let Some(target_relay) = target.relay_for_ip(from.vpn_ip) else {
            self.stats.relay_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "relay target {} has no entry back to {}, dropping",
                relay.peer_ip,
                from.vpn_ip
            );
            return;
        };

        if target_relay.state != RelayStatus::Established {
            self.stats.relay_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "relay to {} not established ({:?}), dropping",
                relay.peer_ip,
                target_relay.state
            );
            return;
        }

        match target_relay.kind {
            RelayType::Forwarding => {
                self.send_via(&target, &target_relay, wrapped, buf, nb).await;
            }
            RelayType::Terminal => {
                // should be unreachable under correct handshakes; kept as a guard
                self.stats.relay_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "unexpected terminal relay on forwarding path to {}, dropping",
                    relay.peer_ip
                );
            }
        }
    }

    /// Re-wraps `payload` for the target relay leg and sends it out
    ///
    /// The wrapper is sealed with a bare tag on the target session; the
    /// payload itself stays as received.
    pub(crate) async fn send_via(
        &self,
        target: &Arc<HostInfo>,
        relay: &Relay,
        payload: &[u8],
        buf: &mut Vec<u8>,
        nb: &mut [u8; 12],
    ) {
        let Some(ci) = target.connection_state.as_ref() else {
            tracing::info!("no session on relay leg to {}, dropping", target.vpn_ip);
            return;
        };
        let Some(remote) = target.remote() else {
            tracing::info!("no remote endpoint on relay leg to {}, dropping", target.vpn_ip);
            return;
        };

        let counter = ci.next_counter();
        buf.clear();
        Header::new(MsgType::Message, SUB_RELAY, relay.remote_index, counter).encode_into(buf);
        buf.extend_from_slice(payload);
        if let Err(e) = ci.encrypt.seal(buf, b"", counter, nb) {
            tracing::error!("failed to seal relay wrapper to {}: {}", target.vpn_ip, e);
            return;
        }

        if let Err(e) = self.outside.send_to(buf, remote).await {
            tracing::error!("failed to forward relay packet to {}: {}", remote, e);
            return;
        }
        self.connmgr.mark_out(target.local_index_id);
    }
}
