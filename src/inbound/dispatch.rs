//! Top-level datagram dispatch
//!
//! One call per UDP datagram. Per-packet errors never unwind past this
//! boundary; every datagram is an independent unit and failures drop it
//! with a log at the severity its kind deserves.

use crate::codec::control::ControlMsg;
use crate::codec::errors::CodecError;
use crate::codec::header::{
    HEADER_LEN, Header, MsgType, SUB_RELAY, TAG_LEN, TEST_REPLY, TEST_REQUEST,
};
use crate::firewall::ConntrackCache;
use crate::firewall::packet::{FirewallPacket, build_ipv4, internet_checksum, PROTO_ICMP};
use crate::hostmap::HostInfo;
use crate::inbound::{Interface, MAX_RELAY_DEPTH, ViaSender};
use crate::session::ConnectionState;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// What a single dispatch level decided
pub(crate) enum Dispatch<'a> {
    Done,
    /// A terminated relay: the wrapped datagram goes back through the
    /// dispatcher with no UDP source address
    Relayed { inner: &'a [u8], via: ViaSender },
}

impl Interface {
    /// Entry point for one inbound UDP datagram
    ///
    /// `addr` is the physical source, absent on the inner dispatch of a
    /// terminated relay. `out` and `nb` are the worker's reusable scratch
    /// buffers; any bytes in them are burned by this call.
    pub async fn handle_outside_packet(
        &self,
        addr: Option<SocketAddr>,
        data: &[u8],
        out: &mut Vec<u8>,
        nb: &mut [u8; 12],
        cache: &mut ConntrackCache,
    ) {
        let mut addr = addr;
        let mut via: Option<ViaSender> = None;
        let mut packet: &[u8] = data;
        let mut depth = 0;

        // relay termination is a loop, not recursion: peel one layer and
        // restart dispatch, bounded at a single level of nesting
        loop {
            match self.dispatch(addr, via.take(), packet, out, nb, cache).await {
                Dispatch::Done => return,
                Dispatch::Relayed { inner, via: v } => {
                    if depth >= MAX_RELAY_DEPTH {
                        tracing::info!("dropping relay packet nested past depth {}", depth);
                        return;
                    }
                    depth += 1;
                    addr = None;
                    via = Some(v);
                    packet = inner;
                }
            }
        }
    }

    async fn dispatch<'a>(
        &self,
        addr: Option<SocketAddr>,
        via: Option<ViaSender>,
        packet: &'a [u8],
        out: &mut Vec<u8>,
        nb: &mut [u8; 12],
        cache: &mut ConntrackCache,
    ) -> Dispatch<'a> {
        // zero and one byte datagrams are nat hole punches, not noise worth logging
        if packet.len() <= 1 {
            return Dispatch::Done;
        }

        let h = match Header::parse(packet) {
            Ok(h) => h,
            Err(CodecError::UnknownType(t)) => {
                self.stats.unknown_type.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("unknown message type {} from {:?}", t, addr);
                return Dispatch::Done;
            }
            Err(e) => {
                self.stats.malformed_header.fetch_add(1, Ordering::Relaxed);
                tracing::info!("dropping malformed datagram from {:?}: {}", addr, e);
                return Dispatch::Done;
            }
        };

        // anti-loop: a datagram sourced from our own overlay network is one
        // of ours coming back double-encrypted. IPv6 physical sources carry
        // no overlay meaning and pass without this check.
        if let Some(a) = addr {
            if let IpAddr::V4(v4) = a.ip() {
                if self.vpn_net.contains(&v4) {
                    tracing::debug!("refusing to process datagram sourced from our overlay network: {}", a);
                    return Dispatch::Done;
                }
            }
        }

        let hostinfo = if h.typ == MsgType::Message && h.subtype == SUB_RELAY {
            self.hostmap.get_by_relay_index(h.remote_index)
        } else {
            self.hostmap.get_by_index(h.remote_index)
        };

        match h.typ {
            MsgType::Message if h.subtype == SUB_RELAY => {
                self.handle_relay(addr, via, packet, &h, hostinfo, out, nb).await
            }
            MsgType::Message => {
                let Some((hi, ci)) = self.admit(addr, &h, hostinfo.as_ref()).await else {
                    return Dispatch::Done;
                };
                if self.decrypt_to_tun(hi, ci, addr, packet, &h, out, nb, cache).await {
                    self.finish_authenticated(hi, addr, via.as_ref());
                }
                Dispatch::Done
            }
            MsgType::LightHouse => {
                let Some((hi, ci)) = self.admit(addr, &h, hostinfo.as_ref()).await else {
                    return Dispatch::Done;
                };
                if !self.open(ci, addr, packet, &h, out, nb) {
                    return Dispatch::Done;
                }
                self.lighthouse.handle_request(addr, hi.vpn_ip, out).await;
                self.finish_authenticated(hi, addr, via.as_ref());
                Dispatch::Done
            }
            MsgType::Test => {
                let Some((hi, ci)) = self.admit(addr, &h, hostinfo.as_ref()).await else {
                    return Dispatch::Done;
                };
                if !self.open(ci, addr, packet, &h, out, nb) {
                    return Dispatch::Done;
                }
                // roam before replying so the echo goes to the live endpoint
                self.finish_authenticated(hi, addr, via.as_ref());
                if h.subtype == TEST_REQUEST {
                    self.send_to_peer(hi, MsgType::Test, TEST_REPLY, out, nb).await;
                } else if h.subtype != TEST_REPLY {
                    tracing::debug!("unknown test subtype {} from {}", h.subtype, hi.vpn_ip);
                }
                Dispatch::Done
            }
            MsgType::CloseTunnel => {
                let Some((hi, ci)) = self.admit(addr, &h, hostinfo.as_ref()).await else {
                    return Dispatch::Done;
                };
                if !self.open(ci, addr, packet, &h, out, nb) {
                    return Dispatch::Done;
                }
                tracing::info!("close tunnel received from {}", hi.vpn_ip);
                // authenticated data reached us, so the shared tail still
                // applies before the teardown
                self.finish_authenticated(hi, addr, via.as_ref());
                self.close_tunnel(hi);
                Dispatch::Done
            }
            MsgType::Control => {
                let Some((hi, ci)) = self.admit(addr, &h, hostinfo.as_ref()).await else {
                    return Dispatch::Done;
                };
                if !self.open(ci, addr, packet, &h, out, nb) {
                    return Dispatch::Done;
                }
                let msg = match ControlMsg::unmarshal(out) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("bad control message from {}: {}", hi.vpn_ip, e);
                        return Dispatch::Done;
                    }
                };
                self.relays.handle_control(hi, msg).await;
                self.finish_authenticated(hi, addr, via.as_ref());
                Dispatch::Done
            }
            MsgType::Handshake => {
                self.handshaker
                    .handle(addr, via.as_ref(), packet, &h, hostinfo)
                    .await;
                Dispatch::Done
            }
            MsgType::RecvError => {
                self.handle_recv_error(addr, &h);
                Dispatch::Done
            }
        }
    }

    /// Pre-crypto admission: a session must exist and its replay window
    /// must not have clearly seen this counter already
    ///
    /// On failure a recv-error may go back to the physical sender so it
    /// can restart its handshake.
    pub(crate) async fn admit<'h>(
        &self,
        addr: Option<SocketAddr>,
        h: &Header,
        hostinfo: Option<&'h Arc<HostInfo>>,
    ) -> Option<(&'h Arc<HostInfo>, &'h ConnectionState)> {
        let ci = hostinfo.and_then(|hi| hi.connection_state.as_ref());
        let admitted = ci.map(|ci| ci.window.check(h.counter)).unwrap_or(false);
        if !admitted {
            self.stats.dropped_no_session.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("dropping packet from {:?}, no admissible session for {}", addr, h);
            if let Some(addr) = addr {
                self.maybe_send_recv_error(addr, h.remote_index).await;
            }
            return None;
        }
        Some((hostinfo?, ci?))
    }

    /// AEAD-opens a standard encrypted datagram into `out`
    ///
    /// The 16-byte overlay header is the associated data, the rest is
    /// ciphertext plus tag. Commits the counter afterwards; the losing
    /// side of a decrypt race is dropped here.
    pub(crate) fn open(
        &self,
        ci: &ConnectionState,
        addr: Option<SocketAddr>,
        packet: &[u8],
        h: &Header,
        out: &mut Vec<u8>,
        nb: &mut [u8; 12],
    ) -> bool {
        if let Err(e) = ci.decrypt.open(
            out,
            &packet[..HEADER_LEN],
            &packet[HEADER_LEN..],
            h.counter,
            nb,
        ) {
            self.stats.decrypt_failed.fetch_add(1, Ordering::Relaxed);
            // an AEAD failure is never answered with a recv-error
            tracing::error!(
                packet = ?packet,
                "failed to decrypt packet from {:?} ({}): {}",
                addr,
                h,
                e
            );
            return false;
        }
        if !ci.window.update(h.counter) {
            self.stats.out_of_window.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("dropping out of window packet, counter {}", h.counter);
            return false;
        }
        true
    }

    /// Firewall check and TUN delivery for a decrypted inner packet
    ///
    /// Returns true when the datagram authenticated and ran to the TUN
    /// write; a failed TUN write is logged and does not fail the packet.
    #[allow(clippy::too_many_arguments)]
    async fn decrypt_to_tun(
        &self,
        hi: &Arc<HostInfo>,
        ci: &ConnectionState,
        addr: Option<SocketAddr>,
        packet: &[u8],
        h: &Header,
        out: &mut Vec<u8>,
        nb: &mut [u8; 12],
        cache: &mut ConntrackCache,
    ) -> bool {
        if !self.open(ci, addr, packet, h, out, nb) {
            return false;
        }

        let fp = match FirewallPacket::from_ipv4(out, true) {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!("dropping invalid inner packet from {}: {}", hi.vpn_ip, e);
                return false;
            }
        };

        if self.firewall.drop_incoming(&fp, cache) {
            self.stats.firewall_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("firewall dropped inbound {:?} from {}", fp, hi.vpn_ip);
            self.reject_outside(hi, &fp, out, nb).await;
            return false;
        }

        if let Err(e) = self.inside.write_packet(out).await {
            tracing::error!("failed to write to tun: {}", e);
        }
        true
    }

    /// Policy-driven reject for a firewalled packet: an ICMP
    /// port-unreachable sent back through the tunnel
    async fn reject_outside(
        &self,
        hi: &Arc<HostInfo>,
        fp: &FirewallPacket,
        dropped: &[u8],
        nb: &mut [u8; 12],
    ) {
        if self.firewall.reject != crate::firewall::RejectPolicy::Icmp {
            return;
        }
        // quote the offending header plus 8 bytes, per icmp convention
        let quote_len = dropped.len().min(28);
        let mut icmp = vec![3u8, 3, 0, 0, 0, 0, 0, 0];
        icmp.extend_from_slice(&dropped[..quote_len]);
        let csum = internet_checksum(&icmp);
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());

        let reject = build_ipv4(fp.local_ip, fp.remote_ip, PROTO_ICMP, &icmp);
        self.send_to_peer(hi, MsgType::Message, 0, &reject, nb).await;
    }

    /// Roaming plus traffic accounting, shared tail of every authenticated
    /// path. A packet that arrived through a relay does not roam.
    pub(crate) fn finish_authenticated(
        &self,
        hi: &Arc<HostInfo>,
        addr: Option<SocketAddr>,
        via: Option<&ViaSender>,
    ) {
        if via.is_none() {
            self.handle_host_roaming(hi, addr);
        }
        self.connmgr.mark_in(hi.local_index_id);
    }

    /// Encrypts `payload` to the peer on its own session and sends it to
    /// the remembered remote endpoint
    pub(crate) async fn send_to_peer(
        &self,
        hi: &Arc<HostInfo>,
        typ: MsgType,
        subtype: u8,
        payload: &[u8],
        nb: &mut [u8; 12],
    ) {
        let Some(ci) = hi.connection_state.as_ref() else {
            tracing::debug!("no session to send {:?} to {}", typ, hi.vpn_ip);
            return;
        };
        let Some(remote) = hi.remote() else {
            tracing::debug!("no remote endpoint to send {:?} to {}", typ, hi.vpn_ip);
            return;
        };

        let counter = ci.next_counter();
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + TAG_LEN);
        Header::new(typ, subtype, hi.remote_index_id, counter).encode_into(&mut buf);
        if let Err(e) = ci.encrypt.seal(&mut buf, payload, counter, nb) {
            tracing::error!("failed to seal {:?} to {}: {}", typ, hi.vpn_ip, e);
            return;
        }

        if let Err(e) = self.outside.send_to(&buf, remote).await {
            tracing::error!("failed to send {:?} to {}: {}", typ, remote, e);
            return;
        }
        self.connmgr.mark_out(hi.local_index_id);
    }
}
