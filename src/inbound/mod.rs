//! Inbound packet dispatch
//!
//! This is the per-packet pipeline between the physical UDP socket and the
//! TUN device: header parsing, session lookup, AEAD validation with replay
//! windowing, relay termination/forwarding, the stateful firewall check,
//! and the roaming policy.
//!
//! # Threading
//!
//! Datagrams fan out from the socket task to parallel workers over
//! channels. Each `InboundWorker` owns its plaintext buffer, nonce scratch,
//! and conntrack cache; nothing per-packet is shared across workers.
//! Packets for the same session may decrypt out of order; the replay
//! window tolerates reordering up to its size, and when two workers race
//! on one counter the later `update` loses and that copy is dropped.

pub mod dispatch;
pub mod recv_error;
pub mod relay;
pub mod roaming;

use crate::codec::control::ControlMsg;
use crate::codec::header::Header;
use crate::connmgr::ConnectionManager;
use crate::firewall::{ConntrackCache, Firewall};
use crate::hostmap::{HostInfo, HostMap, Relay};
use crate::lighthouse::Lighthouse;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// UDP packet buffer size; fits an overlay MTU of 1500 plus headers
pub const BUFFER_SIZE: usize = 2048;

/// A relayed datagram may re-enter the dispatcher exactly once
const MAX_RELAY_DEPTH: usize = 1;

/// Recv-errors seen for one tunnel beyond this tear it down
const MAX_RECV_ERROR: u8 = 3;

/// Writer for decrypted payloads headed to the TUN device
#[async_trait]
pub trait InsideWriter: Send + Sync {
    async fn write_packet(&self, packet: &[u8]) -> crate::Result<()>;
}

/// Writer for datagrams headed back out the physical network
#[async_trait]
pub trait OutsideWriter: Send + Sync {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> crate::Result<()>;
}

/// External handshake state machine
///
/// Receives raw handshake datagrams before any session exists; may mutate
/// the hostmaps it was constructed with.
#[async_trait]
pub trait HandshakeHandler: Send + Sync {
    async fn handle(
        &self,
        addr: Option<SocketAddr>,
        via: Option<&ViaSender>,
        packet: &[u8],
        header: &Header,
        hostinfo: Option<Arc<HostInfo>>,
    );
}

/// External relay manager, receives parsed control messages
#[async_trait]
pub trait RelayManager: Send + Sync {
    async fn handle_control(&self, hostinfo: &Arc<HostInfo>, msg: ControlMsg);
}

/// Token describing the relay a packet arrived through
///
/// Present on the inner dispatch of a terminated relay so that level does
/// not roam the origin peer on the relay's UDP address.
pub struct ViaSender {
    pub relay_hostinfo: Arc<HostInfo>,
    pub remote_index: u32,
    pub relay: Relay,
}

/// When to answer an unknown session with a recv-error tombstone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecvErrorPolicy {
    Never,
    Always,
    /// Only to private address space, except during the post-start grace
    /// window when peers are reconverging on a restarted node
    Private,
}

impl Default for RecvErrorPolicy {
    fn default() -> Self {
        RecvErrorPolicy::Private
    }
}

/// Admission gate for outbound recv-errors, rate limited per remote IP
pub struct RecvErrorGate {
    policy: RecvErrorPolicy,
    started: Instant,
    grace: Duration,
    min_interval: Duration,
    last_sent: Mutex<HashMap<IpAddr, Instant>>,
}

impl RecvErrorGate {
    pub fn new(policy: RecvErrorPolicy) -> Self {
        RecvErrorGate {
            policy,
            started: Instant::now(),
            grace: Duration::from_secs(300),
            min_interval: Duration::from_secs(1),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn allows(&self, addr: SocketAddr) -> bool {
        let permitted = match self.policy {
            RecvErrorPolicy::Always => true,
            RecvErrorPolicy::Never => false,
            RecvErrorPolicy::Private => {
                self.started.elapsed() < self.grace || is_private(addr.ip())
            }
        };
        if !permitted {
            return false;
        }

        let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        if last.len() > 4096 {
            last.clear();
        }
        match last.get(&addr.ip()) {
            Some(sent) if sent.elapsed() < self.min_interval => false,
            _ => {
                last.insert(addr.ip(), Instant::now());
                true
            }
        }
    }
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Drop counters surfaced by the stats log line
#[derive(Default)]
pub struct InboundStats {
    pub malformed_header: AtomicU64,
    pub unknown_type: AtomicU64,
    pub dropped_no_session: AtomicU64,
    pub decrypt_failed: AtomicU64,
    pub out_of_window: AtomicU64,
    pub relay_dropped: AtomicU64,
    pub firewall_dropped: AtomicU64,
}

/// Tunables that are not collaborators
pub struct InterfaceSettings {
    /// Our own overlay address and network
    pub vpn_net: Ipv4Net,
    pub roaming_suppress: Duration,
    pub recv_error: RecvErrorPolicy,
}

/// The inbound side of one overlay interface
///
/// Aggregates the injected collaborators; owns no sockets itself. All
/// methods are `&self` so one `Arc<Interface>` serves every worker.
pub struct Interface {
    pub hostmap: Arc<HostMap>,
    /// Sessions mid-handshake, owned by the handshake manager
    pub pending: Arc<HostMap>,
    pub firewall: Firewall,
    pub connmgr: Arc<ConnectionManager>,
    pub lighthouse: Arc<Box<dyn Lighthouse>>,
    pub handshaker: Arc<Box<dyn HandshakeHandler>>,
    pub relays: Arc<Box<dyn RelayManager>>,
    pub inside: Arc<Box<dyn InsideWriter>>,
    pub outside: Arc<Box<dyn OutsideWriter>>,
    pub vpn_ip: Ipv4Addr,
    pub vpn_net: Ipv4Net,
    pub roaming_suppress: Duration,
    pub recv_error_gate: RecvErrorGate,
    pub stats: InboundStats,
}

impl Interface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: InterfaceSettings,
        hostmap: Arc<HostMap>,
        pending: Arc<HostMap>,
        firewall: Firewall,
        connmgr: Arc<ConnectionManager>,
        lighthouse: Arc<Box<dyn Lighthouse>>,
        handshaker: Arc<Box<dyn HandshakeHandler>>,
        relays: Arc<Box<dyn RelayManager>>,
        inside: Arc<Box<dyn InsideWriter>>,
        outside: Arc<Box<dyn OutsideWriter>>,
    ) -> Interface {
        Interface {
            hostmap,
            pending,
            firewall,
            connmgr,
            lighthouse,
            handshaker,
            relays,
            inside,
            outside,
            vpn_ip: settings.vpn_net.addr(),
            vpn_net: settings.vpn_net,
            roaming_suppress: settings.roaming_suppress,
            recv_error_gate: RecvErrorGate::new(settings.recv_error),
            stats: InboundStats::default(),
        }
    }
}

/// One parallel inbound worker
///
/// Owns the reusable scratch buffers for its queue: `out` for plaintext,
/// `nb` for the AEAD nonce, and a conntrack cache reserved for this
/// worker. The buffers are re-sliced per packet, never reallocated, and no
/// reference to them escapes the dispatcher.
pub struct InboundWorker {
    iface: Arc<Interface>,
    rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
}

impl InboundWorker {
    pub fn new(iface: Arc<Interface>, rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>) -> Self {
        InboundWorker { iface, rx }
    }

    pub async fn run(self) {
        let InboundWorker { iface, mut rx } = self;
        let mut out: Vec<u8> = Vec::with_capacity(BUFFER_SIZE);
        let mut nb = [0u8; 12];
        let mut cache = ConntrackCache::default();

        while let Some((packet, addr)) = rx.recv().await {
            iface
                .handle_outside_packet(Some(addr), &packet, &mut out, &mut nb, &mut cache)
                .await;
        }
        tracing::debug!("inbound worker queue closed");
    }
}
