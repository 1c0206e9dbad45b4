//! Daemon wiring
//!
//! Builds an `Interface` from a config file, binds the UDP socket and the
//! TUN device, and fans inbound datagrams out to the worker pool. Sessions
//! here are statically keyed: the handshake state machine is a pluggable
//! collaborator and this daemon installs a stub that only logs.

pub mod config;
pub mod device;

use crate::codec::control::ControlMsg;
use crate::codec::header::{Header, MsgType, SUB_NONE};
use crate::connmgr::ConnectionManager;
use crate::crypto::new_cipher;
use crate::daemon::config::Config;
use crate::daemon::device::{Device, DeviceConfig};
use crate::firewall::Firewall;
use crate::firewall::packet::FirewallPacket;
use crate::hostmap::{HostInfo, HostMap};
use crate::inbound::{
    BUFFER_SIZE, HandshakeHandler, InboundWorker, Interface, InterfaceSettings, InsideWriter,
    OutsideWriter, RelayManager, ViaSender,
};
use crate::lighthouse::{RemoteAllowList, StaticLighthouse};
use crate::session::ConnectionState;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const CHANNEL_DEPTH: usize = 1024;

/// Handshake stub for statically keyed deployments
struct StaticHandshaker;

#[async_trait]
impl HandshakeHandler for StaticHandshaker {
    async fn handle(
        &self,
        addr: Option<SocketAddr>,
        _via: Option<&ViaSender>,
        _packet: &[u8],
        _header: &Header,
        _hostinfo: Option<Arc<HostInfo>>,
    ) {
        tracing::debug!("ignoring handshake from {:?}, sessions are static", addr);
    }
}

/// Relay manager stub; relays are provisioned out of band here
struct LoggingRelayManager;

#[async_trait]
impl RelayManager for LoggingRelayManager {
    async fn handle_control(&self, hostinfo: &Arc<HostInfo>, msg: ControlMsg) {
        tracing::info!("control message from {}: {}", hostinfo.vpn_ip, msg);
    }
}

/// Delivers decrypted payloads to the TUN device task
struct DeviceWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl InsideWriter for DeviceWriter {
    async fn write_packet(&self, packet: &[u8]) -> crate::Result<()> {
        self.tx.send(packet.to_vec()).await?;
        Ok(())
    }
}

/// Sends datagrams out the physical socket
struct SocketWriter {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl OutsideWriter for SocketWriter {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> crate::Result<()> {
        self.socket.send_to(data, addr).await?;
        Ok(())
    }
}

/// Builds the interface from config with the given writer seams
pub fn build_interface(
    cfg: &Config,
    inside: Arc<Box<dyn InsideWriter>>,
    outside: Arc<Box<dyn OutsideWriter>>,
) -> crate::Result<Arc<Interface>> {
    let hostmap = Arc::new(HostMap::new());
    for peer in &cfg.peers {
        let key_bytes = B64.decode(&peer.key)?;
        let key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("peer {} key must be 32 bytes", peer.vpn_ip))?;

        let ci = ConnectionState::new(
            new_cipher(cfg.interface.cipher, &key),
            new_cipher(cfg.interface.cipher, &key),
        );
        let hi = Arc::new(HostInfo::new(
            peer.vpn_ip,
            peer.local_index,
            peer.remote_index,
            Some(ci),
        ));
        if let Some(remote) = peer.remote {
            hi.set_remote(remote);
        }
        hostmap.add(hi);
    }

    let settings = InterfaceSettings {
        vpn_net: cfg.interface.vpn_addr,
        roaming_suppress: Duration::from_secs(cfg.interface.roaming_suppress_secs),
        recv_error: cfg.interface.recv_error,
    };
    let lighthouse = StaticLighthouse::new(RemoteAllowList::new(
        cfg.lighthouse.remote_allow.clone(),
    ));

    Ok(Arc::new(Interface::new(
        settings,
        hostmap,
        Arc::new(HostMap::new()),
        Firewall::new(cfg.firewall.inbound.clone(), cfg.firewall.reject),
        Arc::new(ConnectionManager::new()),
        Arc::new(Box::new(lighthouse)),
        Arc::new(Box::new(StaticHandshaker)),
        Arc::new(Box::new(LoggingRelayManager)),
        inside,
        outside,
    )))
}

fn worker_for(addr: SocketAddr, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

pub async fn run(cfg: Config) -> crate::Result<()> {
    let socket = Arc::new(UdpSocket::bind(&cfg.interface.listen_addr).await?);
    tracing::info!("overlay UDP listening on {}", socket.local_addr()?);

    // tun device task
    let (to_device_tx, to_device_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (from_device_tx, mut from_device_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let mut device = Device::new(
        DeviceConfig {
            ip: cfg.interface.vpn_addr.addr(),
            mask: cfg.interface.vpn_addr.netmask(),
            mtu: cfg.interface.mtu,
        },
        from_device_tx,
        to_device_rx,
    );
    tokio::spawn(async move {
        if let Err(e) = device.run().await {
            tracing::error!("device error: {}", e);
        }
    });

    let iface = build_interface(
        &cfg,
        Arc::new(Box::new(DeviceWriter { tx: to_device_tx })),
        Arc::new(Box::new(SocketWriter {
            socket: socket.clone(),
        })),
    )?;

    // inbound worker pool, one queue per worker
    let workers = cfg.interface.workers.max(1);
    let mut queues = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(InboundWorker::new(iface.clone(), rx).run());
        queues.push(tx);
    }

    // outbound: tun reads get encrypted to the owning peer
    let outbound_iface = iface.clone();
    tokio::spawn(async move {
        let mut nb = [0u8; 12];
        while let Some(packet) = from_device_rx.recv().await {
            let fp = match FirewallPacket::from_ipv4(&packet, false) {
                Ok(fp) => fp,
                Err(e) => {
                    tracing::debug!("dropping unroutable tun packet: {}", e);
                    continue;
                }
            };
            let Some(hi) = outbound_iface.hostmap.get_by_vpn_ip(fp.remote_ip) else {
                tracing::debug!("no tunnel to {}, dropping", fp.remote_ip);
                continue;
            };
            outbound_iface
                .send_to_peer(&hi, MsgType::Message, SUB_NONE, &packet, &mut nb)
                .await;
        }
    });

    // inbound: fan datagrams out to the worker the source address hashes to
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        let q = worker_for(addr, workers);
        if queues[q].send((buf[..len].to_vec(), addr)).await.is_err() {
            return Err("inbound worker queue closed".into());
        }
    }
}
