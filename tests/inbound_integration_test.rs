/// Integration tests for the inbound packet pipeline
///
/// Drives complete datagrams through the top-level dispatcher with mock
/// TUN/UDP writers and inspects what came out the other side:
/// 1. Normal delivery to the TUN device
/// 2. Replay and out-of-window drops
/// 3. AEAD failures (no recv-error amplification)
/// 4. Unknown-index recv-error replies
/// 5. Relay termination and forwarding
/// 6. Roaming allow list and suppression
/// 7. Recv-error threshold and spoof guards

use async_trait::async_trait;
use meshtun::codec::control::{ControlKind, ControlMsg};
use meshtun::codec::header::{
    HEADER_LEN, Header, MsgType, SUB_NONE, SUB_RELAY, TAG_LEN, TEST_REPLY, TEST_REQUEST,
};
use meshtun::connmgr::ConnectionManager;
use meshtun::crypto::{CipherKind, SessionCipher, new_cipher};
use meshtun::firewall::packet::{PROTO_UDP, build_ipv4};
use meshtun::firewall::{ConntrackCache, Firewall, FirewallRule, RejectPolicy};
use meshtun::hostmap::{HostInfo, HostMap, Relay, RelayStatus, RelayType};
use meshtun::inbound::{
    HandshakeHandler, Interface, InterfaceSettings, InsideWriter, OutsideWriter, RecvErrorPolicy,
    RelayManager, ViaSender,
};
use meshtun::lighthouse::{AllowEntry, Lighthouse, RemoteAllowList};
use meshtun::session::ConnectionState;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockTun {
    packets: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl InsideWriter for MockTun {
    async fn write_packet(&self, packet: &[u8]) -> meshtun::Result<()> {
        self.packets.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

struct MockOutside {
    sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
}

#[async_trait]
impl OutsideWriter for MockOutside {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> meshtun::Result<()> {
        self.sent.lock().unwrap().push((data.to_vec(), addr));
        Ok(())
    }
}

struct MockHandshaker {
    seen: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl HandshakeHandler for MockHandshaker {
    async fn handle(
        &self,
        _addr: Option<SocketAddr>,
        _via: Option<&ViaSender>,
        packet: &[u8],
        _header: &Header,
        _hostinfo: Option<Arc<HostInfo>>,
    ) {
        self.seen.lock().unwrap().push(packet.len());
    }
}

struct MockRelayMgr {
    msgs: Arc<Mutex<Vec<ControlMsg>>>,
}

#[async_trait]
impl RelayManager for MockRelayMgr {
    async fn handle_control(&self, _hostinfo: &Arc<HostInfo>, msg: ControlMsg) {
        self.msgs.lock().unwrap().push(msg);
    }
}

struct MockLighthouse {
    allow: RemoteAllowList,
    requests: Arc<Mutex<Vec<(Ipv4Addr, Vec<u8>)>>>,
    purged: Arc<Mutex<Vec<Ipv4Addr>>>,
}

#[async_trait]
impl Lighthouse for MockLighthouse {
    fn remote_allowed(&self, vpn_ip: Ipv4Addr, remote: IpAddr) -> bool {
        self.allow.allow(vpn_ip, remote)
    }

    async fn handle_request(&self, _addr: Option<SocketAddr>, vpn_ip: Ipv4Addr, payload: &[u8]) {
        self.requests.lock().unwrap().push((vpn_ip, payload.to_vec()));
    }

    fn purge(&self, vpn_ip: Ipv4Addr) {
        self.purged.lock().unwrap().push(vpn_ip);
    }
}

struct Harness {
    iface: Arc<Interface>,
    tun: Arc<Mutex<Vec<Vec<u8>>>>,
    udp: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
    handshakes: Arc<Mutex<Vec<usize>>>,
    control: Arc<Mutex<Vec<ControlMsg>>>,
    lh_requests: Arc<Mutex<Vec<(Ipv4Addr, Vec<u8>)>>>,
    lh_purged: Arc<Mutex<Vec<Ipv4Addr>>>,
}

fn harness_with(recv_error: RecvErrorPolicy, allow: Vec<AllowEntry>) -> Harness {
    let tun = Arc::new(Mutex::new(Vec::new()));
    let udp = Arc::new(Mutex::new(Vec::new()));
    let handshakes = Arc::new(Mutex::new(Vec::new()));
    let control = Arc::new(Mutex::new(Vec::new()));
    let lh_requests = Arc::new(Mutex::new(Vec::new()));
    let lh_purged = Arc::new(Mutex::new(Vec::new()));

    let iface = Arc::new(Interface::new(
        InterfaceSettings {
            vpn_net: "10.0.0.1/24".parse().unwrap(),
            roaming_suppress: Duration::from_secs(2),
            recv_error,
        },
        Arc::new(HostMap::new()),
        Arc::new(HostMap::new()),
        Firewall::new(vec![FirewallRule::any()], RejectPolicy::Never),
        Arc::new(ConnectionManager::new()),
        Arc::new(Box::new(MockLighthouse {
            allow: RemoteAllowList::new(allow),
            requests: lh_requests.clone(),
            purged: lh_purged.clone(),
        })),
        Arc::new(Box::new(MockHandshaker {
            seen: handshakes.clone(),
        })),
        Arc::new(Box::new(MockRelayMgr {
            msgs: control.clone(),
        })),
        Arc::new(Box::new(MockTun {
            packets: tun.clone(),
        })),
        Arc::new(Box::new(MockOutside { sent: udp.clone() })),
    ));

    Harness {
        iface,
        tun,
        udp,
        handshakes,
        control,
        lh_requests,
        lh_purged,
    }
}

fn harness() -> Harness {
    harness_with(RecvErrorPolicy::Always, Vec::new())
}

const KEY_A: [u8; 32] = [1u8; 32];
const KEY_B: [u8; 32] = [2u8; 32];

/// Registers an established peer session keyed both ways with `key`
fn add_peer(
    h: &Harness,
    vpn_ip: Ipv4Addr,
    local_index: u32,
    remote_index: u32,
    key: &[u8; 32],
) -> Arc<HostInfo> {
    let ci = ConnectionState::new(
        new_cipher(CipherKind::Aes256, key),
        new_cipher(CipherKind::Aes256, key),
    );
    let hi = Arc::new(HostInfo::new(vpn_ip, local_index, remote_index, Some(ci)));
    h.iface.hostmap.add(hi.clone());
    hi
}

/// Seals a standard encrypted datagram the way a sending peer would
fn seal_message(
    key: &[u8; 32],
    typ: MsgType,
    subtype: u8,
    idx: u32,
    counter: u64,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = new_cipher(CipherKind::Aes256, key);
    let mut nb = [0u8; 12];
    let mut buf = Vec::new();
    Header::new(typ, subtype, idx, counter).encode_into(&mut buf);
    cipher.seal(&mut buf, payload, counter, &mut nb).unwrap();
    buf
}

/// Seals a relay wrapper: header, the wrapped bytes, and a bare tag over
/// everything before it
fn seal_relay(key: &[u8; 32], outer_idx: u32, counter: u64, inner: &[u8]) -> Vec<u8> {
    let cipher = new_cipher(CipherKind::Aes256, key);
    let mut nb = [0u8; 12];
    let mut buf = Vec::new();
    Header::new(MsgType::Message, SUB_RELAY, outer_idx, counter).encode_into(&mut buf);
    buf.extend_from_slice(inner);
    cipher.seal(&mut buf, b"", counter, &mut nb).unwrap();
    buf
}

fn udp_ipv4(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16) -> Vec<u8> {
    let mut transport = Vec::new();
    transport.extend_from_slice(&sport.to_be_bytes());
    transport.extend_from_slice(&dport.to_be_bytes());
    transport.extend_from_slice(&[0, 16, 0, 0]);
    transport.extend_from_slice(b"test-payload");
    build_ipv4(src, dst, PROTO_UDP, &transport)
}

async fn dispatch(h: &Harness, addr: Option<SocketAddr>, packet: &[u8]) {
    let mut out = Vec::new();
    let mut nb = [0u8; 12];
    let mut cache = ConntrackCache::default();
    h.iface
        .handle_outside_packet(addr, packet, &mut out, &mut nb, &mut cache)
        .await;
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_normal_delivery() {
    let h = harness();
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);
    let from = addr("192.0.2.7:4242");
    dispatch(&h, Some(from), &packet).await;

    let tun = h.tun.lock().unwrap();
    assert_eq!(tun.len(), 1, "expected exactly one tun write");
    assert_eq!(tun[0], inner);

    // the counter is committed and the session is marked live
    assert!(!hi.connection_state.as_ref().unwrap().window.check(1));
    assert!(h.iface.connmgr.saw_in(42));
    // first authenticated packet also set the remote endpoint
    assert_eq!(hi.remote(), Some(from));
}

#[tokio::test]
async fn test_replay_dropped() {
    let h = harness_with(RecvErrorPolicy::Never, Vec::new());
    add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);
    let from = addr("192.0.2.7:4242");

    dispatch(&h, Some(from), &packet).await;
    dispatch(&h, Some(from), &packet).await;

    assert_eq!(h.tun.lock().unwrap().len(), 1, "replay must not reach the tun");
}

#[tokio::test]
async fn test_tampered_header_fails_aead_without_recv_error() {
    let h = harness();
    add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let mut packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);
    // the subtype byte is part of the associated data
    packet[1] = 7;
    dispatch(&h, Some(addr("192.0.2.7:4242")), &packet).await;

    assert!(h.tun.lock().unwrap().is_empty());
    // an authentication failure must never answer with a recv-error
    assert!(h.udp.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_tampered_ciphertext_and_tag() {
    let h = harness_with(RecvErrorPolicy::Never, Vec::new());
    add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let clean = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);

    let mut flipped_ct = clean.clone();
    flipped_ct[HEADER_LEN] ^= 0x80;
    dispatch(&h, Some(addr("192.0.2.7:4242")), &flipped_ct).await;

    let mut flipped_tag = clean.clone();
    let last = flipped_tag.len() - 1;
    flipped_tag[last] ^= 1;
    dispatch(&h, Some(addr("192.0.2.7:4242")), &flipped_tag).await;

    assert!(h.tun.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_index_sends_recv_error() {
    let h = harness();

    let packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 7777, 1, b"whatever");
    let from = addr("192.0.2.7:4242");
    dispatch(&h, Some(from), &packet).await;

    assert!(h.tun.lock().unwrap().is_empty());
    let udp = h.udp.lock().unwrap();
    assert_eq!(udp.len(), 1, "expected a recv-error tombstone");
    let (data, to) = &udp[0];
    assert_eq!(*to, from);
    assert_eq!(data.len(), HEADER_LEN, "recv-error is header only");
    let reply = Header::parse(data).unwrap();
    assert_eq!(reply.typ, MsgType::RecvError);
    assert_eq!(reply.remote_index, 7777);
}

#[tokio::test]
async fn test_recv_error_rate_limited_per_ip() {
    let h = harness();
    let from = addr("192.0.2.7:4242");
    for counter in 1..=5u64 {
        let packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 7777, counter, b"x");
        dispatch(&h, Some(from), &packet).await;
    }
    // one per ip per interval, not one per packet
    assert_eq!(h.udp.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_anti_loop_drop() {
    let h = harness();
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);

    // source claims to be inside our own overlay network
    dispatch(&h, Some(addr("10.0.0.5:4242")), &packet).await;
    assert!(h.tun.lock().unwrap().is_empty());
    // dropped before any session work: the counter is still fresh
    assert!(hi.connection_state.as_ref().unwrap().window.check(1));

    // the same datagram from a physical address is fine
    dispatch(&h, Some(addr("192.0.2.7:4242")), &packet).await;
    assert_eq!(h.tun.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_hole_punch_and_garbage_silent() {
    let h = harness();
    dispatch(&h, Some(addr("192.0.2.7:4242")), &[]).await;
    dispatch(&h, Some(addr("192.0.2.7:4242")), &[0]).await;
    dispatch(&h, Some(addr("192.0.2.7:4242")), &[1, 2, 3, 4, 5]).await;
    assert!(h.tun.lock().unwrap().is_empty());
    assert!(h.udp.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_firewall_drop() {
    let h = harness();
    // replace the permissive rule set with a closed one
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);
    let closed = Harness {
        iface: Arc::new(Interface::new(
            InterfaceSettings {
                vpn_net: "10.0.0.1/24".parse().unwrap(),
                roaming_suppress: Duration::from_secs(2),
                recv_error: RecvErrorPolicy::Never,
            },
            h.iface.hostmap.clone(),
            Arc::new(HostMap::new()),
            Firewall::new(vec![], RejectPolicy::Never),
            h.iface.connmgr.clone(),
            h.iface.lighthouse.clone(),
            h.iface.handshaker.clone(),
            h.iface.relays.clone(),
            h.iface.inside.clone(),
            h.iface.outside.clone(),
        )),
        tun: h.tun.clone(),
        udp: h.udp.clone(),
        handshakes: h.handshakes.clone(),
        control: h.control.clone(),
        lh_requests: h.lh_requests.clone(),
        lh_purged: h.lh_purged.clone(),
    };

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);
    dispatch(&closed, Some(addr("192.0.2.7:4242")), &packet).await;

    assert!(closed.tun.lock().unwrap().is_empty());
    // authenticated but firewalled: the counter is burned anyway
    assert!(!hi.connection_state.as_ref().unwrap().window.check(1));
}

#[tokio::test]
async fn test_relay_terminal_single_inner_dispatch() {
    let h = harness();

    // the relay leg session with peer A; outer index 500 terminates here
    let relay_leg = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 100, 101, &KEY_A);
    relay_leg.add_relay(Relay {
        kind: RelayType::Terminal,
        state: RelayStatus::Established,
        peer_ip: Ipv4Addr::new(10, 0, 0, 2),
        local_index: 500,
        remote_index: 600,
    });
    h.iface.hostmap.add_relay_index(500, relay_leg.clone());

    // the end-to-end session whose traffic rides the relay
    let e2e = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_B);

    let payload = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let inner = seal_message(&KEY_B, MsgType::Message, SUB_NONE, 42, 1, &payload);
    let outer = seal_relay(&KEY_A, 500, 1, &inner);

    let from = addr("192.0.2.7:4242");
    dispatch(&h, Some(from), &outer).await;

    let tun = h.tun.lock().unwrap();
    assert_eq!(tun.len(), 1, "exactly one inner dispatch lands on the tun");
    assert_eq!(tun[0], payload);

    // the relay peer authenticated the wrapper: it roams and is marked
    assert_eq!(relay_leg.remote(), Some(from));
    assert!(h.iface.connmgr.saw_in(100));
    // the inner dispatch ran with no address: the end-to-end session is
    // marked but must not roam onto the relay's endpoint
    assert!(h.iface.connmgr.saw_in(42));
    assert_eq!(e2e.remote(), None);
}

#[tokio::test]
async fn test_relay_forwarding() {
    let h = harness();

    // origin leg: A relays through us toward B
    let origin = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 100, 101, &KEY_A);
    origin.add_relay(Relay {
        kind: RelayType::Forwarding,
        state: RelayStatus::Established,
        peer_ip: Ipv4Addr::new(10, 0, 0, 3),
        local_index: 500,
        remote_index: 501,
    });
    h.iface.hostmap.add_relay_index(500, origin.clone());

    // target leg: B's reverse entry is keyed by the originator's address
    let target = add_peer(&h, Ipv4Addr::new(10, 0, 0, 3), 200, 201, &KEY_B);
    let target_remote = addr("198.51.100.9:4242");
    target.set_remote(target_remote);
    target.add_relay(Relay {
        kind: RelayType::Forwarding,
        state: RelayStatus::Established,
        peer_ip: Ipv4Addr::new(10, 0, 0, 2),
        local_index: 502,
        remote_index: 600,
    });

    let wrapped = b"opaque end-to-end bytes the middle hop cannot read";
    let outer = seal_relay(&KEY_A, 500, 1, wrapped);
    dispatch(&h, Some(addr("192.0.2.7:4242")), &outer).await;

    assert!(h.tun.lock().unwrap().is_empty());
    let udp = h.udp.lock().unwrap();
    assert_eq!(udp.len(), 1, "expected one forwarded datagram");
    let (data, to) = &udp[0];
    assert_eq!(*to, target_remote);

    let fwd = Header::parse(data).unwrap();
    assert_eq!(fwd.typ, MsgType::Message);
    assert_eq!(fwd.subtype, SUB_RELAY);
    assert_eq!(fwd.remote_index, 600, "rewrapped for the target leg");

    // the wrapped bytes ride through untouched, re-signed on the new leg
    assert_eq!(&data[HEADER_LEN..data.len() - TAG_LEN], wrapped);
    let cipher = new_cipher(CipherKind::Aes256, &KEY_B);
    let mut out = Vec::new();
    let mut nb = [0u8; 12];
    let split = data.len() - TAG_LEN;
    cipher
        .open(&mut out, &data[..split], &data[split..], fwd.counter, &mut nb)
        .unwrap();
}

#[tokio::test]
async fn test_relay_forwarding_terminal_target_drops() {
    let h = harness();

    let origin = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 100, 101, &KEY_A);
    origin.add_relay(Relay {
        kind: RelayType::Forwarding,
        state: RelayStatus::Established,
        peer_ip: Ipv4Addr::new(10, 0, 0, 3),
        local_index: 500,
        remote_index: 501,
    });
    h.iface.hostmap.add_relay_index(500, origin.clone());

    let target = add_peer(&h, Ipv4Addr::new(10, 0, 0, 3), 200, 201, &KEY_B);
    target.set_remote(addr("198.51.100.9:4242"));
    target.add_relay(Relay {
        kind: RelayType::Terminal,
        state: RelayStatus::Established,
        peer_ip: Ipv4Addr::new(10, 0, 0, 2),
        local_index: 502,
        remote_index: 600,
    });

    let outer = seal_relay(&KEY_A, 500, 1, b"wrapped");
    dispatch(&h, Some(addr("192.0.2.7:4242")), &outer).await;
    assert!(h.udp.lock().unwrap().is_empty(), "terminal target side drops");
}

#[tokio::test]
async fn test_relay_not_established_drops() {
    let h = harness();

    let origin = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 100, 101, &KEY_A);
    origin.add_relay(Relay {
        kind: RelayType::Forwarding,
        state: RelayStatus::Established,
        peer_ip: Ipv4Addr::new(10, 0, 0, 3),
        local_index: 500,
        remote_index: 501,
    });
    h.iface.hostmap.add_relay_index(500, origin.clone());

    let target = add_peer(&h, Ipv4Addr::new(10, 0, 0, 3), 200, 201, &KEY_B);
    target.set_remote(addr("198.51.100.9:4242"));
    target.add_relay(Relay {
        kind: RelayType::Forwarding,
        state: RelayStatus::Requested,
        peer_ip: Ipv4Addr::new(10, 0, 0, 2),
        local_index: 502,
        remote_index: 600,
    });

    let outer = seal_relay(&KEY_A, 500, 1, b"wrapped");
    dispatch(&h, Some(addr("192.0.2.7:4242")), &outer).await;
    assert!(h.udp.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_roaming_and_suppression() {
    let h = harness_with(RecvErrorPolicy::Never, Vec::new());
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);
    let x = addr("192.0.2.7:4242");
    let y = addr("203.0.113.5:4242");
    hi.set_remote(x);

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );

    // peer shows up from a new endpoint: roam is accepted
    let p1 = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);
    dispatch(&h, Some(y), &p1).await;
    assert_eq!(hi.remote(), Some(y));

    // bouncing straight back inside the suppression window is refused
    let p2 = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 2, &inner);
    dispatch(&h, Some(x), &p2).await;
    assert_eq!(hi.remote(), Some(y), "bounce back to {} must be suppressed", x);

    // a third endpoint is not the suppressed one and roams fine
    let z = addr("198.51.100.77:4242");
    let p3 = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 3, &inner);
    dispatch(&h, Some(z), &p3).await;
    assert_eq!(hi.remote(), Some(z));
}

#[tokio::test]
async fn test_roaming_allow_list() {
    let deny = AllowEntry {
        vpn_ip: None,
        remote: "203.0.113.0/24".parse().unwrap(),
        allow: false,
    };
    let h = harness_with(RecvErrorPolicy::Never, vec![deny]);
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);
    let x = addr("192.0.2.7:4242");
    hi.set_remote(x);

    let inner = udp_ipv4(
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 1),
        5000,
        53,
    );
    let packet = seal_message(&KEY_A, MsgType::Message, SUB_NONE, 42, 1, &inner);
    dispatch(&h, Some(addr("203.0.113.5:4242")), &packet).await;

    // delivery is unaffected, only the roam is declined
    assert_eq!(h.tun.lock().unwrap().len(), 1);
    assert_eq!(hi.remote(), Some(x));
}

#[tokio::test]
async fn test_recv_error_threshold_and_spoof_guard() {
    let h = harness();
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);
    let real = addr("192.0.2.7:4242");
    let spoof = addr("203.0.113.66:4242");
    hi.set_remote(real);

    let tombstone = Header::new(MsgType::RecvError, 0, 42, 0).encode();

    // below the threshold nothing happens, however legitimate the source
    for _ in 0..3 {
        dispatch(&h, Some(real), &tombstone).await;
        assert!(h.iface.hostmap.get_by_index(42).is_some());
    }

    // past the threshold, a mismatched source address is still refused
    dispatch(&h, Some(spoof), &tombstone).await;
    assert!(h.iface.hostmap.get_by_index(42).is_some(), "spoofed teardown");

    // the real endpoint finally tears it down
    dispatch(&h, Some(real), &tombstone).await;
    assert!(h.iface.hostmap.get_by_index(42).is_none());
    // last tunnel for that address: discovery state went too
    assert_eq!(
        h.lh_purged.lock().unwrap().clone(),
        vec![Ipv4Addr::new(10, 0, 0, 2)]
    );
}

#[tokio::test]
async fn test_recv_error_via_relay_refused() {
    let h = harness();

    // a peer with a legitimate terminal relay entry for itself
    let relay_leg = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 100, 101, &KEY_A);
    relay_leg.add_relay(Relay {
        kind: RelayType::Terminal,
        state: RelayStatus::Established,
        peer_ip: Ipv4Addr::new(10, 0, 0, 2),
        local_index: 500,
        remote_index: 600,
    });
    h.iface.hostmap.add_relay_index(500, relay_leg.clone());

    // an unrelated tunnel the relay peer has no business touching
    let victim = add_peer(&h, Ipv4Addr::new(10, 0, 0, 9), 42, 99, &KEY_B);
    victim.set_remote(addr("198.51.100.9:4242"));

    // the wrapped bytes are attacker-chosen: a forged tombstone naming the
    // victim's index, delivered well past the teardown threshold
    let forged = Header::new(MsgType::RecvError, 0, 42, 0).encode();
    for counter in 1..=5u64 {
        let outer = seal_relay(&KEY_A, 500, counter, &forged);
        dispatch(&h, Some(addr("192.0.2.7:4242")), &outer).await;
    }

    // refused before the counter even moves: no physical sender to hold
    // the endpoint match against
    assert!(h.iface.hostmap.get_by_index(42).is_some());
    assert_eq!(victim.lock().recv_error_seen, 0);
}

#[tokio::test]
async fn test_close_tunnel_message() {
    let h = harness();
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let from = addr("192.0.2.7:4242");
    let packet = seal_message(&KEY_A, MsgType::CloseTunnel, 0, 42, 1, b"");
    dispatch(&h, Some(from), &packet).await;

    assert!(h.iface.hostmap.get_by_index(42).is_none());
    // teardown is silent: no reply datagram
    assert!(h.udp.lock().unwrap().is_empty());
    // the datagram authenticated, so the shared tail roamed the peer
    // before the teardown
    assert_eq!(hi.remote(), Some(from));
}

#[tokio::test]
async fn test_test_request_echoes_reply() {
    let h = harness();
    let hi = add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);
    let from = addr("192.0.2.7:4242");
    hi.set_remote(from);

    let packet = seal_message(&KEY_A, MsgType::Test, TEST_REQUEST, 42, 1, b"ping");
    dispatch(&h, Some(from), &packet).await;

    let udp = h.udp.lock().unwrap();
    assert_eq!(udp.len(), 1);
    let (data, to) = &udp[0];
    assert_eq!(*to, from);

    let reply = Header::parse(data).unwrap();
    assert_eq!(reply.typ, MsgType::Test);
    assert_eq!(reply.subtype, TEST_REPLY);
    assert_eq!(reply.remote_index, 99, "reply carries the peer's index");

    let cipher = new_cipher(CipherKind::Aes256, &KEY_A);
    let mut out = Vec::new();
    let mut nb = [0u8; 12];
    cipher
        .open(
            &mut out,
            &data[..HEADER_LEN],
            &data[HEADER_LEN..],
            reply.counter,
            &mut nb,
        )
        .unwrap();
    assert_eq!(out, b"ping");
}

#[tokio::test]
async fn test_lighthouse_payload_reaches_handler() {
    let h = harness();
    add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let packet = seal_message(&KEY_A, MsgType::LightHouse, 0, 42, 1, b"whois 10.0.0.3");
    dispatch(&h, Some(addr("192.0.2.7:4242")), &packet).await;

    let requests = h.lh_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(requests[0].1, b"whois 10.0.0.3");
}

#[tokio::test]
async fn test_control_message_reaches_relay_manager() {
    let h = harness();
    add_peer(&h, Ipv4Addr::new(10, 0, 0, 2), 42, 99, &KEY_A);

    let msg = ControlMsg {
        kind: ControlKind::CreateRelayRequest,
        initiator_idx: 500,
        responder_idx: 0,
        relay_from_ip: Ipv4Addr::new(10, 0, 0, 2),
        relay_to_ip: Ipv4Addr::new(10, 0, 0, 3),
    };
    let packet = seal_message(
        &KEY_A,
        MsgType::Control,
        0,
        42,
        1,
        &msg.marshal().unwrap(),
    );
    dispatch(&h, Some(addr("192.0.2.7:4242")), &packet).await;

    let control = h.control.lock().unwrap();
    assert_eq!(control.len(), 1);
    assert_eq!(control[0].kind, ControlKind::CreateRelayRequest);
    assert_eq!(control[0].initiator_idx, 500);
}

#[tokio::test]
async fn test_handshake_delegated_raw() {
    let h = harness();
    let mut packet = Header::new(MsgType::Handshake, 0, 0, 1).encode().to_vec();
    packet.extend_from_slice(b"noise handshake payload");
    dispatch(&h, Some(addr("192.0.2.7:4242")), &packet).await;

    let seen = h.handshakes.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], packet.len(), "handshake gets the raw datagram");
}
