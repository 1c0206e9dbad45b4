use crate::crypto::CipherKind;
use crate::firewall::{FirewallRule, RejectPolicy};
use crate::inbound::RecvErrorPolicy;
use crate::lighthouse::AllowEntry;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
    #[serde(default)]
    pub lighthouse: LighthouseConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    // physical listen address, eg 0.0.0.0:4242
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    // our overlay address with prefix, eg 10.42.0.1/24
    pub vpn_addr: Ipv4Net,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    // parallel inbound workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_cipher")]
    pub cipher: CipherKind,

    // roam back to the previous endpoint is refused inside this window
    #[serde(default = "default_roaming_suppress_secs")]
    pub roaming_suppress_secs: u64,

    #[serde(default)]
    pub recv_error: RecvErrorPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub inbound: Vec<FirewallRule>,
    #[serde(default)]
    pub reject: RejectPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LighthouseConfig {
    #[serde(default)]
    pub remote_allow: Vec<AllowEntry>,
}

/// A peer with a statically provisioned session
///
/// The handshake state machine is pluggable; this daemon ships with
/// pre-established keys the way a test harness provisions them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub vpn_ip: Ipv4Addr,

    // 32-byte session key, base64
    pub key: String,

    pub local_index: u32,
    pub remote_index: u32,

    // last known physical endpoint, learned by roaming when absent
    #[serde(default)]
    pub remote: Option<SocketAddr>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:4242".to_string()
}

fn default_mtu() -> u16 {
    1300
}

fn default_workers() -> usize {
    4
}

fn default_cipher() -> CipherKind {
    CipherKind::Aes256
}

fn default_roaming_suppress_secs() -> u64 {
    2
}

pub fn load(path: &str) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}
