//! Stateful firewall
//!
//! The firewall decides whether a decrypted inner packet may reach the TUN
//! device. Each worker owns a `ConntrackCache` of recently admitted tuples
//! so steady-state flows skip the rule scan; the rule set itself is
//! immutable after startup.

pub mod packet;

use crate::firewall::packet::FirewallPacket;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What to do with an inbound packet no rule admits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectPolicy {
    /// Drop silently (default)
    Never,
    /// Send an ICMP port-unreachable back through the tunnel
    Icmp,
}

impl Default for RejectPolicy {
    fn default() -> Self {
        RejectPolicy::Never
    }
}

/// One inbound admission rule
///
/// Unset fields match anything. `port_start`/`port_end` bound the local
/// (service) port; both zero means any port. A packet with zero ports
/// (ICMP, non-first fragment) always passes the port bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(default)]
    pub proto: Option<u8>,
    #[serde(default)]
    pub port_start: u16,
    #[serde(default)]
    pub port_end: u16,
    #[serde(default)]
    pub cidr: Option<Ipv4Net>,
}

impl FirewallRule {
    /// Rule that admits everything
    pub fn any() -> Self {
        FirewallRule {
            proto: None,
            port_start: 0,
            port_end: 0,
            cidr: None,
        }
    }

    fn matches(&self, fp: &FirewallPacket) -> bool {
        if let Some(proto) = self.proto {
            if proto != fp.protocol {
                return false;
            }
        }
        if self.port_start != 0 || self.port_end != 0 {
            // zero ports are wildcards (icmp / non-first fragments)
            if fp.local_port != 0
                && (fp.local_port < self.port_start || fp.local_port > self.port_end)
            {
                return false;
            }
        }
        if let Some(cidr) = &self.cidr {
            if !cidr.contains(&fp.remote_ip) {
                return false;
            }
        }
        true
    }
}

/// Per-worker cache of recently admitted flows
///
/// Never shared across workers; a hit skips the rule scan entirely. The
/// cache is an admission cache, not full connection tracking: entries age
/// out after `ttl` without traffic.
pub struct ConntrackCache {
    entries: HashMap<FirewallPacket, Instant>,
    ttl: Duration,
}

impl ConntrackCache {
    pub fn new(ttl: Duration) -> Self {
        ConntrackCache {
            entries: HashMap::new(),
            ttl,
        }
    }

    fn hit(&mut self, fp: &FirewallPacket) -> bool {
        match self.entries.get_mut(fp) {
            Some(seen) if seen.elapsed() < self.ttl => {
                *seen = Instant::now();
                true
            }
            Some(_) => {
                self.entries.remove(fp);
                false
            }
            None => false,
        }
    }

    fn admit(&mut self, fp: FirewallPacket) {
        self.entries.insert(fp, Instant::now());
    }
}

impl Default for ConntrackCache {
    fn default() -> Self {
        ConntrackCache::new(Duration::from_secs(60))
    }
}

/// Inbound decision oracle
pub struct Firewall {
    inbound: Vec<FirewallRule>,
    pub reject: RejectPolicy,
}

impl Firewall {
    pub fn new(inbound: Vec<FirewallRule>, reject: RejectPolicy) -> Self {
        Firewall { inbound, reject }
    }

    /// Returns true when the packet must be dropped
    pub fn drop_incoming(&self, fp: &FirewallPacket, cache: &mut ConntrackCache) -> bool {
        if cache.hit(fp) {
            return false;
        }
        for rule in &self.inbound {
            if rule.matches(fp) {
                cache.admit(*fp);
                return false;
            }
        }
        true
    }
}
