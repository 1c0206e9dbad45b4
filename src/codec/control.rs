//! Relay control messages
//!
//! Control datagrams carry small JSON documents inside the encrypted
//! payload. They drive relay establishment between three parties: the
//! initiator, the relay, and the far peer.

use crate::codec::errors::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::Ipv4Addr;

/// Control message discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    CreateRelayRequest,
    CreateRelayResponse,
}

/// A relay control message
///
/// `initiator_idx`/`responder_idx` are the relay-leg session indices on
/// each side; `relay_from_ip`/`relay_to_ip` name the overlay endpoints the
/// relay connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMsg {
    pub kind: ControlKind,
    pub initiator_idx: u32,
    #[serde(default)]
    pub responder_idx: u32,
    pub relay_from_ip: Ipv4Addr,
    pub relay_to_ip: Ipv4Addr,
}

impl ControlMsg {
    pub fn marshal(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(buf: &[u8]) -> Result<ControlMsg, CodecError> {
        serde_json::from_slice(buf).map_err(|_| CodecError::MalformedControl)
    }
}

impl Display for ControlMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} -> {} (init {}, resp {})",
            self.kind, self.relay_from_ip, self.relay_to_ip, self.initiator_idx, self.responder_idx
        )
    }
}
