//! Overlay header codec
//!
//! Every datagram on the overlay transport starts with a fixed 16-byte
//! header. All multi-byte fields are big-endian.
//!
//! # Header Format (16 bytes)
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |Ver|Type|Subtype |    Reserved     |        Remote Index (4B)          |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                       Message Counter (8 bytes)                       |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! - Ver: 0x1 (high nibble of byte 0) - Overlay protocol version
//! - Type: low nibble of byte 0 - Message type identifier
//! - Subtype: message-type specific discriminator (1 byte)
//! - Reserved: 2 bytes, zero on the wire
//! - Remote Index: receiver's 32-bit session handle
//! - Message Counter: sender's monotonic 64-bit AEAD counter

use crate::codec::errors::CodecError;
use std::fmt::Display;

/// Overlay protocol version
pub const VERSION: u8 = 1;

/// Overlay header length in bytes
pub const HEADER_LEN: usize = 16;

/// AEAD authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Message type identifiers
///
/// Each type selects a branch of the inbound dispatcher:
/// - Handshake: session establishment, handled before any keys exist
/// - Message: encrypted payload for the TUN device (or a relayed datagram)
/// - RecvError: advisory tombstone for a session the sender cannot decrypt
/// - LightHouse: discovery request/reply payload
/// - Test: liveness probe
/// - CloseTunnel: authenticated teardown notification
/// - Control: relay control messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Handshake = 0,
    Message = 1,
    RecvError = 2,
    LightHouse = 3,
    Test = 4,
    CloseTunnel = 5,
    Control = 6,
}

impl TryFrom<u8> for MsgType {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MsgType::Handshake),
            1 => Ok(MsgType::Message),
            2 => Ok(MsgType::RecvError),
            3 => Ok(MsgType::LightHouse),
            4 => Ok(MsgType::Test),
            5 => Ok(MsgType::CloseTunnel),
            6 => Ok(MsgType::Control),
            _ => Err(CodecError::UnknownType(v)),
        }
    }
}

/// Subtype for `Message`: plain payload or relayed datagram
pub const SUB_NONE: u8 = 0;
pub const SUB_RELAY: u8 = 1;

/// Subtypes for `Test`
pub const TEST_REQUEST: u8 = 1;
pub const TEST_REPLY: u8 = 2;

/// Parsed overlay header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub typ: MsgType,
    pub subtype: u8,
    pub remote_index: u32,
    pub counter: u64,
}

impl Header {
    pub fn new(typ: MsgType, subtype: u8, remote_index: u32, counter: u64) -> Self {
        Header {
            version: VERSION,
            typ,
            subtype,
            remote_index,
            counter,
        }
    }

    /// Parses exactly the first 16 bytes of a datagram
    ///
    /// # Returns
    /// * `Ok(Header)` if the buffer holds a complete, valid header
    /// * `Err(CodecError)` on short input, version or type mismatch
    pub fn parse(buf: &[u8]) -> Result<Header, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::MalformedHeader);
        }

        let version = buf[0] >> 4;
        if version != VERSION {
            return Err(CodecError::BadVersion(version));
        }

        Ok(Header {
            version,
            typ: MsgType::try_from(buf[0] & 0x0F)?,
            subtype: buf[1],
            remote_index: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            counter: u64::from_be_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = (self.version << 4) | (self.typ as u8);
        buf[1] = self.subtype;
        buf[4..8].copy_from_slice(&self.remote_index.to_be_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_be_bytes());
        buf
    }

    /// Appends the encoded header to an existing buffer
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.encode());
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}/{} idx={} ctr={}",
            self.typ, self.subtype, self.remote_index, self.counter
        )
    }
}
