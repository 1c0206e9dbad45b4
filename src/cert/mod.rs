//! Peer certificates
//!
//! Certificates bind a peer's name, overlay address, and static key under
//! a CA signature. On the wire a peer sends its certificate with the
//! public key field omitted; the receiver recombines the certificate with
//! the static key taken from the handshake itself, so the validated
//! signature always covers the key that is actually in use.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::net::Ipv4Addr;

/// Certificate validation errors
#[derive(Debug, PartialEq, Eq)]
pub enum CertError {
    /// The handshake produced no peer static key
    MissingStaticKey,
    /// The transmitted certificate payload was empty
    EmptyPayload,
    /// The envelope failed to decode
    MalformedEnvelope,
    /// The envelope decoded but carries no details block
    MissingDetails,
    /// No CA in the pool matches the certificate's issuer
    UnknownIssuer,
    /// The CA signature does not cover these details
    BadSignature,
    Expired,
    NotYetValid,
    /// The issuing CA itself has expired
    CaExpired,
}

impl std::error::Error for CertError {}

impl Display for CertError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CertError::MissingStaticKey => "no peer static key in handshake".fmt(fmt),
            CertError::EmptyPayload => "empty certificate payload".fmt(fmt),
            CertError::MalformedEnvelope => "malformed certificate envelope".fmt(fmt),
            CertError::MissingDetails => "certificate has no details".fmt(fmt),
            CertError::UnknownIssuer => "unknown certificate issuer".fmt(fmt),
            CertError::BadSignature => "bad certificate signature".fmt(fmt),
            CertError::Expired => "certificate expired".fmt(fmt),
            CertError::NotYetValid => "certificate not yet valid".fmt(fmt),
            CertError::CaExpired => "issuing ca expired".fmt(fmt),
        }
    }
}

mod b64_bytes {
    use super::B64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        B64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// The signed portion of a certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertDetails {
    pub name: String,
    pub vpn_ip: Ipv4Addr,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Validity window, seconds since the epoch
    pub not_before: u64,
    pub not_after: u64,
    #[serde(with = "b64_bytes")]
    pub public_key: Vec<u8>,
    pub issuer: String,
}

/// Certificate envelope as transmitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub details: Option<CertDetails>,
    #[serde(with = "b64_bytes")]
    pub signature: Vec<u8>,
}

struct CaEntry {
    key: VerifyingKey,
    not_after: Option<u64>,
}

/// Trusted certificate authorities, keyed by issuer name
#[derive(Default)]
pub struct CaPool {
    cas: HashMap<String, CaEntry>,
}

impl CaPool {
    pub fn new() -> CaPool {
        CaPool::default()
    }

    pub fn add_ca(
        &mut self,
        name: &str,
        key: &[u8; 32],
        not_after: Option<u64>,
    ) -> crate::Result<()> {
        let key = VerifyingKey::from_bytes(key)?;
        self.cas.insert(name.to_string(), CaEntry { key, not_after });
        Ok(())
    }
}

/// Binds the handshake's peer static key into a transmitted certificate
/// and validates the result against the CA pool at `now`
///
/// The transmitted envelope omits the public key; after overwriting the
/// field the certificate is re-encoded and re-decoded so the validated
/// object is exactly the canonical form whose signature covers the
/// handshake-bound key.
pub fn recombine_and_validate(
    peer_static_key: Option<&[u8]>,
    raw_cert: &[u8],
    ca_pool: &CaPool,
    now: u64,
) -> Result<Certificate, CertError> {
    let key = peer_static_key.ok_or(CertError::MissingStaticKey)?;
    if raw_cert.is_empty() {
        return Err(CertError::EmptyPayload);
    }

    let mut cert: Certificate =
        serde_json::from_slice(raw_cert).map_err(|_| CertError::MalformedEnvelope)?;
    let details = cert.details.as_mut().ok_or(CertError::MissingDetails)?;
    details.public_key = key.to_vec();

    let canonical = serde_json::to_vec(&cert).map_err(|_| CertError::MalformedEnvelope)?;
    let cert: Certificate =
        serde_json::from_slice(&canonical).map_err(|_| CertError::MalformedEnvelope)?;

    validate(&cert, ca_pool, now)?;
    Ok(cert)
}

fn validate(cert: &Certificate, ca_pool: &CaPool, now: u64) -> Result<(), CertError> {
    let details = cert.details.as_ref().ok_or(CertError::MissingDetails)?;

    let ca = ca_pool
        .cas
        .get(&details.issuer)
        .ok_or(CertError::UnknownIssuer)?;
    if let Some(ca_not_after) = ca.not_after {
        if now > ca_not_after {
            return Err(CertError::CaExpired);
        }
    }

    if now < details.not_before {
        return Err(CertError::NotYetValid);
    }
    if now > details.not_after {
        return Err(CertError::Expired);
    }

    let signed = serde_json::to_vec(details).map_err(|_| CertError::MalformedEnvelope)?;
    let sig = Signature::from_slice(&cert.signature).map_err(|_| CertError::BadSignature)?;
    ca.key
        .verify(&signed, &sig)
        .map_err(|_| CertError::BadSignature)?;
    Ok(())
}
