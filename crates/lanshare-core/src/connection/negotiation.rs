//! Negotiation payloads carried opaquely by the relay.
//!
//! Offers and answers carry a [`SessionDescription`]; the answer echoes the
//! offer's session id. Candidates are TCP addresses where the answering side
//! accepts the channel. All payloads are JSON.

use crate::error::ConnectionError;
use local_ip_address::list_afinet_netifas;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Offer or answer description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    /// Negotiation session identifier
    pub session_id: String,
    /// Display name of the sending device
    pub device_name: String,
}

/// Connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Session this candidate belongs to
    pub session_id: String,
    /// Address accepting the channel
    pub addr: SocketAddr,
}

/// Fresh random session id (32 hex chars)
#[must_use]
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Encode a payload
///
/// # Errors
///
/// Returns `NegotiationFailed` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ConnectionError> {
    serde_json::to_vec(value).map_err(|_| ConnectionError::negotiation("payload encoding failed"))
}

/// Decode a payload
///
/// # Errors
///
/// Returns `NegotiationFailed` if the payload is not valid JSON of type `T`.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ConnectionError> {
    serde_json::from_slice(payload).map_err(|_| ConnectionError::negotiation("malformed payload"))
}

/// Host candidates for a bound listener
///
/// A specific bind address is its own only candidate. The unspecified
/// address expands to every IPv4 interface address (link-local excluded),
/// loopback last.
#[must_use]
pub fn gather_candidates(bound: SocketAddr, session_id: &str) -> Vec<Candidate> {
    let port = bound.port();
    let candidate = |ip: IpAddr| Candidate {
        session_id: session_id.to_string(),
        addr: SocketAddr::new(ip, port),
    };

    if !bound.ip().is_unspecified() {
        return vec![candidate(bound.ip())];
    }

    let mut addrs: Vec<IpAddr> = match list_afinet_netifas() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter_map(|(_, ip)| match ip {
                IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some(ip),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    };
    addrs.sort();
    addrs.dedup();
    addrs.push(IpAddr::V4(Ipv4Addr::LOCALHOST));

    addrs.into_iter().map(candidate).collect()
}
