//! [`Contact`]: the address at which a [`NodeId`] claims to be reachable (§3, §6).
//!
//! A contact is only ever a claim until an RPC signed by its node id actually
//! verifies (§4.6) — this module just carries the claim and its wire shape
//! (`storj://host:port/nodeid`), not any trust judgment about it.

use std::fmt;

use serde::{Deserialize, Serialize};
use storj_crypto::{NodeId, ProtocolVersion};

/// Errors parsing a [`Contact`] from its URI form.
#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("contact URI must start with \"storj://\"")]
    MissingScheme,
    #[error("contact URI is missing a port")]
    MissingPort,
    #[error("contact URI port is not a valid number: {0}")]
    InvalidPort(String),
    #[error("contact URI is missing a node id path segment")]
    MissingNodeId,
    #[error(transparent)]
    NodeId(#[from] hex::FromHexError),
}

/// `{address, port, nodeID, protocol_version, last_seen}` (§3). `last_seen` is a
/// unix-ms timestamp updated by the routing table each time traffic is received from
/// this contact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub address: String,
    pub port: u16,
    pub node_id: NodeId,
    pub protocol_version: ProtocolVersion,
    pub last_seen: u64,
}

impl Contact {
    pub fn new(address: impl Into<String>, port: u16, node_id: NodeId, protocol_version: ProtocolVersion) -> Self {
        Self { address: address.into(), port, node_id, protocol_version, last_seen: 0 }
    }

    /// `storj://<host>:<port>/<40-hex-nodeid>` (§6). The protocol version and
    /// `last_seen` are local bookkeeping, not part of the wire URI.
    pub fn to_uri(&self) -> String {
        format!("storj://{}:{}/{}", self.address, self.port, self.node_id.to_hex())
    }

    /// Parses a bare `storj://host:port/nodeid` URI. The returned contact's
    /// `protocol_version` is left at `0.0.0` and `last_seen` at 0 — callers that learn
    /// a contact from a live RPC should fill those in separately, since the URI form
    /// never carries them.
    pub fn parse(uri: &str) -> Result<Self, ContactError> {
        let rest = uri.strip_prefix("storj://").ok_or(ContactError::MissingScheme)?;
        let (host_port, node_hex) = rest.split_once('/').ok_or(ContactError::MissingNodeId)?;
        let (address, port_str) = host_port.rsplit_once(':').ok_or(ContactError::MissingPort)?;
        let port: u16 = port_str.parse().map_err(|_| ContactError::InvalidPort(port_str.to_owned()))?;
        let node_id = NodeId::from_hex(node_hex)?;
        Ok(Self {
            address: address.to_owned(),
            port,
            node_id,
            protocol_version: ProtocolVersion::new(0, 0, 0, None),
            last_seen: 0,
        })
    }

    /// §4.9's routing-table hygiene check: loopback addresses are rejected unless the
    /// node has explicitly opted in (`STORJ_ALLOW_LOOPBACK`), and the port must be
    /// nonzero.
    pub fn is_routable(&self, allow_loopback: bool) -> bool {
        if self.port == 0 {
            return false;
        }
        allow_loopback || !self.is_loopback()
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.address.as_str(), "127.0.0.1" | "::1" | "localhost")
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id() -> NodeId {
        NodeId::from_hex(&"ab".repeat(20)).unwrap()
    }

    #[test]
    fn uri_round_trips_host_port_and_node_id() {
        let contact = Contact::new("198.51.100.4", 4000, node_id(), ProtocolVersion::new(1, 2, 0, None));
        let uri = contact.to_uri();
        let parsed = Contact::parse(&uri).unwrap();
        assert_eq!(parsed.address, "198.51.100.4");
        assert_eq!(parsed.port, 4000);
        assert_eq!(parsed.node_id, node_id());
    }

    #[test]
    fn loopback_is_unroutable_unless_allowed() {
        let contact = Contact::new("127.0.0.1", 4000, node_id(), ProtocolVersion::new(1, 0, 0, None));
        assert!(!contact.is_routable(false));
        assert!(contact.is_routable(true));
    }

    #[test]
    fn zero_port_is_never_routable() {
        let contact = Contact::new("198.51.100.4", 0, node_id(), ProtocolVersion::new(1, 0, 0, None));
        assert!(!contact.is_routable(true));
    }

    #[test]
    fn parse_rejects_a_uri_missing_the_scheme() {
        assert!(matches!(Contact::parse("198.51.100.4:4000/abc").unwrap_err(), ContactError::MissingScheme));
    }
}
