//! A thin transport abstraction. The overlay's actual peer connectivity (DHT lookups,
//! dialing, stream multiplexing) is `libp2p`'s job and out of this crate's scope; this
//! trait is the seam `storj_rpc` needs to send one signed envelope and await the
//! matching reply, independent of whatever carries the bytes.

use async_trait::async_trait;
use storj_crypto::NodeId;
use thiserror::Error;

use crate::contact::Contact;
use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    Unreachable(NodeId),
    #[error("request to {0} timed out")]
    Timeout(NodeId),
    #[error("dial to {0} timed out")]
    DialTimeout(Contact),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sends one signed [`Envelope`] to `peer` and resolves once the matching response
/// envelope arrives (matched on [`crate::envelope::MessageId`] by the transport).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, peer: NodeId, envelope: Envelope) -> Result<Envelope, TransportError>;

    /// Sends one signed envelope directly to `contact`'s advertised address, bypassing
    /// any routing-table lookup by node id. This is the only way to reach a contact
    /// that isn't verified/routable yet — exactly the PROBE/FIND_TUNNEL/OPEN_TUNNEL
    /// situation §4.6 carves the verification exemption out for, and also how a
    /// joining node dials its configured seeds in the first place (§4.9).
    ///
    /// The default implementation rejects every dial; transports that don't need
    /// out-of-routing-table addressing (e.g. a loopback test double) can leave it
    /// unimplemented.
    async fn dial(&self, contact: &Contact, _envelope: Envelope) -> Result<Envelope, TransportError> {
        Err(TransportError::Unreachable(contact.node_id))
    }
}
