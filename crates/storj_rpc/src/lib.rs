//! Signed, nonce-checked request/response envelopes layered over the overlay
//! transport (§4.6, §6): canonical method set, a typed middleware chain doing
//! signature verification and per-contact rate limiting, and a minimal
//! request/dispatch pair built on top of a thin [`transport::Transport`] seam.

pub mod contact;
pub mod envelope;
pub mod middleware;
pub mod rate_limiter;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use storj_crypto::{KeyPair, NodeId};
use thiserror::Error;

pub use contact::{Contact, ContactError};
pub use envelope::{Body, Envelope, EnvelopeError, MessageId, Method};
pub use middleware::StandardChain;
pub use rate_limiter::RateLimiter;
pub use transport::{Transport, TransportError};

/// Errors surfaced by a client call or a server-side dispatch.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no handler registered for method {0:?}")]
    UnknownMethod(Method),
    #[error("handler rejected the request: {0}")]
    Handler(String),
}

/// Sends signed requests to peers and verifies their signed responses.
#[derive(Clone)]
pub struct RpcClient {
    keypair: KeyPair,
    transport: Arc<dyn Transport>,
    nonce_window: Duration,
}

impl RpcClient {
    pub fn new(keypair: KeyPair, transport: Arc<dyn Transport>, nonce_window: Duration) -> Self {
        Self { keypair, transport, nonce_window }
    }

    /// Signs `method`/`params`, sends it to `peer`, and verifies the reply was
    /// actually signed by `peer` before handing back its result payload.
    pub async fn call(
        &self,
        peer: NodeId,
        method: Method,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let request = Envelope::sign(method, Body::Params(params), &self.keypair);
        let response = self.transport.request(peer, request).await?;
        response.verify(peer, self.nonce_window)?;
        body_into_result(response.body)
    }

    /// Like [`Self::call`], but dials `contact`'s advertised address directly instead
    /// of resolving `peer` through the routing table. Used for PROBE/FIND_TUNNEL/
    /// OPEN_TUNNEL and for a joining node's seed connections (§4.9), where the target
    /// may not be in the routing table yet. The response is still verified against
    /// `contact`'s claimed node id — dialing a contact directly only skips the
    /// *routing-table lookup*, never signature verification on the reply.
    pub async fn call_contact(
        &self,
        contact: &contact::Contact,
        method: Method,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let request = Envelope::sign(method, Body::Params(params), &self.keypair);
        let response = self.transport.dial(contact, request).await?;
        response.verify(contact.node_id, self.nonce_window)?;
        body_into_result(response.body)
    }
}

/// Turns a verified response's body into the caller's result, surfacing a synthetic
/// `Body::Error` (currently only `RateLimitExceeded`) as an `RpcError` instead of
/// handing the caller a bare JSON value to inspect themselves.
fn body_into_result(body: Body) -> Result<serde_json::Value, RpcError> {
    match body {
        Body::Result(value) => Ok(value),
        Body::Params(value) => Ok(value),
        Body::Error { error, retry_after_ms } if error == "RateLimitExceeded" => {
            Err(RpcError::RateLimited { retry_after: Duration::from_millis(retry_after_ms) })
        }
        Body::Error { error, .. } => Err(RpcError::Handler(error)),
    }
}

/// A method handler on the receiving side. Implementors live in `storj_protocol`;
/// this crate only defines the seam.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError>;
}

/// Runs inbound envelopes through a [`StandardChain`] and dispatches verified ones to
/// a registered [`Handler`], signing the result as a response envelope.
pub struct Dispatcher {
    keypair: KeyPair,
    chain: StandardChain,
    handlers: HashMap<Method, Box<dyn Handler>>,
}

impl Dispatcher {
    pub fn new(keypair: KeyPair, chain: StandardChain) -> Self {
        Self { keypair, chain, handlers: HashMap::new() }
    }

    pub fn register(&mut self, method: Method, handler: Box<dyn Handler>) {
        self.handlers.insert(method, handler);
    }

    /// Verifies `envelope` (nonce freshness, signature against `sender`, rate limit),
    /// invokes the registered handler for its method, and returns a signed response.
    ///
    /// A rate-limit rejection never reaches a handler: it is turned into a signed
    /// `RateLimitExceeded` response here and returned as `Ok`, the same as any other
    /// answer, so the caller gets a retry hint instead of a dropped connection (§4.6,
    /// §7).
    pub async fn dispatch(&self, envelope: Envelope, sender: NodeId) -> Result<Envelope, RpcError> {
        if let Err(err) = self.chain.process_inbound(&envelope, sender).await {
            let RpcError::RateLimited { retry_after } = err else { return Err(err) };
            let response = envelope.rate_limited(retry_after, &self.keypair);
            self.chain.process_outbound(&response)?;
            return Ok(response);
        }

        let params = match envelope.body.clone() {
            Body::Params(value) => value,
            Body::Result(value) => value,
            Body::Error { error, .. } => return Err(RpcError::Handler(format!("inbound envelope carried an error body: {error}"))),
        };
        let handler = self.handlers.get(&envelope.method).ok_or(RpcError::UnknownMethod(envelope.method))?;
        let result = handler.handle(sender, params).await?;

        let response = envelope.respond(result, &self.keypair);
        self.chain.process_outbound(&response)?;
        Ok(response)
    }
}
