//! The signed request/response envelope every overlay message carries (§4.6, §6).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use storj_crypto::{hash160, verify_hash160, KeyPair, NodeId};
use thiserror::Error;

/// A random 160-bit hex id identifying one envelope (request or its matching response).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "hex_bytes")] pub [u8; 20]);

impl MessageId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 20];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 20], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("expected 20 bytes"))
    }
}

/// Every method the overlay's wire envelope carries (§6). `FIND_NODE`/`FIND_VALUE`/
/// `STORE`/`PING`/`PUBLISH`/`SUBSCRIBE` are DHT/pubsub primitives the transport layer
/// (out of this crate's scope, per §1's Non-goals) answers directly; the rest are
/// dispatched to `storj_protocol` handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Probe,
    FindNode,
    FindValue,
    Store,
    Ping,
    Offer,
    Consign,
    Retrieve,
    Audit,
    Mirror,
    FindTunnel,
    OpenTunnel,
    Publish,
    Subscribe,
}

impl Method {
    /// §4.6's exemption list: these three may arrive from a contact this node cannot
    /// yet verify, because answering them is how verifiability gets established in the
    /// first place.
    pub fn is_verification_exempt(self) -> bool {
        matches!(self, Method::Probe | Method::FindTunnel | Method::OpenTunnel)
    }
}

/// Either half of a request/response pair: `params` on a request, `result` on a
/// response, using the same shape either way (§6). `Error` is the synthetic response
/// a rejected request gets instead of a result — §4.6/§7's rate-limited reply, carrying
/// a machine-readable reason and a retry hint, without ever reaching a handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Params(serde_json::Value),
    Result(serde_json::Value),
    Error { error: String, retry_after_ms: u64 },
}

/// A signed envelope: `{id, method, params|result, nonce, signature}` (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub method: Method,
    pub body: Body,
    /// Unix-ms timestamp at the sender, per §4.6.
    pub nonce: u64,
    #[serde(with = "hex65")]
    pub signature: [u8; 65],
}

mod hex65 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 65], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 65], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("expected 65 bytes"))
    }
}

/// Errors raised signing or verifying an [`Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("nonce {nonce} is older than the {max_age:?} expiry window (now {now})")]
    NonceExpired { nonce: u64, now: u64, max_age: Duration },
    #[error(transparent)]
    Crypto(#[from] storj_crypto::CryptoError),
}

fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// The digest both signer and verifier compute: `H(message_id || nonce)` (§4.6).
fn signing_digest(id: MessageId, nonce: u64) -> [u8; 20] {
    let mut buf = Vec::with_capacity(28);
    buf.extend_from_slice(&id.0);
    buf.extend_from_slice(&nonce.to_be_bytes());
    hash160(&buf)
}

impl Envelope {
    /// Builds and signs a fresh envelope with `keypair`, stamping `nonce` at the
    /// current time.
    pub fn sign(method: Method, body: Body, keypair: &KeyPair) -> Self {
        let id = MessageId::random();
        let nonce = now_unix_ms();
        let signature = keypair.sign_hash160(&signing_digest(id, nonce));
        Self { id, method, body, nonce, signature }
    }

    /// Builds a response envelope carrying the same `id` as `request`, signed afresh.
    pub fn respond(&self, result: serde_json::Value, keypair: &KeyPair) -> Self {
        let nonce = now_unix_ms();
        let signature = keypair.sign_hash160(&signing_digest(self.id, nonce));
        Self { id: self.id, method: self.method, body: Body::Result(result), nonce, signature }
    }

    /// Builds the synthetic "RateLimitExceeded" response a request gets when it is
    /// rejected by the rate limiter, without invoking a handler (§4.6, §7).
    pub fn rate_limited(&self, retry_after: Duration, keypair: &KeyPair) -> Self {
        let nonce = now_unix_ms();
        let signature = keypair.sign_hash160(&signing_digest(self.id, nonce));
        let body = Body::Error { error: "RateLimitExceeded".to_owned(), retry_after_ms: retry_after.as_millis() as u64 };
        Self { id: self.id, method: self.method, body, nonce, signature }
    }

    /// §4.6's verification rule: the nonce must be fresh and the signature must
    /// recover to `claimed_sender`. `max_age` is the configured `NONCE_EXPIRE`.
    pub fn verify(&self, claimed_sender: NodeId, max_age: Duration) -> Result<(), EnvelopeError> {
        let now = now_unix_ms();
        let age_ms = now.saturating_sub(self.nonce);
        if age_ms >= max_age.as_millis() as u64 {
            return Err(EnvelopeError::NonceExpired { nonce: self.nonce, now, max_age });
        }
        verify_hash160(&signing_digest(self.id, self.nonce), &self.signature, claimed_sender)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_freshly_signed_envelope_verifies() {
        let keypair = KeyPair::generate();
        let envelope = Envelope::sign(Method::Ping, Body::Params(serde_json::json!({})), &keypair);
        envelope.verify(keypair.node_id(), Duration::from_secs(300)).unwrap();
    }

    #[test]
    fn verification_fails_against_the_wrong_sender() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let envelope = Envelope::sign(Method::Ping, Body::Params(serde_json::json!({})), &keypair);
        assert!(envelope.verify(other.node_id(), Duration::from_secs(300)).is_err());
    }

    #[test]
    fn an_old_nonce_is_rejected() {
        let keypair = KeyPair::generate();
        let mut envelope = Envelope::sign(Method::Ping, Body::Params(serde_json::json!({})), &keypair);
        envelope.nonce -= Duration::from_secs(301).as_millis() as u64;
        let err = envelope.verify(keypair.node_id(), Duration::from_secs(300)).unwrap_err();
        assert!(matches!(err, EnvelopeError::NonceExpired { .. }));
    }

    #[test]
    fn a_rate_limited_response_carries_the_retry_hint_and_still_verifies() {
        let keypair = KeyPair::generate();
        let request = Envelope::sign(Method::Ping, Body::Params(serde_json::json!({})), &keypair);
        let response = request.rate_limited(Duration::from_secs(2), &keypair);

        assert_eq!(response.id, request.id);
        assert!(matches!(response.body, Body::Error { ref error, retry_after_ms } if error == "RateLimitExceeded" && retry_after_ms == 2000));
        response.verify(keypair.node_id(), Duration::from_secs(300)).unwrap();
    }

    #[test]
    fn probe_find_tunnel_open_tunnel_are_the_only_verification_exempt_methods() {
        assert!(Method::Probe.is_verification_exempt());
        assert!(Method::FindTunnel.is_verification_exempt());
        assert!(Method::OpenTunnel.is_verification_exempt());
        assert!(!Method::Ping.is_verification_exempt());
        assert!(!Method::Offer.is_verification_exempt());
    }
}
