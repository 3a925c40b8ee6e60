//! A fixed, typed chain of inbound/outbound hooks, replacing the dynamic callback
//! chains of the reference implementation (SPEC_FULL §4.6 redesign): each stage is a
//! concrete type implementing [`Middleware`], composed in [`StandardChain`] rather than
//! stored as a `Vec<Box<dyn Fn>>`, so the ordering and stage set is visible at the type
//! level instead of being assembled at runtime.

use std::time::Duration;

use storj_crypto::NodeId;

use crate::envelope::Envelope;
use crate::rate_limiter::RateLimiter;
use crate::RpcError;

/// One stage of the inbound/outbound pipeline. `before_serialize` runs on an outbound
/// envelope just before it is written to the wire; `before_receive` runs on an inbound
/// envelope before its handler is invoked; `after_receive` runs once the handler has
/// produced a result, before the response is sent. Default impls are no-ops so a stage
/// only overrides the hooks it cares about.
pub trait Middleware {
    fn before_serialize(&self, _envelope: &Envelope) -> Result<(), RpcError> {
        Ok(())
    }

    fn before_receive<'a>(
        &'a self,
        envelope: &'a Envelope,
        sender: NodeId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RpcError>> + Send + 'a>>;

    fn after_receive(&self, _envelope: &Envelope) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Verifies an inbound envelope's nonce and signature, per §4.6. Methods in
/// [`crate::envelope::Method::is_verification_exempt`] skip this stage, since answering
/// them is how a contact first becomes verifiable.
pub struct VerificationStage {
    pub nonce_window: Duration,
}

impl Middleware for VerificationStage {
    fn before_receive<'a>(
        &'a self,
        envelope: &'a Envelope,
        sender: NodeId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RpcError>> + Send + 'a>> {
        Box::pin(async move {
            if envelope.method.is_verification_exempt() {
                return Ok(());
            }
            envelope.verify(sender, self.nonce_window).map_err(RpcError::from)
        })
    }
}

/// Spends one rate-limit token per inbound envelope, regardless of method.
pub struct RateLimitStage {
    pub limiter: RateLimiter,
}

impl Middleware for RateLimitStage {
    fn before_receive<'a>(
        &'a self,
        _envelope: &'a Envelope,
        sender: NodeId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), RpcError>> + Send + 'a>> {
        Box::pin(async move {
            self.limiter.check(sender).await.map_err(|retry_after| RpcError::RateLimited { retry_after })
        })
    }
}

/// The chain this node actually runs: signature/nonce verification, then rate
/// limiting. Both stages run for every inbound envelope; [`VerificationStage`] is the
/// one that internally exempts PROBE/FIND_TUNNEL/OPEN_TUNNEL.
pub struct StandardChain {
    pub verification: VerificationStage,
    pub rate_limit: RateLimitStage,
}

impl StandardChain {
    pub fn new(nonce_window: Duration, bucket_capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            verification: VerificationStage { nonce_window },
            rate_limit: RateLimitStage { limiter: RateLimiter::new(bucket_capacity, refill_per_sec) },
        }
    }

    /// Runs every stage's `before_receive` hook in order, short-circuiting on the
    /// first error.
    pub async fn process_inbound(&self, envelope: &Envelope, sender: NodeId) -> Result<(), RpcError> {
        self.verification.before_receive(envelope, sender).await?;
        self.rate_limit.before_receive(envelope, sender).await?;
        Ok(())
    }

    /// Runs every stage's `after_receive` hook (once a result exists, before it is
    /// sent), then every stage's `before_serialize` hook (just before the wire write).
    pub fn process_outbound(&self, envelope: &Envelope) -> Result<(), RpcError> {
        self.verification.after_receive(envelope)?;
        self.rate_limit.after_receive(envelope)?;
        self.verification.before_serialize(envelope)?;
        self.rate_limit.before_serialize(envelope)?;
        Ok(())
    }
}
