//! Per-contact leaky-bucket rate limiting (§4.6, §5's `rate_limiter` config block).

use std::collections::HashMap;
use std::time::Duration;

use storj_crypto::NodeId;
use tokio::sync::Mutex;

/// One contact's bucket: `tokens` drain at `refill_per_sec` and are spent one per
/// inbound request.
struct Bucket {
    tokens: f64,
    last_refill: std::time::Instant,
}

/// A leaky bucket per [`NodeId`], capped at `capacity` tokens and refilling at
/// `refill_per_sec` tokens/second. Contacts with no bucket yet start full.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<NodeId, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self { capacity: capacity as f64, refill_per_sec: refill_per_sec as f64, buckets: Mutex::new(HashMap::new()) }
    }

    /// Attempts to spend one token for `sender`. Returns `Ok(())` if the request may
    /// proceed, or `Err(retry_after)` with the wait until a token becomes available.
    pub async fn check(&self, sender: NodeId) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock().await;
        let now = std::time::Instant::now();
        let bucket = buckets.entry(sender).or_insert_with(|| Bucket { tokens: self.capacity, last_refill: now });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let shortfall = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(shortfall / self.refill_per_sec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::from_hex(&hex::encode([byte; 20])).unwrap()
    }

    #[tokio::test]
    async fn a_bucket_starts_full_and_drains_with_use() {
        let limiter = RateLimiter::new(2, 1);
        let contact = node(1);
        limiter.check(contact).await.unwrap();
        limiter.check(contact).await.unwrap();
        assert!(limiter.check(contact).await.is_err());
    }

    #[tokio::test]
    async fn different_contacts_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 1);
        limiter.check(node(1)).await.unwrap();
        limiter.check(node(2)).await.unwrap();
    }
}
