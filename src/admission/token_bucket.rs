use std::time::Instant;

use dashmap::DashMap;

use super::{with_state, RateLimiter};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Bursts up to `capacity`, then admits at `refill_per_sec`.
///
/// Fractional tokens carry over between calls, so the long-run rate is exact
/// rather than quantized to whole tokens.
pub struct TokenBucket {
    capacity: u32,
    refill_per_sec: f64,
    buckets: DashMap<String, Bucket>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            buckets: DashMap::new(),
        }
    }

    /// Tokens left for `client_key` as of its last call.
    pub fn tokens(&self, client_key: &str) -> Option<f64> {
        self.buckets.get(client_key).map(|b| b.tokens)
    }
}

impl RateLimiter for TokenBucket {
    fn allow_at(&self, client_key: &str, now: Instant) -> bool {
        let capacity = f64::from(self.capacity);
        with_state(
            &self.buckets,
            client_key,
            || Bucket {
                tokens: capacity,
                last_refill: now,
            },
            |b| {
                let elapsed = now.saturating_duration_since(b.last_refill).as_secs_f64();
                b.tokens = (b.tokens + elapsed * self.refill_per_sec).min(capacity);
                // A caller that read the clock before a racing caller must not
                // rewind the refill point.
                if now > b.last_refill {
                    b.last_refill = now;
                }
                if b.tokens >= 1.0 {
                    b.tokens -= 1.0;
                    true
                } else {
                    false
                }
            },
        )
    }

    fn name(&self) -> String {
        format!("TokenBucket(cap={},rate={}/s)", self.capacity, self.refill_per_sec)
    }

    fn stats(&self, client_key: &str) -> String {
        match self.buckets.get(client_key) {
            Some(b) => format!("tokens={:.1}/{}", b.tokens, self.capacity),
            None => "no data".to_string(),
        }
    }

    fn clients(&self) -> usize {
        self.buckets.len()
    }
}
