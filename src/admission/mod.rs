mod fixed_window;
mod sliding_log;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_log::SlidingWindowLog;
pub use token_bucket::TokenBucket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::limits::*;

/// One admission algorithm with per-client state.
///
/// Implementations must be safe under concurrent calls for the same client
/// key: each decision is one atomic read-modify-write of that key's state.
pub trait RateLimiter: Send + Sync {
    /// Decide for a request observed at `now`.
    fn allow_at(&self, client_key: &str, now: Instant) -> bool;

    fn allow(&self, client_key: &str) -> bool {
        self.allow_at(client_key, Instant::now())
    }

    fn name(&self) -> String;

    /// Human-readable state for one client, `"no data"` if never seen.
    fn stats(&self, client_key: &str) -> String;

    /// Number of clients with state.
    fn clients(&self) -> usize;
}

/// Run `f` against the state for `key`, creating it with `init` on first use.
/// The map entry stays locked for the whole call.
pub(crate) fn with_state<S, R>(
    map: &DashMap<String, S>,
    key: &str,
    init: impl FnOnce() -> S,
    f: impl FnOnce(&mut S) -> R,
) -> R {
    if let Some(mut entry) = map.get_mut(key) {
        return f(entry.value_mut());
    }
    let mut entry = map.entry(key.to_owned()).or_insert_with(init);
    f(entry.value_mut())
}

// ── Configuration ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterConfig {
    TokenBucket { capacity: u32, refill_per_sec: f64 },
    FixedWindow { max_requests: u32, window_ms: u64 },
    SlidingWindowLog { max_requests: u32, window_ms: u64 },
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), AdmissionError> {
        match *self {
            LimiterConfig::TokenBucket {
                capacity,
                refill_per_sec,
            } => {
                if capacity == 0 {
                    return Err(AdmissionError::InvalidConfig("capacity must be positive".into()));
                }
                if !refill_per_sec.is_finite() || refill_per_sec < 0.0 {
                    return Err(AdmissionError::InvalidConfig(format!(
                        "refill rate {refill_per_sec} is not a non-negative number"
                    )));
                }
            }
            LimiterConfig::FixedWindow {
                max_requests,
                window_ms,
            }
            | LimiterConfig::SlidingWindowLog {
                max_requests,
                window_ms,
            } => {
                if max_requests == 0 {
                    return Err(AdmissionError::InvalidConfig("max_requests must be positive".into()));
                }
                if window_ms == 0 {
                    return Err(AdmissionError::InvalidConfig("window must be positive".into()));
                }
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Result<Arc<dyn RateLimiter>, AdmissionError> {
        self.validate()?;
        let limiter: Arc<dyn RateLimiter> = match *self {
            LimiterConfig::TokenBucket {
                capacity,
                refill_per_sec,
            } => Arc::new(TokenBucket::new(capacity, refill_per_sec)),
            LimiterConfig::FixedWindow {
                max_requests,
                window_ms,
            } => Arc::new(FixedWindow::new(max_requests, Duration::from_millis(window_ms))),
            LimiterConfig::SlidingWindowLog {
                max_requests,
                window_ms,
            } => Arc::new(SlidingWindowLog::new(
                max_requests,
                Duration::from_millis(window_ms),
            )),
        };
        Ok(limiter)
    }
}

// ── Errors ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    InvalidConfig(String),
    UnknownEndpoint(String),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::InvalidConfig(msg) => write!(f, "invalid limiter config: {msg}"),
            AdmissionError::UnknownEndpoint(name) => write!(f, "unknown endpoint: {name}"),
            AdmissionError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

// ── Controller ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub allowed: u32,
    pub denied: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub default_limiter: String,
    /// `(endpoint, limiter name)` sorted by endpoint.
    pub endpoints: Vec<(String, String)>,
    pub allowed: u64,
    pub denied: u64,
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "default: {}", self.default_limiter)?;
        for (endpoint, limiter) in &self.endpoints {
            writeln!(f, "  {endpoint} -> {limiter}")?;
        }
        write!(f, "total: {} allowed, {} denied", self.allowed, self.denied)
    }
}

/// Routes each endpoint to its limiter, falling back to a default one, and
/// keeps aggregate allow/deny counters.
pub struct AdmissionController {
    endpoints: DashMap<String, Arc<dyn RateLimiter>>,
    default_limiter: RwLock<Arc<dyn RateLimiter>>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl AdmissionController {
    pub fn new(default_limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            endpoints: DashMap::new(),
            default_limiter: RwLock::new(default_limiter),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn from_config(default: &LimiterConfig) -> Result<Self, AdmissionError> {
        Ok(Self::new(default.build()?))
    }

    /// Attach a limiter built from `config` to `endpoint`, replacing any
    /// previous one (and its per-client state).
    pub fn register_endpoint(
        &self,
        endpoint: &str,
        config: &LimiterConfig,
    ) -> Result<(), AdmissionError> {
        let limiter = config.build()?;
        self.register_limiter(endpoint, limiter)
    }

    pub fn register_limiter(
        &self,
        endpoint: &str,
        limiter: Arc<dyn RateLimiter>,
    ) -> Result<(), AdmissionError> {
        if endpoint.is_empty() || endpoint.len() > MAX_ENDPOINT_LEN {
            return Err(AdmissionError::LimitExceeded("endpoint name length"));
        }
        if !self.endpoints.contains_key(endpoint) && self.endpoints.len() >= MAX_ENDPOINTS {
            return Err(AdmissionError::LimitExceeded("too many endpoints"));
        }
        info!("endpoint {endpoint} -> {}", limiter.name());
        self.endpoints.insert(endpoint.to_string(), limiter);
        Ok(())
    }

    pub fn remove_endpoint(&self, endpoint: &str) -> Result<(), AdmissionError> {
        self.endpoints
            .remove(endpoint)
            .map(|_| ())
            .ok_or_else(|| AdmissionError::UnknownEndpoint(endpoint.to_string()))
    }

    /// Swap the fallback limiter for unregistered endpoints.
    pub fn set_default(&self, limiter: Arc<dyn RateLimiter>) {
        let mut slot = self
            .default_limiter
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        info!("default limiter -> {}", limiter.name());
        *slot = limiter;
    }

    fn default_limiter(&self) -> Arc<dyn RateLimiter> {
        self.default_limiter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The limiter that would handle `endpoint`.
    pub fn limiter_for(&self, endpoint: &str) -> Arc<dyn RateLimiter> {
        match self.endpoints.get(endpoint) {
            Some(l) => l.value().clone(),
            None => self.default_limiter(),
        }
    }

    pub fn is_registered(&self, endpoint: &str) -> bool {
        self.endpoints.contains_key(endpoint)
    }

    pub fn allow(&self, endpoint: &str, client_key: &str) -> bool {
        let limiter = self.limiter_for(endpoint);
        let allowed = limiter.allow(client_key);
        self.record(endpoint, allowed, 1);
        debug!(endpoint, client_key, allowed, limiter = %limiter.name(), "admission");
        allowed
    }

    /// Run `count` requests back to back, without per-request logging.
    pub fn batch_allow(&self, endpoint: &str, client_key: &str, count: u32) -> BatchOutcome {
        let limiter = self.limiter_for(endpoint);
        let mut out = BatchOutcome::default();
        for _ in 0..count {
            if limiter.allow(client_key) {
                out.allowed += 1;
            } else {
                out.denied += 1;
            }
        }
        if out.allowed > 0 {
            self.record(endpoint, true, u64::from(out.allowed));
        }
        if out.denied > 0 {
            self.record(endpoint, false, u64::from(out.denied));
        }
        out
    }

    fn record(&self, endpoint: &str, allowed: bool, n: u64) {
        let (counter, decision) = if allowed {
            (&self.allowed, "allowed")
        } else {
            (&self.denied, "denied")
        };
        counter.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(
            crate::observability::ADMISSIONS_TOTAL,
            "endpoint" => endpoint.to_string(),
            "decision" => decision
        )
        .increment(n);
    }

    pub fn stats(&self, endpoint: &str, client_key: &str) -> String {
        self.limiter_for(endpoint).stats(client_key)
    }

    /// `(allowed, denied)` across every endpoint since construction.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.allowed.load(Ordering::Relaxed),
            self.denied.load(Ordering::Relaxed),
        )
    }

    pub fn status(&self) -> ControllerStatus {
        let mut endpoints: Vec<(String, String)> = self
            .endpoints
            .iter()
            .map(|e| (e.key().clone(), e.value().name()))
            .collect();
        endpoints.sort();
        let (allowed, denied) = self.totals();
        ControllerStatus {
            default_limiter: self.default_limiter().name(),
            endpoints,
            allowed,
            denied,
        }
    }
}
