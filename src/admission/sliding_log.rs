use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::{with_state, RateLimiter};

/// Keeps the timestamp of every admitted request inside the trailing window.
/// Exact: no rolling interval of length `window` ever holds more than
/// `max_requests` admits. Costs O(max_requests) memory per client.
pub struct SlidingWindowLog {
    max_requests: u32,
    window: Duration,
    logs: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLog {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            logs: DashMap::new(),
        }
    }
}

impl RateLimiter for SlidingWindowLog {
    fn allow_at(&self, client_key: &str, now: Instant) -> bool {
        with_state(&self.logs, client_key, VecDeque::new, |log| {
            while log
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
            {
                log.pop_front();
            }
            if log.len() < self.max_requests as usize {
                // Keep the log sorted even if a racing caller read the clock first.
                let stamp = log.back().map_or(now, |last| now.max(*last));
                log.push_back(stamp);
                true
            } else {
                false
            }
        })
    }

    fn name(&self) -> String {
        format!(
            "SlidingWindowLog(max={},window={}ms)",
            self.max_requests,
            self.window.as_millis()
        )
    }

    fn stats(&self, client_key: &str) -> String {
        match self.logs.get(client_key) {
            Some(log) => format!("entries={}/{}", log.len(), self.max_requests),
            None => "no data".to_string(),
        }
    }

    fn clients(&self) -> usize {
        self.logs.len()
    }
}
