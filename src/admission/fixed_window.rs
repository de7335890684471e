use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::{with_state, RateLimiter};

struct Window {
    start: Instant,
    count: u32,
}

/// At most `max_requests` per window, counted from the first request after
/// the previous window ran out.
///
/// Up to twice the quota can pass in a short span straddling a window
/// boundary; that is how this algorithm behaves.
pub struct FixedWindow {
    max_requests: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl FixedWindow {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
        }
    }
}

impl RateLimiter for FixedWindow {
    fn allow_at(&self, client_key: &str, now: Instant) -> bool {
        with_state(
            &self.windows,
            client_key,
            || Window { start: now, count: 0 },
            |w| {
                if now.saturating_duration_since(w.start) >= self.window {
                    w.start = now;
                    w.count = 0;
                }
                if w.count < self.max_requests {
                    w.count += 1;
                    true
                } else {
                    false
                }
            },
        )
    }

    fn name(&self) -> String {
        format!(
            "FixedWindow(max={},window={}ms)",
            self.max_requests,
            self.window.as_millis()
        )
    }

    fn stats(&self, client_key: &str) -> String {
        match self.windows.get(client_key) {
            Some(w) => format!("count={}/{}", w.count, self.max_requests),
            None => "no data".to_string(),
        }
    }

    fn clients(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admitted(limiter: &FixedWindow, key: &str, n: usize, at: Instant) -> usize {
        (0..n).filter(|_| limiter.allow_at(key, at)).count()
    }

    #[test]
    fn exact_limit_then_reset() {
        let fw = FixedWindow::new(3, Duration::from_millis(1000));
        let t0 = Instant::now();
        assert_eq!(admitted(&fw, "client-B", 6, t0), 3);
        assert_eq!(admitted(&fw, "client-B", 1, t0 + Duration::from_millis(999)), 0);
        assert_eq!(admitted(&fw, "client-B", 4, t0 + Duration::from_millis(1000)), 3);
    }

    #[test]
    fn boundary_burst_is_preserved() {
        let fw = FixedWindow::new(3, Duration::from_millis(1000));
        let t0 = Instant::now();
        assert!(fw.allow_at("c", t0));
        // Quota spent at the very end of the first window...
        assert_eq!(admitted(&fw, "c", 2, t0 + Duration::from_millis(990)), 2);
        // ...and again right after the boundary: six admits within 20ms.
        assert_eq!(admitted(&fw, "c", 3, t0 + Duration::from_millis(1010)), 3);
    }

    #[test]
    fn clients_are_isolated() {
        let fw = FixedWindow::new(3, Duration::from_secs(5));
        let t0 = Instant::now();
        assert_eq!(admitted(&fw, "isolated-1", 3, t0), 3);
        assert_eq!(admitted(&fw, "isolated-2", 3, t0), 3);
        assert_eq!(fw.stats("isolated-1"), "count=3/3");
        assert_eq!(fw.clients(), 2);
    }

    #[test]
    fn name_format() {
        let fw = FixedWindow::new(3, Duration::from_millis(1000));
        assert_eq!(fw.name(), "FixedWindow(max=3,window=1000ms)");
        assert_eq!(fw.stats("nobody"), "no data");
    }
}
