use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};
use ulid::Ulid;

use crate::coordinator::{now_ms, Coordinator};
use crate::model::Ms;

/// One pending expiry. Ordered by deadline first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Expiry {
    pub fire_at: Ms,
    pub resource_id: Ulid,
    pub generation: u64,
}

/// Min-heap of hold deadlines.
///
/// Confirm and cancel never remove entries; an entry whose generation no
/// longer matches a live hold is simply ignored when it fires.
pub struct ExpiryQueue {
    heap: Mutex<BinaryHeap<Reverse<Expiry>>>,
    wake: Notify,
}

impl Default for ExpiryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        }
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Expiry>>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self, fire_at: Ms, resource_id: Ulid, generation: u64) {
        let mut heap = self.heap();
        let earliest = heap.peek().is_none_or(|Reverse(e)| fire_at < e.fire_at);
        heap.push(Reverse(Expiry {
            fire_at,
            resource_id,
            generation,
        }));
        metrics::gauge!(crate::observability::EXPIRY_QUEUE_DEPTH).set(heap.len() as f64);
        drop(heap);
        if earliest {
            self.wake.notify_one();
        }
    }

    pub fn next_deadline(&self) -> Option<Ms> {
        self.heap().peek().map(|Reverse(e)| e.fire_at)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&self, now: Ms) -> Vec<Expiry> {
        let mut heap = self.heap();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(e)| e.fire_at <= now) {
            if let Some(Reverse(e)) = heap.pop() {
                due.push(e);
            }
        }
        if !due.is_empty() {
            metrics::gauge!(crate::observability::EXPIRY_QUEUE_DEPTH).set(heap.len() as f64);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }
}

/// Background task that reverts holds when their deadline passes.
///
/// Sleeps until the earliest deadline (or `idle` when nothing is pending),
/// waking early when a sooner deadline is scheduled. Exits once the
/// coordinator has been dropped.
pub async fn run_reaper(coordinator: Weak<Coordinator>, queue: Arc<ExpiryQueue>, idle: Duration) {
    loop {
        let now = now_ms();
        let sleep_for = match queue.next_deadline() {
            Some(t) if t <= now => Duration::ZERO,
            Some(t) => Duration::from_millis((t - now) as u64).min(idle),
            None => idle,
        };
        if !sleep_for.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = queue.wake.notified() => {}
            }
        }

        let Some(coordinator) = coordinator.upgrade() else {
            debug!("coordinator dropped, reaper exiting");
            return;
        };
        for due in queue.pop_due(now_ms()) {
            match coordinator.expire_hold(due.resource_id, due.generation).await {
                Ok(true) => info!(
                    "reaped expired hold on {} (generation {})",
                    due.resource_id, due.generation
                ),
                Ok(false) => debug!(
                    "stale expiry for {} (generation {})",
                    due.resource_id, due.generation
                ),
                // May have been rescheduled on contention or the resource vanished.
                Err(e) => debug!("reaper skip {}: {e}", due.resource_id),
            }
        }
    }
}
