mod error;
mod group;
mod holds;
mod pricing;

pub use error::CoordinatorError;
pub use pricing::{Multiplier, PremiumPricing, PricingStrategy, StandardPricing};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::config::{CoordinatorSettings, HolderPolicy};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::reaper::{self, ExpiryQueue};
use crate::registry::{ResourceRegistry, SharedResource};

/// Outcome of a reservation attempt. Losing a race is a normal result, not an
/// error.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation<T> {
    Granted(T),
    Denied(DenyReason),
}

impl<T> Reservation<T> {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted(_))
    }

    pub fn granted(self) -> Option<T> {
        match self {
            Reservation::Granted(t) => Some(t),
            Reservation::Denied(_) => None,
        }
    }

    pub fn denial(&self) -> Option<&DenyReason> {
        match self {
            Reservation::Granted(_) => None,
            Reservation::Denied(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    NotAvailable {
        resource_id: Ulid,
        status: ResourceStatus,
    },
    /// The resource or group lock stayed contended past the configured wait.
    LockTimeout(Ulid),
    RateLimited {
        endpoint: String,
    },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::NotAvailable {
                resource_id,
                status,
            } => write!(f, "resource {resource_id} is {status}"),
            DenyReason::LockTimeout(id) => write!(f, "lock on {id} is contended"),
            DenyReason::RateLimited { endpoint } => write!(f, "rate limited on {endpoint}"),
        }
    }
}

/// Exactly-once allocation of registry resources to holders.
///
/// Every status change happens under the resource's own lock; group bookings
/// additionally take the group lock. Holds expire through the reaper's delay
/// queue, and lapsed holds are also settled lazily by whichever operation
/// next locks the resource.
pub struct Coordinator {
    registry: Arc<ResourceRegistry>,
    settings: CoordinatorSettings,
    expiry: Arc<ExpiryQueue>,
    bookings: DashMap<Ulid, GroupBooking>,
}

impl Coordinator {
    /// Build a coordinator without a reaper. Lapsed holds are still settled
    /// lazily; call [`Coordinator::sweep_expired`] or use [`Coordinator::start`]
    /// for timely expiry.
    pub fn new(registry: Arc<ResourceRegistry>, settings: CoordinatorSettings) -> Self {
        Self {
            registry,
            settings,
            expiry: Arc::new(ExpiryQueue::new()),
            bookings: DashMap::new(),
        }
    }

    /// Build a coordinator and spawn its reaper on the current tokio runtime.
    /// The reaper exits once the returned `Arc` is dropped.
    pub fn start(registry: Arc<ResourceRegistry>, settings: CoordinatorSettings) -> Arc<Self> {
        let idle = settings.reaper_idle;
        let coordinator = Arc::new(Self::new(registry, settings));
        tokio::spawn(reaper::run_reaper(
            Arc::downgrade(&coordinator),
            coordinator.expiry.clone(),
            idle,
        ));
        coordinator
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        self.registry.notify()
    }

    pub fn pending_expiries(&self) -> usize {
        self.expiry.len()
    }

    pub fn booking(&self, id: &Ulid) -> Option<GroupBooking> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    pub fn bookings_for(&self, holder: &str) -> Vec<GroupBooking> {
        let mut out: Vec<GroupBooking> = self
            .bookings
            .iter()
            .filter(|b| b.holder == holder)
            .map(|b| b.value().clone())
            .collect();
        out.sort_by_key(|b| b.id);
        out
    }

    /// Settle every lapsed hold now. Returns how many were released.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut released = 0;
        for info in self
            .registry
            .list_by_status(ResourceStatus::Reserved)
            .await
        {
            let Some(rs) = self.registry.handle(&info.id) else {
                continue;
            };
            let mut guard = rs.write().await;
            if self.settle_lapsed(&mut guard, now) {
                released += 1;
            }
        }
        released
    }

    // ── Lock helpers ─────────────────────────────────────────

    fn resolve(&self, resource_id: Ulid) -> Result<SharedResource, CoordinatorError> {
        self.registry
            .handle(&resource_id)
            .ok_or(CoordinatorError::NotFound(resource_id))
    }

    /// Acquire the resource lock, waiting at most `lock_wait`.
    async fn lock_resource(&self, rs: &SharedResource) -> Option<OwnedRwLockWriteGuard<Resource>> {
        self.lock_resource_until(rs, self.lock_deadline()).await
    }

    /// Deadline shared by every lock taken in one operation.
    fn lock_deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.settings.lock_wait
    }

    async fn lock_resource_until(
        &self,
        rs: &SharedResource,
        deadline: tokio::time::Instant,
    ) -> Option<OwnedRwLockWriteGuard<Resource>> {
        let started = Instant::now();
        let guard = tokio::time::timeout_at(deadline, rs.clone().write_owned())
            .await
            .ok();
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        guard
    }

    // ── Transitions (caller holds the resource lock) ─────────

    /// Revert a hold whose deadline passed. Returns true if one was released.
    fn settle_lapsed(&self, rs: &mut Resource, now: Ms) -> bool {
        if !rs.hold_expired(now) {
            return false;
        }
        let Some(claim) = rs.claim.take() else {
            return false;
        };
        set_status(rs, ResourceStatus::Available, true);
        metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
        info!(
            resource_id = %rs.id,
            holder = %claim.holder,
            generation = claim.generation,
            "hold expired"
        );
        self.notify().send(
            rs.id,
            &Event::HoldExpired {
                resource_id: rs.id,
                holder: claim.holder,
                generation: claim.generation,
            },
        );
        true
    }

    fn check_holder(&self, rs: &Resource, holder: &str) -> Result<(), CoordinatorError> {
        if self.settings.holder_policy == HolderPolicy::Any {
            return Ok(());
        }
        match rs.holder() {
            Some(h) if h == holder => Ok(()),
            _ => Err(CoordinatorError::NotHolder {
                resource_id: rs.id,
                holder: holder.to_string(),
            }),
        }
    }
}

fn set_status(rs: &mut Resource, to: ResourceStatus, with_hold_step: bool) {
    debug_assert!(
        rs.status.can_transition(to, with_hold_step),
        "illegal transition {} -> {} on {}",
        rs.status,
        to,
        rs.id
    );
    rs.status = to;
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

fn validate_holder(holder: &str) -> Result<(), CoordinatorError> {
    if holder.is_empty() {
        return Err(CoordinatorError::LimitExceeded("holder id is empty"));
    }
    if holder.len() > MAX_HOLDER_LEN {
        return Err(CoordinatorError::LimitExceeded("holder id too long"));
    }
    Ok(())
}

fn validate_timeout(timeout: Duration) -> Result<Ms, CoordinatorError> {
    let ms = Ms::try_from(timeout.as_millis()).unwrap_or(Ms::MAX);
    if ms < MIN_HOLD_TIMEOUT_MS {
        return Err(CoordinatorError::LimitExceeded("hold timeout too short"));
    }
    if ms > MAX_HOLD_TIMEOUT_MS {
        return Err(CoordinatorError::LimitExceeded("hold timeout too long"));
    }
    Ok(ms)
}
