use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::coordinator::{now_ms, Coordinator, CoordinatorError, Reservation, StandardPricing};
use crate::model::*;
use crate::registry::RegistryError;

/// How long a pickup code stays valid after deposit.
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// One parcel placed in one compartment, redeemable with `code`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub code: String,
    pub parcel_id: String,
    pub compartment_id: Ulid,
    pub compartment_size: SizeClass,
    pub expires_at: Ms,
    pub picked_up: bool,
}

impl Assignment {
    fn expired(&self, now: Ms) -> bool {
        !self.picked_up && self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockerStatus {
    pub compartments: usize,
    pub free: usize,
    pub occupied: usize,
    /// Codes neither redeemed nor expired.
    pub active_codes: usize,
}

impl std::fmt::Display for LockerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "compartments: {} (free: {}, occupied: {}), active codes: {}",
            self.compartments, self.free, self.occupied, self.active_codes
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockerError {
    NoCompartment(SizeClass),
    InvalidCode,
    CodeAlreadyUsed,
    CodeExpired,
    Coordinator(CoordinatorError),
    Registry(RegistryError),
}

impl std::fmt::Display for LockerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockerError::NoCompartment(size) => {
                write!(f, "no compartment available for a {size} parcel")
            }
            LockerError::InvalidCode => f.write_str("invalid code"),
            LockerError::CodeAlreadyUsed => f.write_str("code already used"),
            LockerError::CodeExpired => f.write_str("code expired"),
            LockerError::Coordinator(e) => write!(f, "{e}"),
            LockerError::Registry(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LockerError {}

impl From<CoordinatorError> for LockerError {
    fn from(e: CoordinatorError) -> Self {
        LockerError::Coordinator(e)
    }
}

impl From<RegistryError> for LockerError {
    fn from(e: RegistryError) -> Self {
        LockerError::Registry(e)
    }
}

/// A bank of sized compartments. Each compartment is a registry resource in
/// the bank's group; a deposit is a hold lasting as long as the pickup code,
/// with the parcel id as holder. Pickup cancels the hold, and an unredeemed
/// parcel is released by the coordinator's expiry like any other hold.
pub struct LockerBank {
    coordinator: Arc<Coordinator>,
    group_id: Ulid,
    code_ttl: Duration,
    assignments: DashMap<String, Assignment>,
}

impl LockerBank {
    pub fn new(coordinator: Arc<Coordinator>, name: impl Into<String>) -> Self {
        Self::with_code_ttl(coordinator, name, DEFAULT_CODE_TTL)
    }

    pub fn with_code_ttl(
        coordinator: Arc<Coordinator>,
        name: impl Into<String>,
        code_ttl: Duration,
    ) -> Self {
        let group_id = coordinator.registry().add_group(Some(name.into()));
        Self {
            coordinator,
            group_id,
            code_ttl,
            assignments: DashMap::new(),
        }
    }

    pub fn group_id(&self) -> Ulid {
        self.group_id
    }

    pub fn add_compartment(&self, size: SizeClass) -> Result<Ulid, LockerError> {
        let n = self.coordinator.registry().members(&self.group_id).len() + 1;
        let compartment = Resource::new(0.0)
            .named(format!("{size}-{n}"))
            .sized(size)
            .in_group(self.group_id);
        Ok(self.coordinator.registry().add(compartment)?)
    }

    /// Free compartments that fit `size`, exact fit first, then by
    /// increasing size. Registration order breaks ties.
    async fn candidates(&self, size: SizeClass) -> Vec<(Ulid, SizeClass)> {
        let registry = self.coordinator.registry();
        let now = now_ms();
        let mut out = Vec::new();
        for id in registry.members(&self.group_id) {
            let Some(rs) = registry.handle(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if let Some(have) = guard.size
                && have >= size
                && guard.effective_status(now) == ResourceStatus::Available
            {
                out.push((id, have));
            }
        }
        out.sort_by_key(|(_, have)| *have);
        out
    }

    /// Place a parcel in the smallest free compartment that fits it and
    /// return the pickup assignment. The availability check and the claim
    /// happen under the compartment's own lock, so a compartment lost to a
    /// concurrent deposit is skipped in favor of the next candidate.
    pub async fn deposit(
        &self,
        parcel_id: &str,
        size: SizeClass,
    ) -> Result<Assignment, LockerError> {
        for (compartment_id, have) in self.candidates(size).await {
            let hold = match self
                .coordinator
                .reserve(compartment_id, parcel_id, self.code_ttl, &StandardPricing)
                .await?
            {
                Reservation::Granted(hold) => hold,
                Reservation::Denied(reason) => {
                    debug!(%compartment_id, parcel_id, %reason, "compartment taken, trying next");
                    continue;
                }
            };

            let assignment = loop {
                let code = new_code();
                if let Entry::Vacant(slot) = self.assignments.entry(code.clone()) {
                    let assignment = Assignment {
                        code,
                        parcel_id: parcel_id.to_string(),
                        compartment_id,
                        compartment_size: have,
                        expires_at: hold.expires_at,
                        picked_up: false,
                    };
                    slot.insert(assignment.clone());
                    break assignment;
                }
            };
            metrics::counter!(crate::observability::LOCKER_DEPOSITS_TOTAL, "outcome" => "assigned")
                .increment(1);
            info!(
                parcel_id,
                %compartment_id,
                requested = %size,
                assigned = %have,
                "parcel deposited"
            );
            return Ok(assignment);
        }

        metrics::counter!(crate::observability::LOCKER_DEPOSITS_TOTAL, "outcome" => "full")
            .increment(1);
        debug!(parcel_id, %size, "no compartment fits");
        Err(LockerError::NoCompartment(size))
    }

    /// Redeem a pickup code and free its compartment. A code works once and
    /// only before it expires.
    pub async fn pickup(&self, code: &str) -> Result<Assignment, LockerError> {
        let assignment = {
            let Some(mut entry) = self.assignments.get_mut(code) else {
                return Err(LockerError::InvalidCode);
            };
            if entry.picked_up {
                return Err(LockerError::CodeAlreadyUsed);
            }
            if entry.expired(now_ms()) {
                return Err(LockerError::CodeExpired);
            }
            entry.picked_up = true;
            entry.value().clone()
        };

        match self
            .coordinator
            .cancel(assignment.compartment_id, &assignment.parcel_id)
            .await
        {
            Ok(()) => {
                info!(code, compartment_id = %assignment.compartment_id, "parcel picked up");
                Ok(assignment)
            }
            Err(e) => {
                if let Some(mut entry) = self.assignments.get_mut(code) {
                    entry.picked_up = false;
                }
                // The hold lapsed between the code check and the release.
                if e.is_invalid_state() {
                    return Err(LockerError::CodeExpired);
                }
                Err(e.into())
            }
        }
    }

    pub fn assignment(&self, code: &str) -> Option<Assignment> {
        self.assignments.get(code).map(|a| a.value().clone())
    }

    pub async fn status(&self) -> LockerStatus {
        let registry = self.coordinator.registry();
        let now = now_ms();
        let members = registry.members(&self.group_id);
        let mut free = 0;
        for id in &members {
            if let Some(rs) = registry.handle(id)
                && rs.read().await.effective_status(now) == ResourceStatus::Available
            {
                free += 1;
            }
        }
        let active_codes = self
            .assignments
            .iter()
            .filter(|a| !a.picked_up && !a.expired(now))
            .count();
        LockerStatus {
            compartments: members.len(),
            free,
            occupied: members.len() - free,
            active_codes,
        }
    }
}

/// `CODE` followed by six characters of a fresh ULID's random part.
fn new_code() -> String {
    let id = Ulid::new().to_string();
    format!("CODE{}", &id[id.len() - 6..])
}
