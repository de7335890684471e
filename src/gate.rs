use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use ulid::Ulid;

use crate::admission::AdmissionController;
use crate::coordinator::{
    Coordinator, CoordinatorError, DenyReason, PricingStrategy, Reservation,
};
use crate::model::Hold;

/// Admission first, then reservation. The holder is the client key, so one
/// noisy holder cannot starve others of the same endpoint.
pub struct ReservationGate {
    admission: Arc<AdmissionController>,
    coordinator: Arc<Coordinator>,
}

impl ReservationGate {
    pub fn new(admission: Arc<AdmissionController>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            admission,
            coordinator,
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub async fn reserve(
        &self,
        endpoint: &str,
        resource_id: Ulid,
        holder: &str,
        timeout: Duration,
        pricing: &dyn PricingStrategy,
    ) -> Result<Reservation<Hold>, CoordinatorError> {
        if !self.admission.allow(endpoint, holder) {
            debug!(endpoint, holder, %resource_id, "reserve rejected by admission");
            return Ok(Reservation::Denied(DenyReason::RateLimited {
                endpoint: endpoint.to_string(),
            }));
        }
        self.coordinator
            .reserve(resource_id, holder, timeout, pricing)
            .await
    }
}
