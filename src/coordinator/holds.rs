use std::time::Duration;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::*;

use super::{
    now_ms, set_status, validate_holder, validate_timeout, Coordinator, CoordinatorError,
    DenyReason, PricingStrategy, Reservation,
};

impl Coordinator {
    /// Place a timed hold on one resource.
    ///
    /// The unlocked status read is only a shortcut for obvious losers; the
    /// decision is made on a second read taken under the resource lock.
    pub async fn reserve(
        &self,
        resource_id: Ulid,
        holder: &str,
        timeout: Duration,
        pricing: &dyn PricingStrategy,
    ) -> Result<Reservation<Hold>, CoordinatorError> {
        validate_holder(holder)?;
        let timeout_ms = validate_timeout(timeout)?;
        let rs = self.resolve(resource_id)?;

        if let Ok(peek) = rs.try_read() {
            let status = peek.effective_status(now_ms());
            if status != ResourceStatus::Available {
                metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "denied")
                    .increment(1);
                debug!(%resource_id, holder, %status, "reserve denied before locking");
                return Ok(Reservation::Denied(DenyReason::NotAvailable {
                    resource_id,
                    status,
                }));
            }
        }

        let Some(mut guard) = self.lock_resource(&rs).await else {
            metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "timeout")
                .increment(1);
            warn!(%resource_id, holder, "reserve gave up waiting for resource lock");
            return Ok(Reservation::Denied(DenyReason::LockTimeout(resource_id)));
        };

        let now = now_ms();
        self.settle_lapsed(&mut guard, now);
        if guard.status != ResourceStatus::Available {
            metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "denied")
                .increment(1);
            debug!(%resource_id, holder, status = %guard.status, "reserve lost the race");
            return Ok(Reservation::Denied(DenyReason::NotAvailable {
                resource_id,
                status: guard.status,
            }));
        }

        let price = pricing.price(guard.weight);
        guard.generation += 1;
        let generation = guard.generation;
        let expires_at = now.saturating_add(timeout_ms);
        guard.claim = Some(Claim {
            holder: holder.to_string(),
            price,
            expires_at: Some(expires_at),
            generation,
            booking_id: None,
        });
        set_status(&mut guard, ResourceStatus::Reserved, true);
        self.expiry.schedule(expires_at, resource_id, generation);

        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "held")
            .increment(1);
        debug!(%resource_id, holder, price, expires_at, generation, "hold placed");
        self.notify().send(
            resource_id,
            &Event::HoldPlaced {
                resource_id,
                holder: holder.to_string(),
                price,
                expires_at,
                generation,
            },
        );

        Ok(Reservation::Granted(Hold {
            resource_id,
            holder: holder.to_string(),
            price,
            expires_at,
            generation,
        }))
    }

    /// Reserve with the configured default hold timeout.
    pub async fn reserve_default(
        &self,
        resource_id: Ulid,
        holder: &str,
        pricing: &dyn PricingStrategy,
    ) -> Result<Reservation<Hold>, CoordinatorError> {
        self.reserve(resource_id, holder, self.settings.default_hold_timeout, pricing)
            .await
    }

    /// Turn a live hold into a booking. The pending expiry becomes a no-op
    /// because the resource is no longer `Reserved` under that generation.
    pub async fn confirm(&self, resource_id: Ulid, holder: &str) -> Result<(), CoordinatorError> {
        let rs = self.resolve(resource_id)?;
        let mut guard = self
            .lock_resource(&rs)
            .await
            .ok_or(CoordinatorError::LockTimeout(resource_id))?;

        self.settle_lapsed(&mut guard, now_ms());
        if guard.status != ResourceStatus::Reserved {
            return Err(CoordinatorError::InvalidState {
                resource_id,
                status: guard.status,
                operation: "confirm",
            });
        }
        self.check_holder(&guard, holder)?;

        let Some(claim) = guard.claim.as_mut() else {
            return Err(CoordinatorError::InvalidState {
                resource_id,
                status: guard.status,
                operation: "confirm",
            });
        };
        claim.expires_at = None;
        let event = Event::BookingConfirmed {
            resource_id,
            holder: claim.holder.clone(),
            price: claim.price,
        };
        set_status(&mut guard, ResourceStatus::Booked, true);

        debug!(%resource_id, holder, "booking confirmed");
        self.notify().send(resource_id, &event);
        Ok(())
    }

    /// Release a hold or a single-resource booking back to `Available`.
    ///
    /// Cancelling something that is not reserved or booked is an error and
    /// leaves the resource untouched.
    pub async fn cancel(&self, resource_id: Ulid, holder: &str) -> Result<(), CoordinatorError> {
        let rs = self.resolve(resource_id)?;
        let mut guard = self
            .lock_resource(&rs)
            .await
            .ok_or(CoordinatorError::LockTimeout(resource_id))?;

        self.settle_lapsed(&mut guard, now_ms());
        if !matches!(
            guard.status,
            ResourceStatus::Reserved | ResourceStatus::Booked
        ) {
            return Err(CoordinatorError::InvalidState {
                resource_id,
                status: guard.status,
                operation: "cancel",
            });
        }
        self.check_holder(&guard, holder)?;
        if let Some(booking_id) = guard.claim.as_ref().and_then(|c| c.booking_id) {
            return Err(CoordinatorError::GroupOwned {
                resource_id,
                booking_id,
            });
        }

        let previous = guard.claim.take().map(|c| c.holder).unwrap_or_default();
        set_status(&mut guard, ResourceStatus::Available, true);

        debug!(%resource_id, holder = %previous, "reservation cancelled");
        self.notify().send(
            resource_id,
            &Event::ReservationCancelled {
                resource_id,
                holder: previous,
            },
        );
        Ok(())
    }

    /// Expiry callback driven by the reaper. Reverts the resource only if it
    /// is still reserved under `generation` and its deadline has passed;
    /// anything else returns `Ok(false)`.
    pub(crate) async fn expire_hold(
        &self,
        resource_id: Ulid,
        generation: u64,
    ) -> Result<bool, CoordinatorError> {
        let rs = self.resolve(resource_id)?;
        let Some(mut guard) = self.lock_resource(&rs).await else {
            // Contended: try again once the current holder of the lock is done.
            let retry_at = now_ms().saturating_add(self.settings.lock_wait.as_millis() as Ms);
            self.expiry.schedule(retry_at, resource_id, generation);
            return Err(CoordinatorError::LockTimeout(resource_id));
        };

        let live = guard.status == ResourceStatus::Reserved
            && guard.claim.as_ref().is_some_and(|c| c.generation == generation);
        if !live {
            return Ok(false);
        }
        // A live hold is never cut short, whoever calls.
        Ok(self.settle_lapsed(&mut guard, now_ms()))
    }
}
