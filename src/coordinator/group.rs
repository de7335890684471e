use std::collections::HashSet;

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{
    now_ms, set_status, validate_holder, Coordinator, CoordinatorError, DenyReason,
    PricingStrategy, Reservation,
};

impl Coordinator {
    /// Atomically book several resources of one group for one holder.
    ///
    /// The group lock serializes bookings within the group while other groups
    /// proceed in parallel. Resource locks are then taken in sorted id order,
    /// every resource is validated, and only then is anything mutated, so a
    /// denial leaves every resource as it was.
    pub async fn book_group(
        &self,
        group_id: Ulid,
        holder: &str,
        resource_ids: &[Ulid],
        pricing: &dyn PricingStrategy,
    ) -> Result<Reservation<GroupBooking>, CoordinatorError> {
        validate_holder(holder)?;
        if resource_ids.is_empty() {
            return Err(CoordinatorError::LimitExceeded("group booking needs at least one resource"));
        }
        if resource_ids.len() > MAX_GROUP_BOOKING_SIZE {
            return Err(CoordinatorError::LimitExceeded("group booking too large"));
        }
        let mut seen = HashSet::with_capacity(resource_ids.len());
        for id in resource_ids {
            if !seen.insert(*id) {
                return Err(CoordinatorError::DuplicateResource(*id));
            }
        }

        let group_lock = self
            .registry
            .group_lock(&group_id)
            .ok_or(CoordinatorError::NotFound(group_id))?;
        // One deadline bounds the group lock and every resource lock together.
        let deadline = self.lock_deadline();
        let Ok(_group_guard) = tokio::time::timeout_at(deadline, group_lock.lock_owned()).await
        else {
            metrics::counter!(crate::observability::GROUP_BOOKINGS_TOTAL, "outcome" => "timeout")
                .increment(1);
            warn!(%group_id, holder, "group booking gave up waiting for group lock");
            return Ok(Reservation::Denied(DenyReason::LockTimeout(group_id)));
        };

        // Acquire write locks in sorted order to prevent deadlocks with other
        // multi-resource callers.
        let mut sorted = resource_ids.to_vec();
        sorted.sort();

        let mut guards = Vec::with_capacity(sorted.len());
        for rid in &sorted {
            let rs = self.resolve(*rid)?;
            let Some(guard) = self.lock_resource_until(&rs, deadline).await else {
                metrics::counter!(crate::observability::GROUP_BOOKINGS_TOTAL, "outcome" => "timeout")
                    .increment(1);
                warn!(%group_id, resource_id = %rid, holder, "group booking gave up waiting for resource lock");
                return Ok(Reservation::Denied(DenyReason::LockTimeout(*rid)));
            };
            if guard.group_id != Some(group_id) {
                return Err(CoordinatorError::NotInGroup {
                    resource_id: *rid,
                    group_id,
                });
            }
            guards.push(guard);
        }

        // Phase 1: validate everything before touching anything.
        let now = now_ms();
        for guard in guards.iter_mut() {
            self.settle_lapsed(guard, now);
            if guard.status != ResourceStatus::Available {
                metrics::counter!(crate::observability::GROUP_BOOKINGS_TOTAL, "outcome" => "denied")
                    .increment(1);
                info!(%group_id, resource_id = %guard.id, holder, status = %guard.status, "group booking denied");
                return Ok(Reservation::Denied(DenyReason::NotAvailable {
                    resource_id: guard.id,
                    status: guard.status,
                }));
            }
        }

        // Phase 2: all validated, commit every resource.
        let booking_id = Ulid::new();
        let mut total = 0.0;
        for guard in guards.iter_mut() {
            let price = pricing.price(guard.weight);
            total += price;
            guard.claim = Some(Claim {
                holder: holder.to_string(),
                price,
                expires_at: None,
                generation: guard.generation,
                booking_id: Some(booking_id),
            });
            set_status(guard, ResourceStatus::Booked, false);
        }

        let booking = GroupBooking {
            id: booking_id,
            group_id,
            holder: holder.to_string(),
            resource_ids: resource_ids.to_vec(),
            total,
            status: BookingStatus::Confirmed,
            booked_at: now,
        };
        self.bookings.insert(booking_id, booking.clone());

        metrics::counter!(crate::observability::GROUP_BOOKINGS_TOTAL, "outcome" => "booked")
            .increment(1);
        info!(%group_id, %booking_id, holder, seats = resource_ids.len(), total, "group booked");
        self.notify().send(
            group_id,
            &Event::GroupBooked {
                booking_id,
                group_id,
                holder: holder.to_string(),
                resource_ids: resource_ids.to_vec(),
                total,
            },
        );

        Ok(Reservation::Granted(booking))
    }

    /// Book resources of a group by display name (e.g. `["A1", "A2"]`).
    /// Unknown names are `NotFound` for the group.
    pub async fn book_group_by_name(
        &self,
        group_id: Ulid,
        holder: &str,
        names: &[&str],
        pricing: &dyn PricingStrategy,
    ) -> Result<Reservation<GroupBooking>, CoordinatorError> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = self
                .registry
                .find_in_group(&group_id, name)
                .await
                .ok_or(CoordinatorError::NotFound(group_id))?;
            ids.push(id);
        }
        self.book_group(group_id, holder, &ids, pricing).await
    }

    /// Release every resource of a confirmed group booking.
    pub async fn cancel_group(&self, booking_id: Ulid, holder: &str) -> Result<(), CoordinatorError> {
        let (group_id, resource_ids) = {
            let booking = self
                .bookings
                .get(&booking_id)
                .ok_or(CoordinatorError::UnknownBooking(booking_id))?;
            if booking.status == BookingStatus::Cancelled {
                return Err(CoordinatorError::AlreadyCancelled(booking_id));
            }
            (booking.group_id, booking.resource_ids.clone())
        };

        let group_lock = self
            .registry
            .group_lock(&group_id)
            .ok_or(CoordinatorError::NotFound(group_id))?;
        let deadline = self.lock_deadline();
        let _group_guard = tokio::time::timeout_at(deadline, group_lock.lock_owned())
            .await
            .map_err(|_| CoordinatorError::LockTimeout(group_id))?;

        // Re-check under the group lock: a concurrent cancel may have won.
        {
            let booking = self
                .bookings
                .get(&booking_id)
                .ok_or(CoordinatorError::UnknownBooking(booking_id))?;
            if booking.status == BookingStatus::Cancelled {
                return Err(CoordinatorError::AlreadyCancelled(booking_id));
            }
            if self.settings.holder_policy == crate::config::HolderPolicy::Strict
                && booking.holder != holder
            {
                return Err(CoordinatorError::NotHolder {
                    resource_id: booking_id,
                    holder: holder.to_string(),
                });
            }
        }

        let mut sorted = resource_ids.clone();
        sorted.sort();
        let mut guards = Vec::with_capacity(sorted.len());
        for rid in &sorted {
            let rs = self.resolve(*rid)?;
            let guard = self
                .lock_resource_until(&rs, deadline)
                .await
                .ok_or(CoordinatorError::LockTimeout(*rid))?;
            guards.push(guard);
        }

        for guard in guards.iter_mut() {
            let owned = guard
                .claim
                .as_ref()
                .is_some_and(|c| c.booking_id == Some(booking_id));
            if owned {
                guard.claim = None;
                set_status(guard, ResourceStatus::Available, true);
            }
        }
        if let Some(mut booking) = self.bookings.get_mut(&booking_id) {
            booking.status = BookingStatus::Cancelled;
        }

        info!(%group_id, %booking_id, "group booking cancelled");
        self.notify().send(
            group_id,
            &Event::GroupCancelled {
                booking_id,
                group_id,
                resource_ids,
            },
        );
        Ok(())
    }
}
