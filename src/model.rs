use ulid::Ulid;

/// Unix milliseconds. The only wall-clock time type.
pub type Ms = i64;

/// Lifecycle of a reservable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    Available,
    /// Held by someone, pending confirmation or expiry.
    Reserved,
    Booked,
}

impl ResourceStatus {
    /// Allowed edges: Available → Reserved → Booked, Reserved/Booked → Available.
    /// Available → Booked is only legal for workflows without a hold step.
    pub fn can_transition(self, to: ResourceStatus, with_hold_step: bool) -> bool {
        use ResourceStatus::*;
        match (self, to) {
            (Available, Reserved) | (Reserved, Booked) => true,
            (Reserved, Available) | (Booked, Available) => true,
            (Available, Booked) => !with_hold_step,
            _ => false,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::Available => "AVAILABLE",
            ResourceStatus::Reserved => "RESERVED",
            ResourceStatus::Booked => "BOOKED",
        };
        f.write_str(s)
    }
}

/// Physical size of a compartment or parcel, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SizeClass::Small => "SMALL",
            SizeClass::Medium => "MEDIUM",
            SizeClass::Large => "LARGE",
        };
        f.write_str(s)
    }
}

/// Who currently owns a non-available resource and on what terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub holder: String,
    /// Final price after the pricing strategy ran.
    pub price: f64,
    /// Deadline of a hold. `None` once the claim is booked.
    pub expires_at: Option<Ms>,
    /// Generation of the resource at the time the claim was made.
    pub generation: u64,
    /// Set when the claim belongs to an all-or-nothing group booking.
    pub booking_id: Option<Ulid>,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub id: Ulid,
    pub group_id: Option<Ulid>,
    pub name: Option<String>,
    /// Size class for lockers; `None` for unsized resources such as seats.
    pub size: Option<SizeClass>,
    /// Base price for seats and lockers, nominal weight for anything else.
    pub weight: f64,
    pub status: ResourceStatus,
    pub claim: Option<Claim>,
    /// Bumped on every new hold so stale expiry entries can be told apart.
    pub generation: u64,
}

impl Resource {
    pub fn new(weight: f64) -> Self {
        Self {
            id: Ulid::new(),
            group_id: None,
            name: None,
            size: None,
            weight,
            status: ResourceStatus::Available,
            claim: None,
            generation: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn sized(mut self, size: SizeClass) -> Self {
        self.size = Some(size);
        self
    }

    pub fn in_group(mut self, group_id: Ulid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// A hold whose deadline has passed but which the reaper has not
    /// processed yet.
    pub fn hold_expired(&self, now: Ms) -> bool {
        self.status == ResourceStatus::Reserved
            && self
                .claim
                .as_ref()
                .and_then(|c| c.expires_at)
                .is_some_and(|t| t <= now)
    }

    /// Status as seen at `now`, treating lapsed holds as released.
    pub fn effective_status(&self, now: Ms) -> ResourceStatus {
        if self.hold_expired(now) {
            ResourceStatus::Available
        } else {
            self.status
        }
    }

    pub fn holder(&self) -> Option<&str> {
        self.claim.as_ref().map(|c| c.holder.as_str())
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            group_id: self.group_id,
            name: self.name.clone(),
            size: self.size,
            weight: self.weight,
            status: self.status,
            holder: self.holder().map(str::to_owned),
        }
    }
}

/// Flat event types, broadcast by [`crate::notify::NotifyHub`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ResourceAdded {
        id: Ulid,
        group_id: Option<Ulid>,
    },
    HoldPlaced {
        resource_id: Ulid,
        holder: String,
        price: f64,
        expires_at: Ms,
        generation: u64,
    },
    HoldExpired {
        resource_id: Ulid,
        holder: String,
        generation: u64,
    },
    BookingConfirmed {
        resource_id: Ulid,
        holder: String,
        price: f64,
    },
    ReservationCancelled {
        resource_id: Ulid,
        holder: String,
    },
    GroupBooked {
        booking_id: Ulid,
        group_id: Ulid,
        holder: String,
        resource_ids: Vec<Ulid>,
        total: f64,
    },
    GroupCancelled {
        booking_id: Ulid,
        group_id: Ulid,
        resource_ids: Vec<Ulid>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub group_id: Option<Ulid>,
    pub name: Option<String>,
    pub size: Option<SizeClass>,
    pub weight: f64,
    pub status: ResourceStatus,
    pub holder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub members: Vec<Ulid>,
}

/// Proof of a successful hold, returned by `reserve`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hold {
    pub resource_id: Ulid,
    pub holder: String,
    pub price: f64,
    pub expires_at: Ms,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

/// A set of resources in one group booked atomically for one holder.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupBooking {
    pub id: Ulid,
    pub group_id: Ulid,
    pub holder: String,
    pub resource_ids: Vec<Ulid>,
    pub total: f64,
    pub status: BookingStatus,
    pub booked_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_hold_workflow() {
        use ResourceStatus::*;
        assert!(Available.can_transition(Reserved, true));
        assert!(Reserved.can_transition(Booked, true));
        assert!(Booked.can_transition(Available, true));
        assert!(Reserved.can_transition(Available, true));
        assert!(!Available.can_transition(Booked, true));
        assert!(Available.can_transition(Booked, false));
        assert!(!Booked.can_transition(Reserved, true));
        assert!(!Available.can_transition(Available, false));
    }

    #[test]
    fn lapsed_hold_reads_as_available() {
        let mut r = Resource::new(10.0);
        r.status = ResourceStatus::Reserved;
        r.claim = Some(Claim {
            holder: "alice".into(),
            price: 10.0,
            expires_at: Some(1_000),
            generation: 1,
            booking_id: None,
        });
        assert_eq!(r.effective_status(999), ResourceStatus::Reserved);
        assert_eq!(r.effective_status(1_000), ResourceStatus::Available);
        assert_eq!(r.holder(), Some("alice"));
    }

    #[test]
    fn booked_claim_never_expires() {
        let mut r = Resource::new(10.0);
        r.status = ResourceStatus::Booked;
        r.claim = Some(Claim {
            holder: "bob".into(),
            price: 20.0,
            expires_at: None,
            generation: 1,
            booking_id: None,
        });
        assert!(!r.hold_expired(i64::MAX));
    }
}
