use ulid::Ulid;

use crate::model::ResourceStatus;

/// Structural failures of a coordinator call. Contention is not an error; it
/// comes back as [`super::Reservation::Denied`].
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    NotFound(Ulid),
    UnknownBooking(Ulid),
    NotInGroup {
        resource_id: Ulid,
        group_id: Ulid,
    },
    InvalidState {
        resource_id: Ulid,
        status: ResourceStatus,
        operation: &'static str,
    },
    AlreadyCancelled(Ulid),
    NotHolder {
        resource_id: Ulid,
        holder: String,
    },
    /// The resource is part of a group booking and must be released through it.
    GroupOwned {
        resource_id: Ulid,
        booking_id: Ulid,
    },
    DuplicateResource(Ulid),
    LockTimeout(Ulid),
    LimitExceeded(&'static str),
}

impl CoordinatorError {
    /// Wrong-state failures, as opposed to unknown ids or bad arguments.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvalidState { .. } | CoordinatorError::AlreadyCancelled(_)
        )
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::NotFound(id) => write!(f, "not found: {id}"),
            CoordinatorError::UnknownBooking(id) => write!(f, "unknown booking: {id}"),
            CoordinatorError::NotInGroup {
                resource_id,
                group_id,
            } => write!(f, "resource {resource_id} is not a member of group {group_id}"),
            CoordinatorError::InvalidState {
                resource_id,
                status,
                operation,
            } => write!(f, "cannot {operation} resource {resource_id}: status is {status}"),
            CoordinatorError::AlreadyCancelled(id) => {
                write!(f, "booking {id} is already cancelled")
            }
            CoordinatorError::NotHolder {
                resource_id,
                holder,
            } => write!(f, "{holder} does not hold resource {resource_id}"),
            CoordinatorError::GroupOwned {
                resource_id,
                booking_id,
            } => write!(
                f,
                "resource {resource_id} belongs to group booking {booking_id}"
            ),
            CoordinatorError::DuplicateResource(id) => {
                write!(f, "resource {id} listed more than once")
            }
            CoordinatorError::LockTimeout(id) => {
                write!(f, "timed out waiting for lock on {id}")
            }
            CoordinatorError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}
