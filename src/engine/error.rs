use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval: {0}")]
    InvalidInterval(&'static str),
    #[error("conflicts with {0}")]
    Conflict(Ulid),
    #[error("class {0} is full")]
    Full(Ulid),
    #[error("class {0} is not open for booking")]
    Inactive(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("{0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("{0} is already completed")]
    AlreadyCompleted(Ulid),
    #[error("booking {0} starts in less than {1}h and can no longer be cancelled")]
    TooLate(Ulid, i64),
    #[error("{0} service unavailable")]
    DependencyUnavailable(&'static str),
    #[error("schedule {0} is not pending approval")]
    NotPending(Ulid),
    #[error("class {0} has {1} participants; cancel it instead")]
    HasParticipants(Ulid, u32),
    #[error("invalid capacity {0}")]
    InvalidCapacity(u32),
    #[error("outside the trainer's offered availability")]
    OutsideAvailability,
    #[error("monthly limit of {0} personal sessions reached")]
    SessionLimitReached(u32),
    #[error("no active subscription")]
    SubscriptionInactive,
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) | EngineError::InvalidCapacity(_) => "22023",
            EngineError::Conflict(_) => "23P01",
            EngineError::Full(_) => "53000",
            EngineError::Inactive(_)
            | EngineError::AlreadyCancelled(_)
            | EngineError::AlreadyCompleted(_)
            | EngineError::NotPending(_)
            | EngineError::TooLate(..) => "55000",
            EngineError::NotFound(_) => "P0002",
            EngineError::DependencyUnavailable(_) => "58000",
            EngineError::HasParticipants(..) => "2BP01",
            EngineError::OutsideAvailability => "23514",
            EngineError::SessionLimitReached(_) => "53400",
            EngineError::SubscriptionInactive => "42501",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Storage(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval(_) => "invalid_interval",
            EngineError::Conflict(_) => "conflict",
            EngineError::Full(_) => "full",
            EngineError::Inactive(_) => "inactive",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::AlreadyCompleted(_) => "already_completed",
            EngineError::TooLate(..) => "too_late",
            EngineError::DependencyUnavailable(_) => "dependency_unavailable",
            EngineError::NotPending(_) => "not_pending",
            EngineError::HasParticipants(..) => "has_participants",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::OutsideAvailability => "outside_availability",
            EngineError::SessionLimitReached(_) => "session_limit_reached",
            EngineError::SubscriptionInactive => "subscription_inactive",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }
}
