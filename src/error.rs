use thiserror::Error;

/// Errors surfaced by tiers, the tier chain, and drain cycles.
#[derive(Debug, Error)]
pub enum Error {
    /// The tier (or the queue within it) is over its byte or disk budget.
    #[error("tier '{tier}' is full for queue '{queue}'")]
    CapacityExceeded { tier: String, queue: String },

    #[error("tier '{tier}' is closed")]
    TierClosed { tier: String },

    /// A cached session broke; the pool evicts it before this is returned.
    #[error("session '{key}' faulted: {reason}")]
    SessionFault { key: String, reason: String },

    /// The sink or the commit failed during a drain cycle.
    #[error("delivery failed on queue '{queue}': {reason}")]
    DeliveryFailure { queue: String, reason: String },

    #[error("queue '{0}' is not registered")]
    UnknownQueue(String),

    #[error("partition {partition} out of range for queue '{queue}'")]
    UnknownPartition { queue: String, partition: usize },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] crate::core::Error),
}

impl Error {
    pub fn capacity(tier: &str, queue: &str) -> Self {
        Error::CapacityExceeded {
            tier: tier.to_string(),
            queue: queue.to_string(),
        }
    }

    pub fn closed(tier: &str) -> Self {
        Error::TierClosed {
            tier: tier.to_string(),
        }
    }

    pub fn session_fault(key: &str, reason: impl std::fmt::Display) -> Self {
        Error::SessionFault {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }

    pub fn is_session_fault(&self) -> bool {
        matches!(self, Error::SessionFault { .. })
    }

    pub fn is_tier_closed(&self) -> bool {
        matches!(self, Error::TierClosed { .. })
    }

    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, Error::DeliveryFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
