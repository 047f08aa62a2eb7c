//! Error types for the lifecycle engine
//!
//! Every failed precondition surfaces as a typed error; the engine never
//! swallows an error or returns a bare boolean for a business-rule
//! violation. Infrastructure faults are kept distinct from business
//! errors so callers can apply their own retry policy.

use thiserror::Error;

use crate::models::JobStatus;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Command not valid from the job's current status
    #[error("invalid transition: {attempted} not allowed from {current:?}")]
    InvalidTransition {
        current: JobStatus,
        attempted: String,
    },

    /// Command attempted against a job in a terminal status
    #[error("job is terminal ({0:?}); no further commands accepted")]
    JobTerminal(JobStatus),

    /// Actor is not the client/freelancer the operation requires
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Losing side of the offer-acceptance race
    #[error("job already accepted by another offer")]
    JobAlreadyAccepted,

    /// Offer is no longer pending
    #[error("offer is not pending")]
    OfferNotPending,

    /// Job is not accepting offers in its current status
    #[error("job is not open for offers")]
    JobNotOpenForOffers,

    /// Escrow precondition violations
    #[error("escrow is not held")]
    EscrowNotHeld,

    #[error("escrow is not disputed")]
    EscrowNotDisputed,

    /// A job may carry at most one escrow
    #[error("escrow already exists for job")]
    EscrowAlreadyExists,

    /// Optimistic-concurrency conflict; caller may retry once after
    /// re-reading current state
    #[error("concurrent modification of {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: String },

    /// Monetary computation went below zero; indicates an upstream bug
    #[error("monetary computation produced a negative result: {0}")]
    NegativeResult(String),

    /// Monetary computation exceeded the representable range
    #[error("monetary computation overflowed: {0}")]
    Overflow(String),

    /// Arithmetic across different currency codes
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    /// Entity lookup failures
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Request validation errors
    #[error("validation error: {0}")]
    Validation(String),

    /// Store infrastructure failure; retried by the caller's policy
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create an invalid-transition error
    pub fn invalid_transition<S: Into<String>>(current: JobStatus, attempted: S) -> Self {
        Self::InvalidTransition {
            current,
            attempted: attempted.into(),
        }
    }

    /// Create a not-authorized error
    pub fn not_authorized<S: Into<String>>(msg: S) -> Self {
        Self::NotAuthorized(msg.into())
    }

    /// Create a concurrent-modification error
    pub fn concurrent_modification<S: ToString>(entity: &'static str, id: S) -> Self {
        Self::ConcurrentModification {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: ToString>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a store-unavailable error
    pub fn store_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Whether the caller may retry the whole command after re-reading state
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::StoreUnavailable(_)
        )
    }
}
