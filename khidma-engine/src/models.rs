//! Core data models for the marketplace lifecycle
//!
//! Jobs, offers, escrows and disputes, together with their state
//! machines. Records carry a version counter used for conditional
//! writes; the store is the sole arbiter of which writer wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::money::Money;
use crate::EngineResult;

pub type JobId = Uuid;
pub type OfferId = Uuid;
pub type EscrowId = Uuid;
pub type UserId = Uuid;

/// Job lifecycle state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Created by the poster, not yet published
    Draft,
    /// Published and accepting offers
    Open,
    /// At least one offer received
    Offered,
    /// An offer was accepted; escrow is held
    Accepted,
    /// Worker has started the work
    InProgress,
    /// Work submitted, awaiting poster review
    Submitted,
    /// Work approved and escrow settled
    Completed,
    /// Cancelled by the poster
    Cancelled,
    /// A dispute was raised; frozen until admin resolution
    Disputed,
    /// Expired unfilled after 30 days
    Expired,
}

impl JobStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Check if this state accepts new offers
    pub fn accepts_offers(&self) -> bool {
        matches!(self, Self::Open | Self::Offered)
    }

    /// Check if work has begun (used for the cancellation fee rule)
    pub fn work_begun(&self) -> bool {
        matches!(self, Self::Accepted | Self::InProgress | Self::Submitted)
    }

    /// Check if this state allows the poster to cancel
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            Self::Draft | Self::Open | Self::Offered | Self::Accepted | Self::InProgress
        )
    }

    /// Check if this state is eligible for 30-day expiry
    pub fn can_expire(&self) -> bool {
        matches!(self, Self::Draft | Self::Open | Self::Offered)
    }

    /// Check if this state allows raising a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Accepted | Self::InProgress | Self::Submitted)
    }
}

/// Moderation status, orthogonal to the lifecycle status. A job must be
/// approved before it is visible to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    PendingReview,
    Approved,
    Rejected,
}

/// Budget for a job: a fixed amount or a negotiable range.
/// Resolved once at ingestion, never re-interpreted downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Budget {
    Fixed { amount: Money },
    Range { min: Money, max: Money },
}

impl Budget {
    /// Currency code of the budget
    pub fn currency(&self) -> &str {
        match self {
            Self::Fixed { amount } => amount.currency(),
            Self::Range { min, .. } => min.currency(),
        }
    }

    /// Validate the budget is well formed and positive
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self::Fixed { amount } => {
                if amount.is_zero() {
                    return Err(EngineError::validation("budget must be positive"));
                }
            }
            Self::Range { min, max } => {
                if max.is_zero() {
                    return Err(EngineError::validation("budget must be positive"));
                }
                if min.currency() != max.currency() {
                    return Err(EngineError::validation("budget range mixes currencies"));
                }
                if min.minor_units() > max.minor_units() {
                    return Err(EngineError::validation("budget range min exceeds max"));
                }
            }
        }
        Ok(())
    }
}

/// Job location: free text or geocoded coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    FreeText {
        text: String,
    },
    Geocoded {
        address: String,
        latitude: f64,
        longitude: f64,
    },
}

/// Job model representing a marketplace posting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub budget: Budget,
    pub location: Location,
    pub skills: Vec<String>,
    pub is_urgent: bool,
    pub status: JobStatus,
    pub moderation: ModerationStatus,

    // Parties
    pub client_id: UserId,
    pub freelancer_id: Option<UserId>,

    // Linkage, set once and never re-pointed
    pub accepted_offer_id: Option<OfferId>,
    pub escrow_id: Option<EscrowId>,

    // Moderation audit
    pub reviewed_by: Option<UserId>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,

    /// Conditional-write counter; bumped by the store on every put
    pub version: u64,
}

impl Job {
    /// Create a new job in draft, pending moderation review.
    /// `expiry` is the unfilled-job lifetime (30 days in production).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        title: String,
        description: String,
        category: String,
        budget: Budget,
        location: Location,
        skills: Vec<String>,
        is_urgent: bool,
        client_id: UserId,
        now: DateTime<Utc>,
        expiry: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            category,
            budget,
            location,
            skills,
            is_urgent,
            status: JobStatus::Draft,
            moderation: ModerationStatus::PendingReview,
            client_id,
            freelancer_id: None,
            accepted_offer_id: None,
            escrow_id: None,
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: now + expiry,
            version: 1,
        }
    }

    /// Validate a command against the current status. Terminal states
    /// reject everything; other mismatches name the attempted command.
    pub fn require_status(&self, expected: &[JobStatus], command: &str) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::JobTerminal(self.status));
        }
        if !expected.contains(&self.status) {
            return Err(EngineError::invalid_transition(self.status, command));
        }
        Ok(())
    }

    /// Check the actor is the job's client
    pub fn require_client(&self, actor: UserId) -> EngineResult<()> {
        if actor != self.client_id {
            return Err(EngineError::not_authorized(
                "only the job's client may perform this action",
            ));
        }
        Ok(())
    }

    /// Check the actor is the assigned freelancer
    pub fn require_freelancer(&self, actor: UserId) -> EngineResult<()> {
        if self.freelancer_id != Some(actor) {
            return Err(EngineError::not_authorized(
                "only the assigned freelancer may perform this action",
            ));
        }
        Ok(())
    }
}

/// Offer state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A worker's bid on a job. Terminal on accept or reject; never
/// mutated after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub job_id: JobId,
    pub freelancer_id: UserId,
    pub price: Money,
    pub message: String,
    pub status: OfferStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub fn new(
        job_id: JobId,
        freelancer_id: UserId,
        price: Money,
        message: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            freelancer_id,
            price,
            message,
            status: OfferStatus::Pending,
            created_at: now,
            accepted_at: None,
        }
    }
}

/// Escrow state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Created but funds not yet confirmed held
    Pending,
    /// Funds held, awaiting completion or refund
    Held,
    /// Settled to the freelancer (minus platform share)
    Released,
    /// Returned to the client (minus any cancellation fee)
    Refunded,
    /// Frozen pending admin resolution
    Disputed,
    /// Closed by admin dispute decision
    Resolved,
}

impl EscrowStatus {
    /// Check if this is a terminal state; a terminal escrow is an
    /// immutable financial record.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Resolved)
    }
}

/// Who raised a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeParty {
    Client,
    Freelancer,
}

/// Admin decision closing a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisputeDecision {
    /// Full settlement to the freelancer (standard 90/10 split)
    ReleaseToFreelancer,
    /// Full refund to the client, no fee
    RefundToClient,
    /// Split the post-fee net between the parties
    Split { percent_to_freelancer: u8 },
}

/// Dispute sub-record held on the escrow while in `Disputed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub raised_by: DisputeParty,
    pub reason: String,
    pub evidence: Vec<String>,
    pub raised_at: DateTime<Utc>,
    pub decision: Option<DisputeDecision>,
    pub admin_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Final money movement recorded when an escrow reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub to_freelancer: Money,
    pub to_client: Money,
    pub to_platform: Money,
    pub note: String,
    pub settled_at: DateTime<Utc>,
}

/// Escrow transaction backing an accepted offer. Never deleted;
/// retained as an immutable financial record once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub job_id: JobId,
    pub offer_id: OfferId,
    pub client_id: UserId,
    pub freelancer_id: UserId,

    // Amounts, all computed once at creation
    pub amount: Money,
    pub client_fee: Money,
    pub freelancer_fee: Money,
    /// Advisory only; not deducted from settlement unless the product
    /// layer opts in
    pub zakat: Money,

    pub status: EscrowStatus,
    pub auto_release_deadline: DateTime<Utc>,

    pub dispute: Option<Dispute>,
    pub settlement: Option<Settlement>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Conditional-write counter; bumped by the store on every put
    pub version: u64,
}

impl Escrow {
    /// Check the escrow is still held, i.e. release/refund/dispute are
    /// permitted
    pub fn require_held(&self) -> EngineResult<()> {
        if self.status != EscrowStatus::Held {
            return Err(EngineError::EscrowNotHeld);
        }
        Ok(())
    }

    /// Check the escrow is under dispute
    pub fn require_disputed(&self) -> EngineResult<()> {
        if self.status != EscrowStatus::Disputed {
            return Err(EngineError::EscrowNotDisputed);
        }
        Ok(())
    }
}
