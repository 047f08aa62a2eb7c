//! Outbound notifications
//!
//! The engine emits a domain event after each committed transition and
//! hands it to a `NotificationSink`. Delivery is fire-and-forget: a
//! sink failure is logged and suppressed, never rolled back into the
//! state transition that triggered it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::EngineError;
use crate::models::{DisputeDecision, DisputeParty, EscrowId, JobId, OfferId, UserId};
use crate::money::Money;
use crate::EngineResult;

/// Domain event emitted after a committed transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    JobSubmittedForReview { job_id: JobId },
    JobApproved { job_id: JobId },
    JobRejected { job_id: JobId, reason: String },
    OfferReceived { job_id: JobId, offer_id: OfferId, price: Money },
    OfferAccepted { job_id: JobId, offer_id: OfferId },
    OfferRejected { job_id: JobId, offer_id: OfferId },
    WorkStarted { job_id: JobId },
    WorkSubmitted { job_id: JobId },
    WorkApproved { job_id: JobId, amount: Money },
    EscrowAutoReleased { job_id: JobId, escrow_id: EscrowId, amount: Money },
    EscrowRefunded { job_id: JobId, escrow_id: EscrowId, amount: Money },
    DisputeRaised { job_id: JobId, raised_by: DisputeParty, reason: String },
    DisputeResolved { job_id: JobId, decision: DisputeDecision },
    JobCancelled { job_id: JobId, reason: Option<String> },
    JobExpired { job_id: JobId },
}

/// A notification addressed to one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub event: DomainEvent,
}

/// Abstract outbound notifier
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: UserId, event: DomainEvent) -> EngineResult<()>;
}

/// Deliver a notification, logging and swallowing any sink failure.
pub(crate) async fn notify_quietly(
    sink: &Arc<dyn NotificationSink>,
    user_id: UserId,
    event: DomainEvent,
) {
    if let Err(err) = sink.notify(user_id, event.clone()).await {
        warn!(%user_id, ?event, %err, "notification delivery failed; transition stands");
    }
}

/// Channel-backed sink. Decouples delivery from the transactional core:
/// a separate worker drains the receiver and talks to the push/SMS/email
/// providers.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, user_id: UserId, event: DomainEvent) -> EngineResult<()> {
        self.tx
            .send(Notification { user_id, event })
            .map_err(|e| EngineError::store_unavailable(format!("notification channel closed: {e}")))
    }
}

/// Captures notifications in memory for assertions in tests.
#[derive(Default)]
pub struct MemorySink {
    sent: tokio::sync::Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, user_id: UserId, event: DomainEvent) -> EngineResult<()> {
        self.sent.lock().await.push(Notification { user_id, event });
        Ok(())
    }
}
