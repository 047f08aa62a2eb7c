//! Escrow Manager - holds, settles and disputes escrowed funds
//!
//! Owns `Escrow` entities. Every settlement path (release, refund,
//! dispute resolution, auto-release) goes through a version-keyed
//! conditional write, so an escrow transitions to a terminal state
//! exactly once even under concurrent callers.

use chrono::Duration;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::models::{
    Dispute, DisputeDecision, DisputeParty, Escrow, EscrowId, EscrowStatus, JobId, JobStatus,
    OfferId, Settlement, UserId,
};
use crate::money::Money;
use crate::notifier::{notify_quietly, DomainEvent, NotificationSink};
use crate::store::Store;
use crate::EngineResult;

/// Configuration for the escrow manager
#[derive(Debug, Clone)]
pub struct EscrowManagerConfig {
    /// Client-side fee in basis points
    pub client_fee_bp: u32,
    /// Freelancer-side fee in basis points; equals the platform's share
    /// of a release
    pub freelancer_fee_bp: u32,
    /// Advisory zakat in basis points; computed but never deducted
    pub zakat_bp: u32,
    /// Fee withheld from a refund when work had already begun
    pub cancellation_fee_bp: u32,
    /// Freelancer's percentage of a standard release
    pub release_split_percent: u8,
    /// Grace period before a submitted job auto-releases
    pub auto_release_hours: i64,
}

impl Default for EscrowManagerConfig {
    fn default() -> Self {
        Self {
            client_fee_bp: 500,        // 5%
            freelancer_fee_bp: 1_000,  // 10%
            zakat_bp: 250,             // 2.5%
            cancellation_fee_bp: 1_000, // 10%
            release_split_percent: 90,
            auto_release_hours: 72,
        }
    }
}

/// Manages escrow creation, settlement and disputes
pub struct EscrowManager {
    config: EscrowManagerConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
}

impl EscrowManager {
    pub fn new(
        config: EscrowManagerConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            sink,
        }
    }

    pub fn config(&self) -> &EscrowManagerConfig {
        &self.config
    }

    /// Create and hold an escrow the instant an offer is accepted.
    /// Fees are computed once here and never re-derived.
    pub async fn create(
        &self,
        job_id: JobId,
        offer_id: OfferId,
        client_id: UserId,
        freelancer_id: UserId,
        amount: Money,
    ) -> EngineResult<Escrow> {
        if self.store.escrow_for_job(job_id).await?.is_some() {
            return Err(EngineError::EscrowAlreadyExists);
        }

        let now = self.clock.now();
        let escrow = Escrow {
            id: Uuid::new_v4(),
            job_id,
            offer_id,
            client_id,
            freelancer_id,
            client_fee: amount.percentage_of(self.config.client_fee_bp),
            freelancer_fee: amount.percentage_of(self.config.freelancer_fee_bp),
            zakat: amount.percentage_of(self.config.zakat_bp),
            amount,
            status: EscrowStatus::Held,
            auto_release_deadline: now + Duration::hours(self.config.auto_release_hours),
            dispute: None,
            settlement: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        self.store.create_escrow(escrow.clone()).await?;
        info!(escrow_id = %escrow.id, %job_id, amount = %escrow.amount, "escrow held");
        Ok(escrow)
    }

    /// Release a held escrow to the freelancer at the standard split.
    /// The platform's share corresponds to the freelancer fee computed
    /// at creation.
    pub async fn release(
        &self,
        escrow_id: EscrowId,
        completion_notes: String,
    ) -> EngineResult<Settlement> {
        let escrow = self.store.get_escrow(escrow_id).await?;
        escrow.require_held()?;

        let settlement = self.release_settlement(&escrow, completion_notes);
        let escrow = self
            .settle(escrow, EscrowStatus::Released, settlement.clone())
            .await?;

        let event = DomainEvent::WorkApproved {
            job_id: escrow.job_id,
            amount: settlement.to_freelancer.clone(),
        };
        notify_quietly(&self.sink, escrow.freelancer_id, event.clone()).await;
        notify_quietly(&self.sink, escrow.client_id, event).await;

        info!(
            %escrow_id,
            to_freelancer = %settlement.to_freelancer,
            to_platform = %settlement.to_platform,
            "escrow released"
        );
        Ok(settlement)
    }

    /// Refund a held escrow to the client. A cancellation fee is
    /// withheld only when work had already begun.
    pub async fn refund(
        &self,
        escrow_id: EscrowId,
        reason: String,
        work_begun: bool,
    ) -> EngineResult<Money> {
        let escrow = self.store.get_escrow(escrow_id).await?;
        escrow.require_held()?;

        let fee = if work_begun {
            escrow.amount.percentage_of(self.config.cancellation_fee_bp)
        } else {
            Money::zero(escrow.amount.currency())
        };
        let refund = escrow.amount.checked_sub(&fee)?;

        let settlement = Settlement {
            to_freelancer: Money::zero(escrow.amount.currency()),
            to_client: refund.clone(),
            to_platform: fee,
            note: reason,
            settled_at: self.clock.now(),
        };
        let escrow = self
            .settle(escrow, EscrowStatus::Refunded, settlement)
            .await?;

        let event = DomainEvent::EscrowRefunded {
            job_id: escrow.job_id,
            escrow_id,
            amount: refund.clone(),
        };
        notify_quietly(&self.sink, escrow.client_id, event.clone()).await;
        notify_quietly(&self.sink, escrow.freelancer_id, event).await;

        info!(%escrow_id, amount = %refund, "escrow refunded");
        Ok(refund)
    }

    /// Freeze a held escrow pending admin resolution
    pub async fn raise_dispute(
        &self,
        escrow_id: EscrowId,
        raised_by: DisputeParty,
        reason: String,
        evidence: Vec<String>,
    ) -> EngineResult<Escrow> {
        let mut escrow = self.store.get_escrow(escrow_id).await?;
        escrow.require_held()?;

        let now = self.clock.now();
        escrow.dispute = Some(Dispute {
            raised_by,
            reason: reason.clone(),
            evidence,
            raised_at: now,
            decision: None,
            admin_notes: None,
            resolved_at: None,
        });
        escrow.status = EscrowStatus::Disputed;
        escrow.updated_at = now;
        let expected = escrow.version;
        let escrow = self.store.put_escrow_if(escrow, expected).await?;

        let event = DomainEvent::DisputeRaised {
            job_id: escrow.job_id,
            raised_by,
            reason,
        };
        notify_quietly(&self.sink, escrow.client_id, event.clone()).await;
        notify_quietly(&self.sink, escrow.freelancer_id, event).await;

        info!(%escrow_id, ?raised_by, "dispute raised; escrow frozen");
        Ok(escrow)
    }

    /// Apply an admin decision to a disputed escrow. The only path out
    /// of `Disputed`.
    pub async fn resolve_dispute(
        &self,
        escrow_id: EscrowId,
        decision: DisputeDecision,
        admin_notes: String,
    ) -> EngineResult<Settlement> {
        let mut escrow = self.store.get_escrow(escrow_id).await?;
        escrow.require_disputed()?;

        let now = self.clock.now();
        let currency = escrow.amount.currency().to_string();
        let settlement = match decision {
            DisputeDecision::ReleaseToFreelancer => {
                self.release_settlement(&escrow, admin_notes.clone())
            }
            DisputeDecision::RefundToClient => Settlement {
                to_freelancer: Money::zero(&currency),
                to_client: escrow.amount.clone(),
                to_platform: Money::zero(&currency),
                note: admin_notes.clone(),
                settled_at: now,
            },
            DisputeDecision::Split {
                percent_to_freelancer,
            } => {
                // Platform retains the freelancer fee; the net splits
                // between the parties at the admin's percentage.
                let net = escrow.amount.checked_sub(&escrow.freelancer_fee)?;
                let (to_freelancer, to_client) = net.split(percent_to_freelancer);
                Settlement {
                    to_freelancer,
                    to_client,
                    to_platform: escrow.freelancer_fee.clone(),
                    note: admin_notes.clone(),
                    settled_at: now,
                }
            }
        };

        if let Some(dispute) = escrow.dispute.as_mut() {
            dispute.decision = Some(decision);
            dispute.admin_notes = Some(admin_notes);
            dispute.resolved_at = Some(now);
        }
        let escrow = self
            .settle(escrow, EscrowStatus::Resolved, settlement.clone())
            .await?;

        let event = DomainEvent::DisputeResolved {
            job_id: escrow.job_id,
            decision,
        };
        notify_quietly(&self.sink, escrow.client_id, event.clone()).await;
        notify_quietly(&self.sink, escrow.freelancer_id, event).await;

        info!(%escrow_id, ?decision, "dispute resolved");
        Ok(settlement)
    }

    /// Sweeper-invoked: release a held escrow whose grace period has
    /// elapsed while the job sat in `submitted`. Returns true when a
    /// release happened; false is always side-effect free, so calling
    /// this on an already-settled escrow is a no-op.
    pub async fn check_auto_release(&self, escrow_id: EscrowId) -> EngineResult<bool> {
        let escrow = self.store.get_escrow(escrow_id).await?;
        if escrow.status != EscrowStatus::Held {
            return Ok(false);
        }
        if self.clock.now() < escrow.auto_release_deadline {
            return Ok(false);
        }
        let job = self.store.get_job(escrow.job_id).await?;
        if job.status != JobStatus::Submitted {
            return Ok(false);
        }

        let settlement = self.release_settlement(
            &escrow,
            "auto-released after 72 hours with no client response".to_string(),
        );
        // A concurrent settle wins cleanly; report no-op rather than error.
        let escrow = match self
            .settle(escrow, EscrowStatus::Released, settlement.clone())
            .await
        {
            Ok(escrow) => escrow,
            Err(EngineError::ConcurrentModification { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        let event = DomainEvent::EscrowAutoReleased {
            job_id: escrow.job_id,
            escrow_id,
            amount: settlement.to_freelancer.clone(),
        };
        notify_quietly(&self.sink, escrow.freelancer_id, event.clone()).await;
        notify_quietly(&self.sink, escrow.client_id, event).await;

        info!(%escrow_id, "escrow auto-released");
        Ok(true)
    }

    /// Standard release figures: freelancer/platform split of the gross
    /// amount, with the rounding remainder on the freelancer side.
    fn release_settlement(&self, escrow: &Escrow, note: String) -> Settlement {
        let (to_freelancer, to_platform) =
            escrow.amount.split(self.config.release_split_percent);
        Settlement {
            to_freelancer,
            to_client: Money::zero(escrow.amount.currency()),
            to_platform,
            note,
            settled_at: self.clock.now(),
        }
    }

    /// Conditional write moving an escrow into a terminal state.
    async fn settle(
        &self,
        mut escrow: Escrow,
        status: EscrowStatus,
        settlement: Settlement,
    ) -> EngineResult<Escrow> {
        escrow.status = status;
        escrow.settlement = Some(settlement);
        escrow.updated_at = self.clock.now();
        let expected = escrow.version;
        self.store.put_escrow_if(escrow, expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Budget, Job, Location};
    use crate::notifier::MemorySink;
    use crate::store::MemoryStore;
    use chrono::Utc;

    struct Fixture {
        manager: EscrowManager,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        sink: Arc<MemorySink>,
        job_id: JobId,
        client: UserId,
        freelancer: UserId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let sink = Arc::new(MemorySink::new());
        let client = Uuid::new_v4();
        let freelancer = Uuid::new_v4();

        let mut job = Job::new(
            "Translate brochure".into(),
            "Arabic to English, 10 pages".into(),
            "Translation".into(),
            Budget::Fixed {
                amount: Money::new(50_000, "QAR"),
            },
            Location::FreeText { text: "Doha".into() },
            vec![],
            false,
            client,
            clock.now(),
            Duration::days(30),
        );
        job.status = JobStatus::Submitted;
        job.freelancer_id = Some(freelancer);
        store.create_job(job.clone()).await.unwrap();

        let manager = EscrowManager::new(
            EscrowManagerConfig::default(),
            store.clone(),
            Arc::new(clock.clone()),
            sink.clone(),
        );
        Fixture {
            manager,
            store,
            clock,
            sink,
            job_id: job.id,
            client,
            freelancer,
        }
    }

    async fn held_escrow(fx: &Fixture) -> Escrow {
        fx.manager
            .create(
                fx.job_id,
                Uuid::new_v4(),
                fx.client,
                fx.freelancer,
                Money::new(50_000, "QAR"),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_computes_fees_and_deadline() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        assert_eq!(escrow.status, EscrowStatus::Held);
        assert_eq!(escrow.client_fee.minor_units(), 2_500); // 5% of 500.00
        assert_eq!(escrow.freelancer_fee.minor_units(), 5_000); // 10%
        assert_eq!(escrow.zakat.minor_units(), 1_250); // 2.5%
        assert_eq!(
            escrow.auto_release_deadline,
            escrow.created_at + Duration::hours(72)
        );
    }

    #[tokio::test]
    async fn second_escrow_for_same_job_is_rejected() {
        let fx = fixture().await;
        held_escrow(&fx).await;

        let err = fx
            .manager
            .create(
                fx.job_id,
                Uuid::new_v4(),
                fx.client,
                fx.freelancer,
                Money::new(10_000, "QAR"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EscrowAlreadyExists));
    }

    #[tokio::test]
    async fn release_splits_ninety_ten() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        let settlement = fx
            .manager
            .release(escrow.id, "work approved".into())
            .await
            .unwrap();
        assert_eq!(settlement.to_freelancer.minor_units(), 45_000);
        assert_eq!(settlement.to_platform.minor_units(), 5_000);

        let stored = fx.store.get_escrow(escrow.id).await.unwrap();
        assert_eq!(stored.status, EscrowStatus::Released);

        // Terminal: a second release fails
        let err = fx.manager.release(escrow.id, "again".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::EscrowNotHeld));
    }

    #[tokio::test]
    async fn refund_after_work_began_withholds_fee() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        let refund = fx
            .manager
            .refund(escrow.id, "client cancelled".into(), true)
            .await
            .unwrap();
        assert_eq!(refund.minor_units(), 45_000); // 500.00 - 10%
    }

    #[tokio::test]
    async fn refund_before_work_began_is_full() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        let refund = fx
            .manager
            .refund(escrow.id, "early cancel".into(), false)
            .await
            .unwrap();
        assert_eq!(refund.minor_units(), 50_000);
    }

    #[tokio::test]
    async fn dispute_freezes_release_and_refund() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        fx.manager
            .raise_dispute(
                escrow.id,
                DisputeParty::Freelancer,
                "non-payment of milestone".into(),
                vec!["chat-log-17".into()],
            )
            .await
            .unwrap();

        assert!(matches!(
            fx.manager.release(escrow.id, "nope".into()).await,
            Err(EngineError::EscrowNotHeld)
        ));
        assert!(matches!(
            fx.manager.refund(escrow.id, "nope".into(), true).await,
            Err(EngineError::EscrowNotHeld)
        ));
    }

    #[tokio::test]
    async fn split_resolution_divides_post_fee_net() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        fx.manager
            .raise_dispute(
                escrow.id,
                DisputeParty::Freelancer,
                "non-payment of milestone".into(),
                vec![],
            )
            .await
            .unwrap();

        let settlement = fx
            .manager
            .resolve_dispute(
                escrow.id,
                DisputeDecision::Split {
                    percent_to_freelancer: 60,
                },
                "partial delivery confirmed".into(),
            )
            .await
            .unwrap();

        // Net of the 10% platform fee: 450.00; 60/40 split
        assert_eq!(settlement.to_platform.minor_units(), 5_000);
        assert_eq!(settlement.to_freelancer.minor_units(), 27_000);
        assert_eq!(settlement.to_client.minor_units(), 18_000);

        let stored = fx.store.get_escrow(escrow.id).await.unwrap();
        assert_eq!(stored.status, EscrowStatus::Resolved);
        assert!(stored.dispute.unwrap().resolved_at.is_some());
    }

    #[tokio::test]
    async fn resolve_requires_disputed_status() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        let err = fx
            .manager
            .resolve_dispute(
                escrow.id,
                DisputeDecision::RefundToClient,
                "no dispute open".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EscrowNotDisputed));
    }

    #[tokio::test]
    async fn auto_release_fires_only_after_deadline() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        // One second before the deadline: nothing happens
        fx.clock.advance(Duration::hours(72) - Duration::seconds(1));
        assert!(!fx.manager.check_auto_release(escrow.id).await.unwrap());

        fx.clock.advance(Duration::seconds(2));
        assert!(fx.manager.check_auto_release(escrow.id).await.unwrap());

        // Idempotent: second call is a no-op returning false
        assert!(!fx.manager.check_auto_release(escrow.id).await.unwrap());
        let stored = fx.store.get_escrow(escrow.id).await.unwrap();
        assert_eq!(stored.status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn auto_release_requires_submitted_job() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;

        let mut job = fx.store.get_job(fx.job_id).await.unwrap();
        job.status = JobStatus::InProgress;
        let expected = job.version;
        fx.store.put_job_if(job, expected).await.unwrap();

        fx.clock.advance(Duration::hours(73));
        assert!(!fx.manager.check_auto_release(escrow.id).await.unwrap());
    }

    #[tokio::test]
    async fn settlement_notifies_both_parties() {
        let fx = fixture().await;
        let escrow = held_escrow(&fx).await;
        fx.manager.release(escrow.id, "done".into()).await.unwrap();

        let sent = fx.sink.sent().await;
        let recipients: Vec<UserId> = sent.iter().map(|n| n.user_id).collect();
        assert!(recipients.contains(&fx.client));
        assert!(recipients.contains(&fx.freelancer));
    }
}
