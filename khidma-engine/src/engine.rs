//! Job Lifecycle Engine - orchestrates the full job state machine
//!
//! Public command surface used by the application layer. Each command
//! is a thin orchestration over the transition table plus the relevant
//! offer/escrow call. Concurrency discipline: offer acceptance
//! serializes on the Job conditional write; every money-affecting
//! transition serializes on the Escrow conditional write, and only the
//! escrow winner goes on to update the job.

use chrono::Duration;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::escrow_manager::{EscrowManager, EscrowManagerConfig};
use crate::models::{
    Budget, DisputeDecision, DisputeParty, Escrow, EscrowStatus, Job, JobId, JobStatus, Location,
    ModerationStatus, Offer, OfferId, Settlement, UserId,
};
use crate::money::Money;
use crate::notifier::{notify_quietly, DomainEvent, NotificationSink};
use crate::offer_manager::OfferManager;
use crate::store::{JobFilter, Store};
use crate::EngineResult;

/// Configuration for the lifecycle engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Days an unfilled job stays postable before expiry
    pub expiry_days: i64,
    /// Escrow fee and deadline parameters
    pub escrow: EscrowManagerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiry_days: 30,
            escrow: EscrowManagerConfig::default(),
        }
    }
}

/// Job creation request
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    pub budget: Budget,
    pub location: Location,
    pub skills: Vec<String>,
    pub is_urgent: bool,
    pub client_id: UserId,
}

/// Admin moderation decision
#[derive(Debug, Clone)]
pub enum ReviewDecision {
    Approve,
    Reject { reason: String },
}

/// Outcome of a cancellation, including any refund figures
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub refunded: bool,
    pub refund_amount: Option<Money>,
}

/// The engine: one instance per process, dependencies injected
pub struct JobLifecycleEngine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    offers: OfferManager,
    escrows: EscrowManager,
}

impl JobLifecycleEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let offers = OfferManager::new(store.clone(), clock.clone(), sink.clone());
        let escrows = EscrowManager::new(
            config.escrow.clone(),
            store.clone(),
            clock.clone(),
            sink.clone(),
        );
        Self {
            config,
            store,
            clock,
            sink,
            offers,
            escrows,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- posting & moderation ------------------------------------------

    /// Create a job in `draft`, pending moderation review
    pub async fn create_job(&self, request: CreateJobRequest) -> EngineResult<Job> {
        if request.title.trim().is_empty() {
            return Err(EngineError::validation("title is required"));
        }
        request.budget.validate()?;

        let job = Job::new(
            request.title,
            request.description,
            request.category,
            request.budget,
            request.location,
            request.skills,
            request.is_urgent,
            request.client_id,
            self.clock.now(),
            Duration::days(self.config.expiry_days),
        );
        self.store.create_job(job.clone()).await?;
        info!(job_id = %job.id, title = %job.title, "job created");
        Ok(job)
    }

    /// Publish a draft. The job becomes visible to workers only once
    /// moderation approves it.
    pub async fn post_job(&self, job_id: JobId, actor_id: UserId) -> EngineResult<Job> {
        let job = self.store.get_job(job_id).await?;
        job.require_client(actor_id)?;
        job.require_status(&[JobStatus::Draft], "post_job")?;

        let job = self.transition(job, JobStatus::Open).await?;
        notify_quietly(
            &self.sink,
            job.client_id,
            DomainEvent::JobSubmittedForReview { job_id },
        )
        .await;
        info!(%job_id, "job posted");
        Ok(job)
    }

    /// Admin moderation. Orthogonal to the lifecycle axis; a rejected
    /// job keeps its lifecycle status but stays invisible to workers.
    pub async fn review_job(
        &self,
        job_id: JobId,
        reviewer_id: UserId,
        decision: ReviewDecision,
    ) -> EngineResult<Job> {
        let mut job = self.store.get_job(job_id).await?;
        if job.moderation != ModerationStatus::PendingReview {
            return Err(EngineError::validation("job is not pending review"));
        }

        let now = self.clock.now();
        job.reviewed_by = Some(reviewer_id);
        job.reviewed_at = Some(now);
        job.updated_at = now;
        let event = match decision {
            ReviewDecision::Approve => {
                job.moderation = ModerationStatus::Approved;
                DomainEvent::JobApproved { job_id }
            }
            ReviewDecision::Reject { reason } => {
                job.moderation = ModerationStatus::Rejected;
                job.rejection_reason = Some(reason.clone());
                DomainEvent::JobRejected { job_id, reason }
            }
        };
        let expected = job.version;
        let job = self.store.put_job_if(job, expected).await?;

        notify_quietly(&self.sink, job.client_id, event).await;
        info!(%job_id, moderation = ?job.moderation, "job reviewed");
        Ok(job)
    }

    // ---- offers ---------------------------------------------------------

    /// Worker submits a bid
    pub async fn submit_offer(
        &self,
        job_id: JobId,
        freelancer_id: UserId,
        price: Money,
        message: String,
    ) -> EngineResult<Offer> {
        self.offers.submit(job_id, freelancer_id, price, message).await
    }

    /// Poster accepts a bid: wins the acceptance race, holds escrow,
    /// links it to the job.
    pub async fn accept_offer(
        &self,
        job_id: JobId,
        offer_id: OfferId,
        actor_id: UserId,
    ) -> EngineResult<Escrow> {
        let (offer, job) = self.offers.accept(job_id, offer_id, actor_id).await?;

        let escrow = self
            .escrows
            .create(
                job_id,
                offer.id,
                job.client_id,
                offer.freelancer_id,
                offer.price.clone(),
            )
            .await?;

        // Link the escrow onto the job we just wrote. Nothing else
        // writes an accepted job between these two puts.
        let mut linked = job;
        linked.escrow_id = Some(escrow.id);
        linked.updated_at = self.clock.now();
        let expected = linked.version;
        self.store.put_job_if(linked, expected).await?;

        info!(%job_id, escrow_id = %escrow.id, "offer accepted and escrow held");
        Ok(escrow)
    }

    /// Poster declines a bid
    pub async fn reject_offer(
        &self,
        job_id: JobId,
        offer_id: OfferId,
        actor_id: UserId,
    ) -> EngineResult<Offer> {
        self.offers.reject(job_id, offer_id, actor_id).await
    }

    // ---- work execution -------------------------------------------------

    /// Assigned freelancer starts the work
    pub async fn start_work(&self, job_id: JobId, actor_id: UserId) -> EngineResult<Job> {
        let job = self.store.get_job(job_id).await?;
        job.require_freelancer(actor_id)?;
        job.require_status(&[JobStatus::Accepted], "start_work")?;

        let job = self.transition(job, JobStatus::InProgress).await?;
        notify_quietly(&self.sink, job.client_id, DomainEvent::WorkStarted { job_id }).await;
        info!(%job_id, "work started");
        Ok(job)
    }

    /// Assigned freelancer submits completed work for review
    pub async fn submit_work(&self, job_id: JobId, actor_id: UserId) -> EngineResult<Job> {
        let job = self.store.get_job(job_id).await?;
        job.require_freelancer(actor_id)?;
        job.require_status(&[JobStatus::InProgress], "submit_work")?;

        let job = self.transition(job, JobStatus::Submitted).await?;
        notify_quietly(&self.sink, job.client_id, DomainEvent::WorkSubmitted { job_id }).await;
        info!(%job_id, "work submitted");
        Ok(job)
    }

    /// Poster approves the submitted work; the escrow settles at the
    /// standard split. The escrow write is the commit point.
    pub async fn approve_work(&self, job_id: JobId, actor_id: UserId) -> EngineResult<Settlement> {
        let job = self.store.get_job(job_id).await?;
        job.require_client(actor_id)?;
        job.require_status(&[JobStatus::Submitted], "approve_work")?;
        let escrow_id = job
            .escrow_id
            .ok_or_else(|| EngineError::validation("no escrow linked to this job"))?;

        // A released escrow with the job still submitted means an
        // earlier approval settled the money but lost the job write;
        // finish the job against the recorded settlement.
        let escrow = self.store.get_escrow(escrow_id).await?;
        let settlement = if escrow.status == EscrowStatus::Released {
            escrow.settlement.ok_or_else(|| {
                EngineError::validation("released escrow carries no settlement")
            })?
        } else {
            self.escrows
                .release(escrow_id, "work approved by client".to_string())
                .await?
        };
        self.complete(job).await?;

        info!(%job_id, "work approved and escrow released");
        Ok(settlement)
    }

    /// Either party raises a dispute; the escrow freezes first, then
    /// the job follows.
    pub async fn dispute_work(
        &self,
        job_id: JobId,
        actor_id: UserId,
        reason: String,
        evidence: Vec<String>,
    ) -> EngineResult<Job> {
        let job = self.store.get_job(job_id).await?;
        let raised_by = if actor_id == job.client_id {
            DisputeParty::Client
        } else if job.freelancer_id == Some(actor_id) {
            DisputeParty::Freelancer
        } else {
            return Err(EngineError::not_authorized(
                "only the client or assigned freelancer may dispute",
            ));
        };
        job.require_status(
            &[JobStatus::Accepted, JobStatus::InProgress, JobStatus::Submitted],
            "dispute_work",
        )?;
        let escrow_id = job
            .escrow_id
            .ok_or_else(|| EngineError::validation("no escrow linked to this job"))?;

        self.escrows
            .raise_dispute(escrow_id, raised_by, reason, evidence)
            .await?;
        let job = self.transition(job, JobStatus::Disputed).await?;

        info!(%job_id, ?raised_by, "job disputed");
        Ok(job)
    }

    /// Admin closes a dispute. The decision settles the escrow and
    /// moves the job to completed (funds reached the freelancer, fully
    /// or partially) or cancelled (full refund to the client).
    pub async fn resolve_dispute(
        &self,
        job_id: JobId,
        decision: DisputeDecision,
        admin_notes: String,
    ) -> EngineResult<Settlement> {
        let job = self.store.get_job(job_id).await?;
        job.require_status(&[JobStatus::Disputed], "resolve_dispute")?;
        let escrow_id = job
            .escrow_id
            .ok_or_else(|| EngineError::validation("no escrow linked to this job"))?;

        let settlement = self
            .escrows
            .resolve_dispute(escrow_id, decision, admin_notes)
            .await?;

        match decision {
            DisputeDecision::RefundToClient => {
                self.transition(job, JobStatus::Cancelled).await?;
            }
            DisputeDecision::ReleaseToFreelancer | DisputeDecision::Split { .. } => {
                self.complete(job).await?;
            }
        }

        info!(%job_id, ?decision, "dispute closed");
        Ok(settlement)
    }

    // ---- cancellation & expiry ------------------------------------------

    /// Poster cancels. Before acceptance there is no escrow and no
    /// monetary effect; after acceptance the escrow refunds minus the
    /// cancellation fee.
    pub async fn cancel_job(
        &self,
        job_id: JobId,
        actor_id: UserId,
        reason: Option<String>,
    ) -> EngineResult<CancelOutcome> {
        let job = self.store.get_job(job_id).await?;
        job.require_client(actor_id)?;
        job.require_status(
            &[
                JobStatus::Draft,
                JobStatus::Open,
                JobStatus::Offered,
                JobStatus::Accepted,
                JobStatus::InProgress,
            ],
            "cancel_job",
        )?;

        let outcome = if job.status.work_begun() {
            let escrow_id = job
                .escrow_id
                .ok_or_else(|| EngineError::validation("no escrow linked to this job"))?;
            let refund = self
                .escrows
                .refund(
                    escrow_id,
                    reason.clone().unwrap_or_else(|| "job cancelled".to_string()),
                    true,
                )
                .await?;
            CancelOutcome {
                refunded: true,
                refund_amount: Some(refund),
            }
        } else {
            CancelOutcome {
                refunded: false,
                refund_amount: None,
            }
        };

        let job = self.transition(job, JobStatus::Cancelled).await?;
        if let Some(freelancer_id) = job.freelancer_id {
            notify_quietly(
                &self.sink,
                freelancer_id,
                DomainEvent::JobCancelled { job_id, reason },
            )
            .await;
        }

        info!(%job_id, refunded = outcome.refunded, "job cancelled");
        Ok(outcome)
    }

    /// Sweeper-invoked: expire an unfilled job 30 days after creation.
    /// Returns false with no side effect when the job is not eligible,
    /// including at any instant before the exact deadline.
    pub async fn expire_job(&self, job_id: JobId) -> EngineResult<bool> {
        let job = self.store.get_job(job_id).await?;
        if !job.status.can_expire() {
            return Ok(false);
        }
        if self.clock.now() < job.expires_at {
            return Ok(false);
        }

        // No escrow exists before acceptance, so expiry is a zero-fee
        // status change only.
        let job = match self.transition(job, JobStatus::Expired).await {
            Ok(job) => job,
            Err(EngineError::ConcurrentModification { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        notify_quietly(&self.sink, job.client_id, DomainEvent::JobExpired { job_id }).await;
        info!(%job_id, "job expired");
        Ok(true)
    }

    /// Sweeper-invoked: settle a submitted job whose 72-hour review
    /// window lapsed. Returns false with no side effect otherwise.
    pub async fn auto_release(&self, job_id: JobId) -> EngineResult<bool> {
        let job = self.store.get_job(job_id).await?;
        if job.status != JobStatus::Submitted {
            return Ok(false);
        }
        let Some(escrow_id) = job.escrow_id else {
            return Ok(false);
        };

        // Reconcile a settlement whose job write was lost.
        let escrow = self.store.get_escrow(escrow_id).await?;
        if escrow.status == EscrowStatus::Released {
            self.complete(job).await?;
            info!(%job_id, "job completed against already-released escrow");
            return Ok(true);
        }

        if !self.escrows.check_auto_release(escrow_id).await? {
            return Ok(false);
        }
        self.complete(job).await?;
        info!(%job_id, "job auto-completed after review window");
        Ok(true)
    }

    // ---- read side ------------------------------------------------------

    pub async fn job(&self, job_id: JobId) -> EngineResult<Job> {
        self.store.get_job(job_id).await
    }

    pub async fn offers_for_job(&self, job_id: JobId) -> EngineResult<Vec<Offer>> {
        self.store.offers_for_job(job_id).await
    }

    pub async fn escrow_for_job(&self, job_id: JobId) -> EngineResult<Option<Escrow>> {
        self.store.escrow_for_job(job_id).await
    }

    /// Jobs visible to workers: approved by moderation and still
    /// accepting offers.
    pub async fn open_jobs(&self, category: Option<String>) -> EngineResult<Vec<Job>> {
        self.store
            .query_jobs(JobFilter {
                statuses: Some(vec![JobStatus::Open, JobStatus::Offered]),
                category,
                approved_only: true,
                ..Default::default()
            })
            .await
    }

    pub async fn jobs_for_client(&self, client_id: UserId) -> EngineResult<Vec<Job>> {
        self.store
            .query_jobs(JobFilter {
                client_id: Some(client_id),
                ..Default::default()
            })
            .await
    }

    // ---- internals ------------------------------------------------------

    /// Conditional write moving the job to a new status
    async fn transition(&self, mut job: Job, to: JobStatus) -> EngineResult<Job> {
        job.status = to;
        job.updated_at = self.clock.now();
        let expected = job.version;
        self.store.put_job_if(job, expected).await
    }

    /// Move a job to completed, stamping `completed_at`
    async fn complete(&self, mut job: Job) -> EngineResult<Job> {
        let now = self.clock.now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.updated_at = now;
        let expected = job.version;
        self.store.put_job_if(job, expected).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{EscrowStatus, OfferStatus};
    use crate::notifier::MemorySink;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        engine: JobLifecycleEngine,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        client: UserId,
        freelancer: UserId,
        admin: UserId,
    }

    fn qar(minor: u64) -> Money {
        Money::new(minor, "QAR")
    }

    fn fixture() -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let sink = Arc::new(MemorySink::new());
        let engine = JobLifecycleEngine::new(
            EngineConfig::default(),
            store.clone(),
            Arc::new(clock.clone()),
            sink,
        );
        Fixture {
            engine,
            store,
            clock,
            client: Uuid::new_v4(),
            freelancer: Uuid::new_v4(),
            admin: Uuid::new_v4(),
        }
    }

    fn request(client: UserId) -> CreateJobRequest {
        CreateJobRequest {
            title: "Deep clean villa".into(),
            description: "Four bedrooms, two floors".into(),
            category: "Cleaning".into(),
            budget: Budget::Fixed { amount: qar(50_000) },
            location: Location::FreeText { text: "Doha".into() },
            skills: vec!["cleaning".into()],
            is_urgent: false,
            client_id: client,
        }
    }

    /// Drive a job up to an accepted offer with held escrow
    async fn accepted_job(fx: &Fixture) -> (JobId, Escrow) {
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(job.id, fx.client).await.unwrap();
        fx.engine
            .review_job(job.id, fx.admin, ReviewDecision::Approve)
            .await
            .unwrap();
        let offer = fx
            .engine
            .submit_offer(job.id, fx.freelancer, qar(50_000), "available now".into())
            .await
            .unwrap();
        let escrow = fx
            .engine
            .accept_offer(job.id, offer.id, fx.client)
            .await
            .unwrap();
        (job.id, escrow)
    }

    #[tokio::test]
    async fn create_job_starts_draft_pending_review() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        assert_eq!(job.status, JobStatus::Draft);
        assert_eq!(job.moderation, ModerationStatus::PendingReview);
        assert_eq!(job.expires_at, job.created_at + Duration::days(30));
    }

    #[tokio::test]
    async fn create_job_validates_fields() {
        let fx = fixture();
        let mut bad = request(fx.client);
        bad.title = "   ".into();
        assert!(matches!(
            fx.engine.create_job(bad).await,
            Err(EngineError::Validation(_))
        ));

        let mut bad = request(fx.client);
        bad.budget = Budget::Fixed { amount: qar(0) };
        assert!(matches!(
            fx.engine.create_job(bad).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn full_happy_path_settles_ninety_ten() {
        // Scenario: 500 QAR budget, offer accepted, work approved
        let fx = fixture();
        let (job_id, escrow) = accepted_job(&fx).await;

        assert_eq!(escrow.client_fee.minor_units(), 2_500);
        assert_eq!(escrow.freelancer_fee.minor_units(), 5_000);

        fx.engine.start_work(job_id, fx.freelancer).await.unwrap();
        fx.engine.submit_work(job_id, fx.freelancer).await.unwrap();
        let settlement = fx.engine.approve_work(job_id, fx.client).await.unwrap();

        assert_eq!(settlement.to_freelancer.minor_units(), 45_000);
        assert_eq!(settlement.to_platform.minor_units(), 5_000);

        let job = fx.engine.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        let escrow = fx.engine.escrow_for_job(job_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn accept_links_escrow_to_job() {
        let fx = fixture();
        let (job_id, escrow) = accepted_job(&fx).await;
        let job = fx.engine.job(job_id).await.unwrap();
        assert_eq!(job.escrow_id, Some(escrow.id));
        assert_eq!(job.freelancer_id, Some(fx.freelancer));
        assert_eq!(job.status, JobStatus::Accepted);
    }

    #[tokio::test]
    async fn work_commands_enforce_actor_and_order() {
        let fx = fixture();
        let (job_id, _) = accepted_job(&fx).await;

        // Client cannot start work
        assert!(matches!(
            fx.engine.start_work(job_id, fx.client).await,
            Err(EngineError::NotAuthorized(_))
        ));
        // Cannot submit before starting
        assert!(matches!(
            fx.engine.submit_work(job_id, fx.freelancer).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        // Cannot approve before submission
        assert!(matches!(
            fx.engine.approve_work(job_id, fx.client).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn dispute_and_split_resolution() {
        // Scenario: freelancer disputes, admin splits 60/40
        let fx = fixture();
        let (job_id, _) = accepted_job(&fx).await;

        fx.engine
            .dispute_work(
                job_id,
                fx.freelancer,
                "non-payment of milestone".into(),
                vec!["invoice-003".into()],
            )
            .await
            .unwrap();
        let job = fx.engine.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Disputed);

        // Frozen: poster cannot cancel or approve while disputed
        assert!(matches!(
            fx.engine.cancel_job(job_id, fx.client, None).await,
            Err(EngineError::InvalidTransition { .. })
        ));

        let settlement = fx
            .engine
            .resolve_dispute(
                job_id,
                DisputeDecision::Split {
                    percent_to_freelancer: 60,
                },
                "partial delivery".into(),
            )
            .await
            .unwrap();
        assert_eq!(settlement.to_freelancer.minor_units(), 27_000);
        assert_eq!(settlement.to_client.minor_units(), 18_000);
        assert_eq!(settlement.to_platform.minor_units(), 5_000);

        let escrow = fx.engine.escrow_for_job(job_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Resolved);
        let job = fx.engine.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn refund_resolution_cancels_job() {
        let fx = fixture();
        let (job_id, _) = accepted_job(&fx).await;
        fx.engine
            .dispute_work(job_id, fx.client, "work never started".into(), vec![])
            .await
            .unwrap();

        let settlement = fx
            .engine
            .resolve_dispute(job_id, DisputeDecision::RefundToClient, "agreed".into())
            .await
            .unwrap();
        assert_eq!(settlement.to_client.minor_units(), 50_000);
        assert_eq!(fx.engine.job(job_id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_acceptance_refunds_minus_fee() {
        // Scenario: cancel while accepted, amount 500 -> refund 450
        let fx = fixture();
        let (job_id, _) = accepted_job(&fx).await;

        let outcome = fx
            .engine
            .cancel_job(job_id, fx.client, Some("plans changed".into()))
            .await
            .unwrap();
        assert!(outcome.refunded);
        assert_eq!(outcome.refund_amount.unwrap().minor_units(), 45_000);

        let escrow = fx.engine.escrow_for_job(job_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Refunded);
        assert_eq!(fx.engine.job(job_id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_while_open_has_no_monetary_effect() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(job.id, fx.client).await.unwrap();

        let outcome = fx.engine.cancel_job(job.id, fx.client, None).await.unwrap();
        assert!(!outcome.refunded);
        assert!(outcome.refund_amount.is_none());
        assert_eq!(fx.engine.job(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminal_job_rejects_all_commands() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.cancel_job(job.id, fx.client, None).await.unwrap();

        assert!(matches!(
            fx.engine.post_job(job.id, fx.client).await,
            Err(EngineError::JobTerminal(JobStatus::Cancelled))
        ));
        assert!(matches!(
            fx.engine.cancel_job(job.id, fx.client, None).await,
            Err(EngineError::JobTerminal(JobStatus::Cancelled))
        ));
    }

    #[tokio::test]
    async fn expiry_boundary_is_exact() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(job.id, fx.client).await.unwrap();

        // One tick before 30 days: must not expire
        fx.clock.advance(Duration::days(30) - Duration::seconds(1));
        assert!(!fx.engine.expire_job(job.id).await.unwrap());
        assert_eq!(fx.engine.job(job.id).await.unwrap().status, JobStatus::Open);

        // At exactly 30 days: expirable
        fx.clock.advance(Duration::seconds(1));
        assert!(fx.engine.expire_job(job.id).await.unwrap());
        assert_eq!(fx.engine.job(job.id).await.unwrap().status, JobStatus::Expired);

        // Idempotent on a terminal job
        assert!(!fx.engine.expire_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn accepted_job_does_not_expire() {
        let fx = fixture();
        let (job_id, _) = accepted_job(&fx).await;
        fx.clock.advance(Duration::days(31));
        assert!(!fx.engine.expire_job(job_id).await.unwrap());
        assert_eq!(fx.engine.job(job_id).await.unwrap().status, JobStatus::Accepted);
    }

    #[tokio::test]
    async fn auto_release_settles_submitted_job() {
        // Scenario: poster never responds; sweeper runs at +72h1s
        let fx = fixture();
        let (job_id, _) = accepted_job(&fx).await;
        fx.engine.start_work(job_id, fx.freelancer).await.unwrap();
        fx.engine.submit_work(job_id, fx.freelancer).await.unwrap();

        fx.clock.advance(Duration::hours(72) + Duration::seconds(1));
        assert!(fx.engine.auto_release(job_id).await.unwrap());

        let job = fx.engine.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let escrow = fx.engine.escrow_for_job(job_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        let settlement = escrow.settlement.unwrap();
        assert_eq!(settlement.to_freelancer.minor_units(), 45_000);
        assert_eq!(settlement.to_platform.minor_units(), 5_000);

        // Second sweep is a no-op
        assert!(!fx.engine.auto_release(job_id).await.unwrap());
    }

    /// Settle the escrow the way an approval would, leaving the job
    /// write undone
    async fn strand_released_escrow(fx: &Fixture, escrow_id: crate::models::EscrowId) {
        let mut settled = fx.store.get_escrow(escrow_id).await.unwrap();
        settled.status = EscrowStatus::Released;
        settled.settlement = Some(Settlement {
            to_freelancer: qar(45_000),
            to_client: qar(0),
            to_platform: qar(5_000),
            note: "work approved by client".into(),
            settled_at: fx.clock.now(),
        });
        let expected = settled.version;
        fx.store.put_escrow_if(settled, expected).await.unwrap();
    }

    #[tokio::test]
    async fn approve_work_completes_job_when_escrow_already_released() {
        let fx = fixture();
        let (job_id, escrow) = accepted_job(&fx).await;
        fx.engine.start_work(job_id, fx.freelancer).await.unwrap();
        fx.engine.submit_work(job_id, fx.freelancer).await.unwrap();
        strand_released_escrow(&fx, escrow.id).await;

        let settlement = fx.engine.approve_work(job_id, fx.client).await.unwrap();
        assert_eq!(settlement.to_freelancer.minor_units(), 45_000);
        assert_eq!(settlement.to_platform.minor_units(), 5_000);
        assert_eq!(fx.engine.job(job_id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn auto_release_completes_job_when_escrow_already_released() {
        let fx = fixture();
        let (job_id, escrow) = accepted_job(&fx).await;
        fx.engine.start_work(job_id, fx.freelancer).await.unwrap();
        fx.engine.submit_work(job_id, fx.freelancer).await.unwrap();
        strand_released_escrow(&fx, escrow.id).await;

        assert!(fx.engine.auto_release(job_id).await.unwrap());
        assert_eq!(fx.engine.job(job_id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_leaves_pending_offers_unacceptable() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(job.id, fx.client).await.unwrap();
        fx.engine
            .review_job(job.id, fx.admin, ReviewDecision::Approve)
            .await
            .unwrap();
        let offer = fx
            .engine
            .submit_offer(job.id, fx.freelancer, qar(40_000), "a".into())
            .await
            .unwrap();

        fx.engine.cancel_job(job.id, fx.client, None).await.unwrap();

        // The offer stays pending; the terminal job makes it dead weight
        assert_eq!(
            fx.store.get_offer(offer.id).await.unwrap().status,
            OfferStatus::Pending
        );
        assert!(matches!(
            fx.engine.accept_offer(job.id, offer.id, fx.client).await,
            Err(EngineError::JobTerminal(JobStatus::Cancelled))
        ));
    }

    #[tokio::test]
    async fn expiry_leaves_pending_offers_unacceptable() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(job.id, fx.client).await.unwrap();
        fx.engine
            .review_job(job.id, fx.admin, ReviewDecision::Approve)
            .await
            .unwrap();
        let offer = fx
            .engine
            .submit_offer(job.id, fx.freelancer, qar(40_000), "a".into())
            .await
            .unwrap();

        fx.clock.advance(Duration::days(30));
        assert!(fx.engine.expire_job(job.id).await.unwrap());

        assert_eq!(
            fx.store.get_offer(offer.id).await.unwrap().status,
            OfferStatus::Pending
        );
        assert!(matches!(
            fx.engine.accept_offer(job.id, offer.id, fx.client).await,
            Err(EngineError::JobTerminal(JobStatus::Expired))
        ));
    }

    #[tokio::test]
    async fn auto_release_loses_cleanly_to_dispute() {
        let fx = fixture();
        let (job_id, _) = accepted_job(&fx).await;
        fx.engine.start_work(job_id, fx.freelancer).await.unwrap();
        fx.engine.submit_work(job_id, fx.freelancer).await.unwrap();
        fx.clock.advance(Duration::hours(73));

        // Dispute wins the escrow first; the sweeper must not pay out
        fx.engine
            .dispute_work(job_id, fx.client, "wrong rooms cleaned".into(), vec![])
            .await
            .unwrap();
        assert!(!fx.engine.auto_release(job_id).await.unwrap());

        let escrow = fx.engine.escrow_for_job(job_id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Disputed);
    }

    #[tokio::test]
    async fn at_most_one_accepted_offer_per_job() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(job.id, fx.client).await.unwrap();
        fx.engine
            .review_job(job.id, fx.admin, ReviewDecision::Approve)
            .await
            .unwrap();

        let first = fx
            .engine
            .submit_offer(job.id, Uuid::new_v4(), qar(40_000), "a".into())
            .await
            .unwrap();
        let second = fx
            .engine
            .submit_offer(job.id, Uuid::new_v4(), qar(45_000), "b".into())
            .await
            .unwrap();

        fx.engine.accept_offer(job.id, first.id, fx.client).await.unwrap();
        let err = fx
            .engine
            .accept_offer(job.id, second.id, fx.client)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::JobAlreadyAccepted | EngineError::OfferNotPending
        ));

        let offers = fx.engine.offers_for_job(job.id).await.unwrap();
        let accepted = offers
            .iter()
            .filter(|o| o.status == OfferStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn open_jobs_hides_unapproved_postings() {
        let fx = fixture();
        let approved = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(approved.id, fx.client).await.unwrap();
        fx.engine
            .review_job(approved.id, fx.admin, ReviewDecision::Approve)
            .await
            .unwrap();

        let pending = fx.engine.create_job(request(fx.client)).await.unwrap();
        fx.engine.post_job(pending.id, fx.client).await.unwrap();

        let visible = fx.engine.open_jobs(None).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, approved.id);
    }

    #[tokio::test]
    async fn rejected_job_notifies_with_reason() {
        let fx = fixture();
        let job = fx.engine.create_job(request(fx.client)).await.unwrap();
        let reviewed = fx
            .engine
            .review_job(
                job.id,
                fx.admin,
                ReviewDecision::Reject {
                    reason: "prohibited category".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(reviewed.moderation, ModerationStatus::Rejected);
        assert_eq!(reviewed.rejection_reason.as_deref(), Some("prohibited category"));
    }
}
