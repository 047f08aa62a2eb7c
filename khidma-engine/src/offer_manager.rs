//! Offer Manager - bid submission and the acceptance race
//!
//! Owns `Offer` entities. Acceptance is serialized on the Job record:
//! a version-keyed conditional write moves the job `offered -> accepted`,
//! and only the writer that wins it may touch any offer state. Losers
//! get `JobAlreadyAccepted` and mutate nothing.

use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::models::{Job, JobId, JobStatus, Offer, OfferId, OfferStatus, UserId};
use crate::money::Money;
use crate::notifier::{notify_quietly, DomainEvent, NotificationSink};
use crate::store::Store;
use crate::EngineResult;

/// Manages offer submission, acceptance and rejection
pub struct OfferManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
}

impl OfferManager {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { store, clock, sink }
    }

    /// Submit a bid on an open job. Moves the job `open -> offered` on
    /// the first bid; later bids leave the status alone.
    pub async fn submit(
        &self,
        job_id: JobId,
        freelancer_id: UserId,
        price: Money,
        message: String,
    ) -> EngineResult<Offer> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(EngineError::JobTerminal(job.status));
        }
        if !job.status.accepts_offers() {
            return Err(EngineError::JobNotOpenForOffers);
        }
        // Unapproved jobs are invisible to workers
        if job.moderation != crate::models::ModerationStatus::Approved {
            return Err(EngineError::JobNotOpenForOffers);
        }
        if freelancer_id == job.client_id {
            return Err(EngineError::not_authorized(
                "a client cannot bid on their own job",
            ));
        }
        if price.currency() != job.budget.currency() {
            return Err(EngineError::validation(
                "offer currency does not match job budget",
            ));
        }
        if price.is_zero() {
            return Err(EngineError::validation("offer price must be positive"));
        }

        // First bid flips the job to offered before the offer exists,
        // so a failed conditional write cannot orphan an offer.
        if job.status == JobStatus::Open {
            let mut updated = job.clone();
            updated.status = JobStatus::Offered;
            updated.updated_at = self.clock.now();
            let expected = updated.version;
            self.store.put_job_if(updated, expected).await?;
        }

        let offer = Offer::new(job_id, freelancer_id, price, message, self.clock.now());
        self.store.create_offer(offer.clone()).await?;

        notify_quietly(
            &self.sink,
            job.client_id,
            DomainEvent::OfferReceived {
                job_id,
                offer_id: offer.id,
                price: offer.price.clone(),
            },
        )
        .await;

        info!(%job_id, offer_id = %offer.id, price = %offer.price, "offer submitted");
        Ok(offer)
    }

    /// Accept an offer. Atomic with respect to concurrent accepts on
    /// sibling offers: the job-level conditional write decides the
    /// winner, and all other pending siblings are rejected as a
    /// consequence. Returns the accepted offer and the written job.
    pub async fn accept(
        &self,
        job_id: JobId,
        offer_id: OfferId,
        actor_id: UserId,
    ) -> EngineResult<(Offer, Job)> {
        let job = self.store.get_job(job_id).await?;
        job.require_client(actor_id)?;

        let mut offer = self.store.get_offer(offer_id).await?;
        if offer.job_id != job_id {
            return Err(EngineError::validation("offer does not belong to this job"));
        }
        if offer.status != OfferStatus::Pending {
            return Err(EngineError::OfferNotPending);
        }

        Self::require_offered(&job)?;

        let now = self.clock.now();
        let mut updated = job.clone();
        updated.status = JobStatus::Accepted;
        updated.freelancer_id = Some(offer.freelancer_id);
        updated.accepted_offer_id = Some(offer_id);
        updated.updated_at = now;
        let expected = updated.version;
        let job = match self.store.put_job_if(updated, expected).await {
            Ok(job) => job,
            Err(EngineError::ConcurrentModification { .. }) => {
                // Re-read to tell "someone else got it" apart from an
                // unrelated concurrent write.
                let current = self.store.get_job(job_id).await?;
                return match Self::require_offered(&current) {
                    Err(err) => Err(err),
                    Ok(()) => Err(EngineError::concurrent_modification("job", job_id)),
                };
            }
            Err(err) => return Err(err),
        };

        // Past this point we won the job race. A rejection that read
        // the offer as pending can still land ahead of this write; the
        // guarded put catches it and we give the job back.
        offer.status = OfferStatus::Accepted;
        offer.accepted_at = Some(now);
        match self.store.put_offer(offer.clone()).await {
            Ok(()) => {}
            Err(EngineError::OfferNotPending) => {
                let mut reverted = job.clone();
                reverted.status = JobStatus::Offered;
                reverted.freelancer_id = None;
                reverted.accepted_offer_id = None;
                reverted.updated_at = self.clock.now();
                let expected = reverted.version;
                self.store.put_job_if(reverted, expected).await?;
                return Err(EngineError::OfferNotPending);
            }
            Err(err) => return Err(err),
        }

        for mut sibling in self.store.offers_for_job(job_id).await? {
            if sibling.id != offer_id && sibling.status == OfferStatus::Pending {
                sibling.status = OfferStatus::Rejected;
                match self.store.put_offer(sibling.clone()).await {
                    Ok(()) => {
                        notify_quietly(
                            &self.sink,
                            sibling.freelancer_id,
                            DomainEvent::OfferRejected {
                                job_id,
                                offer_id: sibling.id,
                            },
                        )
                        .await;
                    }
                    // A direct reject settled this sibling first.
                    Err(EngineError::OfferNotPending) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        notify_quietly(
            &self.sink,
            offer.freelancer_id,
            DomainEvent::OfferAccepted { job_id, offer_id },
        )
        .await;

        info!(%job_id, %offer_id, "offer accepted");
        Ok((offer, job))
    }

    /// Reject a pending offer without closing the job
    pub async fn reject(
        &self,
        job_id: JobId,
        offer_id: OfferId,
        actor_id: UserId,
    ) -> EngineResult<Offer> {
        let job = self.store.get_job(job_id).await?;
        job.require_client(actor_id)?;

        let mut offer = self.store.get_offer(offer_id).await?;
        if offer.job_id != job_id {
            return Err(EngineError::validation("offer does not belong to this job"));
        }
        if offer.status != OfferStatus::Pending {
            return Err(EngineError::OfferNotPending);
        }

        offer.status = OfferStatus::Rejected;
        self.store.put_offer(offer.clone()).await?;

        notify_quietly(
            &self.sink,
            offer.freelancer_id,
            DomainEvent::OfferRejected { job_id, offer_id },
        )
        .await;

        info!(%job_id, %offer_id, "offer rejected");
        Ok(offer)
    }

    /// Classify a non-`offered` status for the accept path: an already
    /// assigned job is informational, not a system fault.
    fn require_offered(job: &Job) -> EngineResult<()> {
        match job.status {
            JobStatus::Offered => Ok(()),
            JobStatus::Accepted
            | JobStatus::InProgress
            | JobStatus::Submitted
            | JobStatus::Completed
            | JobStatus::Disputed => Err(EngineError::JobAlreadyAccepted),
            JobStatus::Cancelled | JobStatus::Expired => Err(EngineError::JobTerminal(job.status)),
            JobStatus::Draft | JobStatus::Open => {
                Err(EngineError::invalid_transition(job.status, "accept_offer"))
            }
        }
    }
}
