//! Persistence abstraction for jobs, offers and escrows
//!
//! The store is the only shared mutable resource and the sole arbiter
//! of concurrent writes. Jobs and escrows are written with a
//! version-keyed conditional put; a losing writer gets
//! `ConcurrentModification` and must not apply partial effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::models::{
    Escrow, EscrowId, EscrowStatus, Job, JobId, JobStatus, Offer, OfferId, OfferStatus, UserId,
};
use crate::EngineResult;

/// Query filter over jobs. All fields are conjunctive; `None` means
/// "don't care".
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub statuses: Option<Vec<JobStatus>>,
    pub client_id: Option<UserId>,
    pub category: Option<String>,
    pub approved_only: bool,
    pub created_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(ref statuses) = self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(client_id) = self.client_id {
            if job.client_id != client_id {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if &job.category != category {
                return false;
            }
        }
        if self.approved_only && job.moderation != crate::models::ModerationStatus::Approved {
            return false;
        }
        if let Some(cutoff) = self.created_before {
            if job.created_at > cutoff {
                return false;
            }
        }
        true
    }
}

/// Query filter over escrows, used by the sweeper to find auto-release
/// candidates.
#[derive(Debug, Clone, Default)]
pub struct EscrowFilter {
    pub status: Option<EscrowStatus>,
    pub deadline_at_or_before: Option<DateTime<Utc>>,
}

impl EscrowFilter {
    fn matches(&self, escrow: &Escrow) -> bool {
        if let Some(status) = self.status {
            if escrow.status != status {
                return false;
            }
        }
        if let Some(cutoff) = self.deadline_at_or_before {
            if escrow.auto_release_deadline > cutoff {
                return false;
            }
        }
        true
    }
}

/// Abstract persistence for the engine
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_job(&self, job: Job) -> EngineResult<()>;
    async fn get_job(&self, id: JobId) -> EngineResult<Job>;
    /// Conditional write: succeeds only when the stored version equals
    /// `expected_version`; the stored record then carries
    /// `expected_version + 1`. Returns the written job.
    async fn put_job_if(&self, job: Job, expected_version: u64) -> EngineResult<Job>;
    async fn query_jobs(&self, filter: JobFilter) -> EngineResult<Vec<Job>>;

    async fn create_offer(&self, offer: Offer) -> EngineResult<()>;
    async fn get_offer(&self, id: OfferId) -> EngineResult<Offer>;
    /// Guarded write: succeeds only while the stored offer is still
    /// pending. Offers transition at most once; a writer holding a
    /// stale pending read gets `OfferNotPending`.
    async fn put_offer(&self, offer: Offer) -> EngineResult<()>;
    async fn offers_for_job(&self, job_id: JobId) -> EngineResult<Vec<Offer>>;

    async fn create_escrow(&self, escrow: Escrow) -> EngineResult<()>;
    async fn get_escrow(&self, id: EscrowId) -> EngineResult<Escrow>;
    async fn put_escrow_if(&self, escrow: Escrow, expected_version: u64) -> EngineResult<Escrow>;
    async fn escrow_for_job(&self, job_id: JobId) -> EngineResult<Option<Escrow>>;
    async fn query_escrows(&self, filter: EscrowFilter) -> EngineResult<Vec<Escrow>>;
}

/// In-memory store backed by `RwLock`ed maps. Reference implementation
/// and test double; a production deployment would put a document
/// database behind the same trait.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    offers: Arc<RwLock<HashMap<OfferId, Offer>>>,
    escrows: Arc<RwLock<HashMap<EscrowId, Escrow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(&self, job: Job) -> EngineResult<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> EngineResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("job", id))
    }

    async fn put_job_if(&self, mut job: Job, expected_version: u64) -> EngineResult<Job> {
        let mut jobs = self.jobs.write().await;
        let current = jobs
            .get(&job.id)
            .ok_or_else(|| EngineError::not_found("job", job.id))?;
        if current.version != expected_version {
            return Err(EngineError::concurrent_modification("job", job.id));
        }
        job.version = expected_version + 1;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn query_jobs(&self, filter: JobFilter) -> EngineResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn create_offer(&self, offer: Offer) -> EngineResult<()> {
        self.offers.write().await.insert(offer.id, offer);
        Ok(())
    }

    async fn get_offer(&self, id: OfferId) -> EngineResult<Offer> {
        self.offers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("offer", id))
    }

    async fn put_offer(&self, offer: Offer) -> EngineResult<()> {
        let mut offers = self.offers.write().await;
        let current = offers
            .get(&offer.id)
            .ok_or_else(|| EngineError::not_found("offer", offer.id))?;
        if current.status != OfferStatus::Pending {
            return Err(EngineError::OfferNotPending);
        }
        offers.insert(offer.id, offer);
        Ok(())
    }

    async fn offers_for_job(&self, job_id: JobId) -> EngineResult<Vec<Offer>> {
        let offers = self.offers.read().await;
        let mut matched: Vec<Offer> = offers
            .values()
            .filter(|o| o.job_id == job_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn create_escrow(&self, escrow: Escrow) -> EngineResult<()> {
        self.escrows.write().await.insert(escrow.id, escrow);
        Ok(())
    }

    async fn get_escrow(&self, id: EscrowId) -> EngineResult<Escrow> {
        self.escrows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("escrow", id))
    }

    async fn put_escrow_if(&self, mut escrow: Escrow, expected_version: u64) -> EngineResult<Escrow> {
        let mut escrows = self.escrows.write().await;
        let current = escrows
            .get(&escrow.id)
            .ok_or_else(|| EngineError::not_found("escrow", escrow.id))?;
        if current.version != expected_version {
            return Err(EngineError::concurrent_modification("escrow", escrow.id));
        }
        escrow.version = expected_version + 1;
        escrows.insert(escrow.id, escrow.clone());
        Ok(escrow)
    }

    async fn escrow_for_job(&self, job_id: JobId) -> EngineResult<Option<Escrow>> {
        let escrows = self.escrows.read().await;
        Ok(escrows.values().find(|e| e.job_id == job_id).cloned())
    }

    async fn query_escrows(&self, filter: EscrowFilter) -> EngineResult<Vec<Escrow>> {
        let escrows = self.escrows.read().await;
        Ok(escrows.values().filter(|e| filter.matches(e)).cloned().collect())
    }
}
