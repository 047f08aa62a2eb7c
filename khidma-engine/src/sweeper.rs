//! Scheduler/Sweeper - periodic time-based transitions
//!
//! Applies the transitions no user triggers explicitly: 72-hour
//! auto-release of submitted work and 30-day expiry of unfilled jobs.
//! The sweeper only finds candidates; eligibility is re-checked inside
//! the engine under the same conditional-write discipline as any other
//! caller, so a sweep racing a manual action fails cleanly per job.

use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::engine::JobLifecycleEngine;
use crate::models::{EscrowStatus, JobStatus};
use crate::store::{EscrowFilter, JobFilter, Store};
use crate::EngineResult;

/// Configuration for the sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Counts of transitions applied by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub auto_released: usize,
    pub expired: usize,
}

/// Periodic background process issuing the same commands a human
/// actor would
pub struct Sweeper {
    config: SweeperConfig,
    engine: Arc<JobLifecycleEngine>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Sweeper {
    pub fn new(
        config: SweeperConfig,
        engine: Arc<JobLifecycleEngine>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            engine,
            store,
            clock,
        }
    }

    /// One full pass. A failure on one candidate is logged and does
    /// not stop the rest of the sweep.
    pub async fn run_once(&self) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        // Held escrows past their review window
        let candidates = self
            .store
            .query_escrows(EscrowFilter {
                status: Some(EscrowStatus::Held),
                deadline_at_or_before: Some(now),
            })
            .await?;
        for escrow in candidates {
            match self.engine.auto_release(escrow.job_id).await {
                Ok(true) => report.auto_released += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(job_id = %escrow.job_id, %err, "auto-release sweep failed for job");
                }
            }
        }

        // Unfilled jobs past their posting lifetime
        let cutoff = now - Duration::days(self.engine.config().expiry_days);
        let candidates = self
            .store
            .query_jobs(JobFilter {
                statuses: Some(vec![JobStatus::Draft, JobStatus::Open, JobStatus::Offered]),
                created_before: Some(cutoff),
                ..Default::default()
            })
            .await?;
        for job in candidates {
            match self.engine.expire_job(job.id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(job_id = %job.id, %err, "expiry sweep failed for job");
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                auto_released = report.auto_released,
                expired = report.expired,
                "sweep applied transitions"
            );
        }
        Ok(report)
    }

    /// Run sweeps forever on a fixed interval
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
            loop {
                interval.tick().await;
                if let Err(err) = self.run_once().await {
                    warn!(%err, "sweep pass failed");
                }
            }
        })
    }
}
