//! Per-tenant bookkeeping: tiers, job records, and active-set accounting.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TierConfig;

/// Runtime view of a configured tier.
#[derive(Debug, Clone)]
pub struct Tier {
    pub name: String,
    pub concurrency_limit: usize,
    pub jobs_per_second: f64,
}

impl From<&TierConfig> for Tier {
    fn from(config: &TierConfig) -> Self {
        Self {
            name: config.name.clone(),
            concurrency_limit: config.concurrency_limit,
            jobs_per_second: config.jobs_per_second,
        }
    }
}

/// A generated job awaiting worker pickup in the in-process main queue.
#[derive(Debug, Clone)]
pub struct MainQueueJob {
    pub job_id: String,
    pub team_id: String,
    /// Lower value = more urgent.
    pub priority: i64,
    /// Wall-clock millis; payload data only, never used for scheduling.
    pub created_at: i64,
    pub crawl_id: Option<String>,
}

/// A job a tenant is currently executing.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_id: String,
    /// Opaque completion handle. Empty unless the job was promoted out of
    /// the remote queue.
    pub queue_key: String,
    /// Monotonic millis.
    pub started_at: u64,
    /// True when the job was obtained via promotion rather than straight
    /// from the main queue.
    pub from_remote: bool,
}

/// One simulated team.
pub struct TenantState {
    pub team_id: String,
    pub tier: Arc<Tier>,
    active_jobs: HashMap<String, ActiveJob>,
    /// Jobs this tenant currently has in the remote overflow queue:
    /// push-successes minus pop-successes.
    pub queued_jobs: u64,
    pub completed_jobs: u64,
    pub job_counter: u64,
    /// Monotonic millis of the last generated job; `None` before the first.
    pub last_push_at: Option<u64>,
    /// Jittered gap until the next generation is due.
    pub next_push_gap_ms: u64,
}

impl TenantState {
    pub fn new(team_id: String, tier: Arc<Tier>) -> Self {
        Self {
            team_id,
            tier,
            active_jobs: HashMap::new(),
            queued_jobs: 0,
            completed_jobs: 0,
            job_counter: 0,
            last_push_at: None,
            next_push_gap_ms: 0,
        }
    }

    pub fn is_at_capacity(&self) -> bool {
        self.active_jobs.len() >= self.tier.concurrency_limit
    }

    pub fn active_len(&self) -> usize {
        self.active_jobs.len()
    }

    /// Starts a job. Callers must check capacity first; starting a job in a
    /// full tenant is a programming error and aborts the run.
    pub fn start_job(&mut self, job: &MainQueueJob, now: u64, from_remote: bool, queue_key: String) {
        if self.is_at_capacity() {
            panic!(
                "tenant {} already at concurrency limit {} when starting job {}",
                self.team_id, self.tier.concurrency_limit, job.job_id
            );
        }
        self.active_jobs.insert(
            job.job_id.clone(),
            ActiveJob {
                job_id: job.job_id.clone(),
                queue_key,
                started_at: now,
                from_remote,
            },
        );
    }

    pub fn remove_active(&mut self, job_id: &str) -> Option<ActiveJob> {
        self.active_jobs.remove(job_id)
    }

    /// Active jobs whose simulated processing time has elapsed.
    pub fn completable(&self, now: u64, processing_delay_ms: u64) -> Vec<ActiveJob> {
        self.active_jobs
            .values()
            .filter(|job| now.saturating_sub(job.started_at) >= processing_delay_ms)
            .cloned()
            .collect()
    }
}
