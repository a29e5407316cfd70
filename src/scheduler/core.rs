//! Scheduler core state machine.
//!
//! Owns every piece of mutable scheduling state: tenant records, the
//! in-process main queue, and the overflow buffer. All methods are
//! synchronous; the driver serializes calls on its own task and keeps the
//! HTTP side effects out of here, which is what makes the invariants
//! testable without a network.

use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::config::TierConfig;
use crate::ident::RunIdents;
use crate::queue::ClaimedJob;
use crate::scheduler::tenant::{ActiveJob, MainQueueJob, TenantState, Tier};

/// Fraction of generated jobs that carry a crawl id.
const CRAWL_ID_PROBABILITY: f64 = 0.2;

/// Generation jitter bounds around the nominal per-tenant gap.
const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

pub struct SchedulerCore {
    tenants: Vec<TenantState>,
    index: HashMap<String, usize>,
    main_queue: Vec<MainQueueJob>,
    overflow: VecDeque<MainQueueJob>,
    job_processing_delay_ms: u64,
    idents: RunIdents,
    generated_jobs: u64,
}

impl SchedulerCore {
    pub fn new(tiers: &[TierConfig], idents: RunIdents, job_processing_delay_ms: u64) -> Self {
        let mut tenants = Vec::new();
        let mut index = HashMap::new();
        for tier_config in tiers {
            let tier = Arc::new(Tier::from(tier_config));
            for i in 0..tier_config.team_count {
                let team_id = idents.team_id(&tier.name, i);
                index.insert(team_id.clone(), tenants.len());
                tenants.push(TenantState::new(team_id, tier.clone()));
            }
        }

        Self {
            tenants,
            index,
            main_queue: Vec::new(),
            overflow: VecDeque::new(),
            job_processing_delay_ms,
            idents,
            generated_jobs: 0,
        }
    }

    /// Appends a fresh job to the main queue for every tenant whose jittered
    /// generation gap has elapsed. Returns how many jobs were generated.
    pub fn generate(&mut self, now: u64) -> usize {
        let mut rng = rand::rng();
        let mut generated = 0;

        for tenant in &mut self.tenants {
            let due = match tenant.last_push_at {
                None => true,
                Some(last) => now.saturating_sub(last) >= tenant.next_push_gap_ms,
            };
            if !due {
                continue;
            }

            let counter = tenant.job_counter;
            tenant.job_counter += 1;
            let job_id = self.idents.job_id(&tenant.team_id, counter);
            let crawl_id = rng
                .random_bool(CRAWL_ID_PROBABILITY)
                .then(|| self.idents.crawl_id(&tenant.team_id, counter));

            self.main_queue.push(MainQueueJob {
                job_id,
                team_id: tenant.team_id.clone(),
                priority: rng.random_range(1..=100),
                created_at: crate::ident::unix_millis(),
                crawl_id,
            });

            tenant.last_push_at = Some(now);
            let base_gap = 1000.0 / tenant.tier.jobs_per_second;
            tenant.next_push_gap_ms = (base_gap * rng.random_range(JITTER_LOW..JITTER_HIGH)) as u64;
            generated += 1;
        }

        self.generated_jobs += generated as u64;
        generated as usize
    }

    /// Removes and returns the globally highest-priority job (lowest value).
    /// Ties break toward the earliest insertion. Capacity is the caller's
    /// concern, not this method's.
    pub fn pick_from_main_queue(&mut self) -> Option<MainQueueJob> {
        let mut best: Option<(usize, i64)> = None;
        for (i, job) in self.main_queue.iter().enumerate() {
            match best {
                Some((_, priority)) if priority <= job.priority => {}
                _ => best = Some((i, job.priority)),
            }
        }
        best.map(|(i, _)| self.main_queue.remove(i))
    }

    pub fn is_at_capacity(&self, team_id: &str) -> bool {
        self.tenant(team_id).is_some_and(TenantState::is_at_capacity)
    }

    /// Starts a job in its tenant. Panics if the tenant is at capacity.
    pub fn start_job(&mut self, job: &MainQueueJob, now: u64, from_remote: bool, queue_key: String) {
        let Some(tenant) = self.tenant_mut(&job.team_id) else {
            panic!("started job {} for unknown tenant {}", job.job_id, job.team_id);
        };
        tenant.start_job(job, now, from_remote, queue_key);
    }

    /// Moves a picked-but-uncapacitated job into the overflow buffer.
    pub fn push_overflow(&mut self, job: MainQueueJob) {
        self.overflow.push_back(job);
    }

    /// Drains the overflow buffer for a remote-push pass.
    pub fn take_overflow(&mut self) -> Vec<MainQueueJob> {
        self.overflow.drain(..).collect()
    }

    /// A remote push succeeded for this tenant.
    pub fn record_remote_queued(&mut self, team_id: &str) {
        if let Some(tenant) = self.tenant_mut(team_id) {
            tenant.queued_jobs += 1;
        }
    }

    /// A remote pop succeeded for this tenant.
    pub fn record_claim_applied(&mut self, team_id: &str) {
        if let Some(tenant) = self.tenant_mut(team_id) {
            tenant.queued_jobs = tenant.queued_jobs.saturating_sub(1);
        }
    }

    pub fn queued_jobs(&self, team_id: &str) -> u64 {
        self.tenant(team_id).map_or(0, |t| t.queued_jobs)
    }

    /// All jobs across tenants whose processing delay has elapsed.
    pub fn completable_jobs(&self, now: u64) -> Vec<(String, ActiveJob)> {
        let mut due = Vec::new();
        for tenant in &self.tenants {
            for job in tenant.completable(now, self.job_processing_delay_ms) {
                due.push((tenant.team_id.clone(), job));
            }
        }
        due
    }

    /// First half of a completion: removes the active entry and counts it.
    /// The remote acknowledgements happen in the driver's HTTP tasks.
    pub fn begin_completion(&mut self, team_id: &str, job_id: &str) -> Option<ActiveJob> {
        let tenant = self.tenant_mut(team_id)?;
        let active = tenant.remove_active(job_id)?;
        tenant.completed_jobs += 1;
        Some(active)
    }

    /// Converts a remote claim into a main-queue-shaped job so promotion can
    /// reuse the normal start path.
    pub fn claim_to_job(team_id: &str, claim: &ClaimedJob) -> MainQueueJob {
        MainQueueJob {
            job_id: claim.job.id.clone(),
            team_id: team_id.to_string(),
            priority: claim.job.priority,
            created_at: claim.job.created_at,
            crawl_id: claim.job.crawl_id.clone(),
        }
    }

    pub fn team_ids(&self) -> Vec<String> {
        self.tenants.iter().map(|t| t.team_id.clone()).collect()
    }

    pub fn tenants(&self) -> impl Iterator<Item = &TenantState> {
        self.tenants.iter()
    }

    pub fn total_generated(&self) -> u64 {
        self.generated_jobs
    }

    pub fn total_active(&self) -> usize {
        self.tenants.iter().map(TenantState::active_len).sum()
    }

    pub fn total_queued(&self) -> u64 {
        self.tenants.iter().map(|t| t.queued_jobs).sum()
    }

    pub fn total_completed(&self) -> u64 {
        self.tenants.iter().map(|t| t.completed_jobs).sum()
    }

    pub fn main_queue_len(&self) -> usize {
        self.main_queue.len()
    }

    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    fn tenant(&self, team_id: &str) -> Option<&TenantState> {
        self.index.get(team_id).map(|&i| &self.tenants[i])
    }

    fn tenant_mut(&mut self, team_id: &str) -> Option<&mut TenantState> {
        self.index.get(team_id).map(|&i| &mut self.tenants[i])
    }

    #[cfg(test)]
    pub(crate) fn enqueue_for_test(&mut self, job: MainQueueJob) {
        self.main_queue.push(job);
    }
}
