//! Driver main loop.
//!
//! A single task owns the scheduler core and walks the tick phases:
//! generate, drain overflow into the remote queue, dispatch from the main
//! queue, then process completions and promotions. Remote calls run in
//! spawned tasks bounded by a counting semaphore; each task reports its
//! outcome over a channel and the driver applies the state change on its
//! own thread, so tenant mutations stay serialized.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ident::MonotonicClock;
use crate::metrics::MetricsCollector;
use crate::oracle::Oracle;
use crate::queue::{ClaimedJob, QueueClient};
use crate::scheduler::core::SchedulerCore;
use crate::scheduler::tenant::{ActiveJob, MainQueueJob};

/// Upper bound on main-queue picks within one tick.
const MAX_PICKS_PER_TICK: usize = 100;

/// Past this many waiters on a saturated semaphore, the driver backs off
/// instead of piling on more tasks.
const SATURATION_WAITERS: usize = 1000;
const SATURATION_BACKOFF: Duration = Duration::from_millis(10);

/// Idle ticks sleep briefly so a quiet driver does not spin a core.
const IDLE_TICK_SLEEP: Duration = Duration::from_millis(1);

const DRAIN_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_STALL_WINDOW: Duration = Duration::from_secs(10);
const DRAIN_CAP_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DriverParams {
    pub duration: Duration,
    pub worker_concurrency: usize,
    pub report_interval: Duration,
    pub job_processing_delay: Duration,
}

/// Totals the driver hands back for the final report.
#[derive(Debug, Clone, Default)]
pub struct DriverSummary {
    pub generated: u64,
    pub completed: u64,
    pub still_active: usize,
    pub remote_queued: u64,
    pub undispatched: usize,
    pub drain_stalled: bool,
    pub elapsed: Duration,
    /// Completion counts per team, for tier-level analysis.
    pub per_team_completed: Vec<(String, u64)>,
}

/// Result of one spawned HTTP task, applied to core state on the driver
/// thread.
enum TaskOutcome {
    PushResolved { job: MainQueueJob, success: bool },
    Promotion { team_id: String, claim: Option<ClaimedJob> },
    Released { team_id: String, success: bool },
}

pub struct Driver {
    core: SchedulerCore,
    client: Arc<QueueClient>,
    oracle: Option<Arc<Oracle>>,
    metrics: Arc<MetricsCollector>,
    params: DriverParams,
    clock: MonotonicClock,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    pending_acquires: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<TaskOutcome>,
}

impl Driver {
    pub fn new(
        core: SchedulerCore,
        client: Arc<QueueClient>,
        oracle: Option<Arc<Oracle>>,
        metrics: Arc<MetricsCollector>,
        params: DriverParams,
        cancel: CancellationToken,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(params.worker_concurrency.max(1)));
        Self {
            core,
            client,
            oracle,
            metrics,
            params,
            clock: MonotonicClock::new(),
            cancel,
            semaphore,
            pending_acquires: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            outcome_tx,
            outcome_rx,
        }
    }

    /// Runs load generation until the configured duration elapses or
    /// shutdown is signalled, then drains, then reconciles remote counts.
    pub async fn run(mut self) -> DriverSummary {
        let run_started = Instant::now();
        let deadline_ms = self.params.duration.as_millis() as u64;
        info!(
            duration = format!("{:.2?}", self.params.duration),
            worker_concurrency = self.params.worker_concurrency,
            tenants = self.core.team_ids().len(),
            "load generation started"
        );

        let mut last_report = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                info!("shutdown signalled, stopping load generation");
                break;
            }
            let now = self.clock.now_ms();
            if now >= deadline_ms {
                break;
            }

            let mut progressed = self.apply_outcomes(now) > 0;

            // Phase A: synthetic generation.
            progressed |= self.core.generate(now) > 0;

            // Phase B: overflowed jobs move to the remote queue, one task
            // per item.
            for job in self.core.take_overflow() {
                self.spawn_push(job);
                progressed = true;
            }

            // Phase C: dispatch the highest-priority work.
            let mut picks = 0;
            while picks < MAX_PICKS_PER_TICK && self.semaphore.available_permits() > 0 {
                let Some(job) = self.core.pick_from_main_queue() else {
                    break;
                };
                picks += 1;
                if self.core.is_at_capacity(&job.team_id) {
                    self.core.push_overflow(job);
                } else {
                    self.start_and_track(job, now, false, String::new());
                }
            }
            progressed |= picks > 0;

            // Phase D: completions and the promotions they trigger.
            progressed |= self.complete_due(now) > 0;
            progressed |= self.apply_outcomes(self.clock.now_ms()) > 0;

            if last_report.elapsed() >= self.params.report_interval {
                self.report_progress(run_started.elapsed());
                last_report = Instant::now();
            }

            // Cooperative scheduling point: spawned HTTP tasks progress here.
            tokio::task::yield_now().await;
            if self.semaphore.available_permits() == 0
                && self.pending_acquires.load(Ordering::Relaxed) > SATURATION_WAITERS
            {
                time::sleep(SATURATION_BACKOFF).await;
            } else if !progressed {
                time::sleep(IDLE_TICK_SLEEP).await;
            }
        }

        let drain_stalled = self.drain().await;
        self.reconcile_remote_counts().await;

        DriverSummary {
            generated: self.core.total_generated(),
            completed: self.core.total_completed(),
            still_active: self.core.total_active(),
            remote_queued: self.core.total_queued(),
            undispatched: self.core.main_queue_len() + self.core.overflow_len(),
            drain_stalled,
            elapsed: run_started.elapsed(),
            per_team_completed: self
                .core
                .tenants()
                .map(|t| (t.team_id.clone(), t.completed_jobs))
                .collect(),
        }
    }

    /// Drain phase: no generation, completions only, until no job is active
    /// and no task is in flight. Returns whether a stall was declared.
    async fn drain(&mut self) -> bool {
        let drain_started = Instant::now();
        let cap = 3 * self.params.job_processing_delay + DRAIN_CAP_MARGIN;
        info!(
            active = self.core.total_active(),
            cap = format!("{:.2?}", cap),
            "entering drain phase"
        );

        let mut last_progress = Instant::now();
        let mut last_active = usize::MAX;
        let mut last_change = Instant::now();
        let mut stalled = false;

        loop {
            let now = self.clock.now_ms();
            self.apply_outcomes(now);
            self.complete_due(now);

            let active = self.core.total_active();
            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if active == 0 && in_flight == 0 {
                // A task may have reported between the apply above and the
                // in-flight read; its outcome could start one more job.
                if self.apply_outcomes(now) > 0 {
                    continue;
                }
                info!(
                    elapsed = format!("{:.2?}", drain_started.elapsed()),
                    "drain complete"
                );
                break;
            }
            if drain_started.elapsed() >= cap {
                warn!(
                    active,
                    in_flight, "drain cap reached; remaining jobs left active"
                );
                break;
            }

            if active != last_active {
                last_active = active;
                last_change = Instant::now();
            } else if !stalled && last_change.elapsed() >= DRAIN_STALL_WINDOW {
                warn!(
                    active,
                    window = format!("{:.2?}", DRAIN_STALL_WINDOW),
                    "drain stalled; active count unchanged"
                );
                stalled = true;
            }

            if last_progress.elapsed() >= DRAIN_PROGRESS_INTERVAL {
                info!(
                    active,
                    in_flight,
                    queued = self.core.total_queued(),
                    completed = self.core.total_completed(),
                    "drain progress"
                );
                last_progress = Instant::now();
            }

            tokio::task::yield_now().await;
            time::sleep(IDLE_TICK_SLEEP).await;
        }

        stalled
    }

    /// Applies completed task outcomes to core state. Returns how many were
    /// applied.
    fn apply_outcomes(&mut self, now: u64) -> usize {
        let mut applied = 0;
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            applied += 1;
            match outcome {
                TaskOutcome::PushResolved { job, success } => {
                    if success {
                        self.core.record_remote_queued(&job.team_id);
                    } else {
                        // The job is unchanged source state; a later tick
                        // retries the push.
                        self.core.push_overflow(job);
                    }
                }
                TaskOutcome::Promotion { team_id, claim } => {
                    let Some(claim) = claim else { continue };
                    self.core.record_claim_applied(&team_id);
                    if self.core.is_at_capacity(&team_id) {
                        // A claim is never dropped: either started or
                        // released back to the queue.
                        debug!(
                            team_id,
                            job_id = claim.job.id,
                            "tenant refilled before promotion, releasing claim"
                        );
                        self.spawn_release(team_id, claim);
                    } else {
                        let job = SchedulerCore::claim_to_job(&team_id, &claim);
                        self.start_and_track(job, now, true, claim.queue_key.clone());
                    }
                }
                TaskOutcome::Released { team_id, success } => {
                    if success {
                        self.core.record_remote_queued(&team_id);
                    }
                }
            }
        }
        applied
    }

    /// Completes every due job and kicks off its remote acknowledgement and
    /// promotion attempt. Returns how many completions began.
    fn complete_due(&mut self, now: u64) -> usize {
        let due = self.core.completable_jobs(now);
        let count = due.len();
        for (team_id, job) in due {
            let Some(active) = self.core.begin_completion(&team_id, &job.job_id) else {
                continue;
            };
            if active.from_remote
                && let Some(oracle) = &self.oracle
            {
                oracle.record_complete(&active.job_id);
            }
            let attempt_promotion = self.core.queued_jobs(&team_id) > 0;
            self.spawn_completion(team_id, active, attempt_promotion);
        }
        count
    }

    fn start_and_track(&mut self, job: MainQueueJob, now: u64, from_remote: bool, queue_key: String) {
        self.core.start_job(&job, now, from_remote, queue_key);
        self.spawn_active_push(job.team_id, job.job_id);
    }

    fn spawn_push(&self, job: MainQueueJob) {
        let client = self.client.clone();
        let tx = self.outcome_tx.clone();
        let tracker = self.task_tracker();
        tokio::spawn(async move {
            let Some(_permit) = tracker.acquire().await else {
                return;
            };
            let result = client.push(&job).await;
            let _ = tx.send(TaskOutcome::PushResolved {
                job,
                success: result.success,
            });
        });
    }

    /// Registers a started job in remote active tracking. Fire and forget:
    /// the remote active count is advisory monitoring, never reconciled.
    fn spawn_active_push(&self, team_id: String, job_id: String) {
        let client = self.client.clone();
        let tracker = self.task_tracker();
        tokio::spawn(async move {
            let Some(_permit) = tracker.acquire().await else {
                return;
            };
            let _ = client.active_push(&team_id, &job_id).await;
        });
    }

    fn spawn_completion(&self, team_id: String, active: ActiveJob, attempt_promotion: bool) {
        let client = self.client.clone();
        let tx = self.outcome_tx.clone();
        let tracker = self.task_tracker();
        tokio::spawn(async move {
            let Some(_permit) = tracker.acquire().await else {
                return;
            };
            let _ = client.active_remove(&team_id, &active.job_id).await;
            if !active.queue_key.is_empty() {
                let result = client.complete(&active.queue_key).await;
                if !result.success {
                    // The lease expires server-side and the job re-queues;
                    // the oracle keeps it visible in the final report.
                    debug!(job_id = active.job_id, "remote complete failed");
                }
            }
            if attempt_promotion {
                let result = client.pop(&team_id).await;
                let claim = result.data.flatten();
                let _ = tx.send(TaskOutcome::Promotion { team_id, claim });
            }
        });
    }

    fn spawn_release(&self, team_id: String, claim: ClaimedJob) {
        let client = self.client.clone();
        let tx = self.outcome_tx.clone();
        let tracker = self.task_tracker();
        tokio::spawn(async move {
            let Some(_permit) = tracker.acquire().await else {
                return;
            };
            let result = client.release(&claim.job.id).await;
            let _ = tx.send(TaskOutcome::Released {
                team_id,
                success: result.success,
            });
        });
    }

    /// End-of-run comparison of local bookkeeping against the service's
    /// counts. Advisory only: mismatches are logged, never reconciled.
    async fn reconcile_remote_counts(&self) {
        let mut remote_queued = 0u64;
        let mut remote_active = 0u64;
        for team_id in self.core.team_ids() {
            if let Some(count) = self.client.team_queue_count(&team_id).await.data {
                remote_queued += count;
            }
            if let Some(count) = self.client.active_count(&team_id).await.data {
                remote_active += count;
            }
        }

        let local_queued = self.core.total_queued();
        if remote_queued != local_queued {
            warn!(
                remote_queued,
                local_queued, "remote queue count differs from local bookkeeping"
            );
        }
        info!(remote_queued, remote_active, "remote state at end of run");
    }

    fn report_progress(&self, elapsed: Duration) {
        info!(
            elapsed = format!("{:.1?}", elapsed),
            generated = self.core.total_generated(),
            completed = self.core.total_completed(),
            active = self.core.total_active(),
            queued = self.core.total_queued(),
            main_queue = self.core.main_queue_len(),
            overflow = self.core.overflow_len(),
            in_flight = self.in_flight.load(Ordering::Relaxed),
            errors = self.metrics.total_errors(),
            "progress"
        );
    }

    fn task_tracker(&self) -> TaskTracker {
        TaskTracker::new(
            self.semaphore.clone(),
            self.pending_acquires.clone(),
            self.in_flight.clone(),
        )
    }
}

/// Accounting around a spawned task: one in-flight increment for its whole
/// lifetime, one pending-acquire increment while it waits for a permit.
struct TaskTracker {
    semaphore: Arc<Semaphore>,
    pending_acquires: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl TaskTracker {
    fn new(
        semaphore: Arc<Semaphore>,
        pending_acquires: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            semaphore,
            pending_acquires,
            in_flight,
        }
    }

    async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.pending_acquires.fetch_add(1, Ordering::SeqCst);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.pending_acquires.fetch_sub(1, Ordering::SeqCst);
        permit.ok()
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
