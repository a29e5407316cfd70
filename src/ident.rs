//! Identifier generation and clock helpers.
//!
//! Every id minted during a run embeds the run id so that concurrent runs
//! against a shared queue service never collide. Scheduler decisions use
//! monotonic milliseconds; wall-clock milliseconds appear only in payloads.

use rand::distr::{Alphanumeric, SampleString};
use std::time::Instant;

/// Wall-clock milliseconds since the Unix epoch, for payload timestamps.
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Monotonic clock anchored at driver startup.
///
/// All scheduler decisions (generation pacing, processing delays, deadlines)
/// are made against this clock so wall-clock adjustments cannot skew a run.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since this clock was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier source for a single run.
#[derive(Debug, Clone)]
pub struct RunIdents {
    run_id: String,
}

impl RunIdents {
    /// Creates a fresh run id: 8 random alphanumerics plus the startup
    /// timestamp, enough to keep simultaneous runs apart.
    pub fn new() -> Self {
        let nonce = Alphanumeric.sample_string(&mut rand::rng(), 8);
        Self {
            run_id: format!("{}-{}", nonce, unix_millis()),
        }
    }

    /// Builds an ident source around a fixed run id (used by tests).
    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Team id for the `index`-th tenant of a tier. Stable across runs so a
    /// pre-run flush can clear leftovers from earlier runs.
    pub fn team_id(&self, tier_name: &str, index: usize) -> String {
        format!("surge-{}-{}", tier_name, index)
    }

    /// Job id for a tenant's `counter`-th generated job.
    pub fn job_id(&self, team_id: &str, counter: u64) -> String {
        format!("job-{}-{}-{}", team_id, self.run_id, counter)
    }

    /// Crawl id shared by every run of ten consecutive jobs of a tenant.
    pub fn crawl_id(&self, team_id: &str, counter: u64) -> String {
        format!("crawl-{}-{}", team_id, counter / 10)
    }

    /// Worker id the driver presents when popping jobs.
    pub fn driver_worker_id(&self) -> String {
        format!("driver-{}", self.run_id)
    }
}

impl Default for RunIdents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique() {
        let a = RunIdents::new();
        let b = RunIdents::new();
        assert_ne!(a.run_id(), b.run_id());
    }

    #[test]
    fn test_job_id_embeds_team_run_and_counter() {
        let idents = RunIdents::with_run_id("r1");
        let team = idents.team_id("small", 3);
        assert_eq!(team, "surge-small-3");
        assert_eq!(idents.job_id(&team, 7), "job-surge-small-3-r1-7");
    }

    #[test]
    fn test_crawl_id_groups_by_decade() {
        let idents = RunIdents::with_run_id("r1");
        assert_eq!(idents.crawl_id("t", 0), idents.crawl_id("t", 9));
        assert_ne!(idents.crawl_id("t", 9), idents.crawl_id("t", 10));
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let first = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_ms() >= first);
    }
}
