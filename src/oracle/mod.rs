//! Passive correctness observer.
//!
//! The oracle receives callbacks for pushes, claims, and completions and
//! records enough state to decide, at end of test, whether every pushed job
//! was claimed exactly once, completed after being claimed, and claimed by
//! the tenant that pushed it. It never panics and never mutates scheduler
//! state; findings surface only in the final report.

use dashmap::DashMap;
use std::fmt;
use std::sync::Mutex;

/// Bookkeeping for one pushed job.
#[derive(Debug, Clone)]
pub struct OracleRecord {
    pub team_id: String,
    pub priority: i64,
    pub crawl_id: Option<String>,
    pub pushed_at: i64,
    pub confirmed: bool,
    pub claimed: bool,
    pub completed: bool,
}

/// A broken invariant observed at record time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The same job was claimed twice.
    DoubleClaim { job_id: String },
    /// A claim arrived for a job no confirmed push is known for.
    UnknownClaim { job_id: String },
    /// A promoted job completed without a preceding claim.
    CompleteBeforeClaim { job_id: String },
    /// A job pushed by one tenant was claimed by another.
    CrossTenantClaim {
        job_id: String,
        pushed_team: String,
        claimed_team: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DoubleClaim { job_id } => write!(f, "job {} claimed twice", job_id),
            Violation::UnknownClaim { job_id } => {
                write!(f, "job {} claimed without a confirmed push", job_id)
            }
            Violation::CompleteBeforeClaim { job_id } => {
                write!(f, "job {} completed before any claim", job_id)
            }
            Violation::CrossTenantClaim {
                job_id,
                pushed_team,
                claimed_team,
            } => write!(
                f,
                "job {} pushed by {} but claimed by {}",
                job_id, pushed_team, claimed_team
            ),
        }
    }
}

/// Violation counts by category plus leftover-job listings.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub total_pushes: usize,
    pub total_confirmed: usize,
    pub total_claims: usize,
    pub total_completes: usize,
    /// Jobs whose push was acknowledged but that were never claimed. These
    /// are expected when the remote queue still holds jobs at end of test.
    pub confirmed_never_claimed: Vec<String>,
    /// Promoted jobs that were claimed but never completed.
    pub claimed_never_completed: Vec<String>,
    pub double_claims: usize,
    pub unknown_claims: usize,
    pub completes_before_claim: usize,
    pub cross_tenant_claims: usize,
    pub priority_inversions: usize,
}

impl VerificationReport {
    pub fn total_violations(&self) -> usize {
        self.double_claims + self.unknown_claims + self.completes_before_claim + self.cross_tenant_claims
    }
}

pub struct Oracle {
    pushes: DashMap<String, OracleRecord>,
    claims: DashMap<String, ()>,
    /// Priority of the previous claim per tenant, for monotonicity checking.
    last_claimed_priority: DashMap<String, i64>,
    violations: Mutex<Vec<Violation>>,
    inversion_warnings: Mutex<Vec<String>>,
}

impl Oracle {
    pub fn new() -> Self {
        Self {
            pushes: DashMap::new(),
            claims: DashMap::new(),
            last_claimed_priority: DashMap::new(),
            violations: Mutex::new(Vec::new()),
            inversion_warnings: Mutex::new(Vec::new()),
        }
    }

    /// Called before the push request is issued. Re-pushes of the same job
    /// (push retries after transport failures) keep the original record.
    pub fn record_push(
        &self,
        job_id: &str,
        team_id: &str,
        priority: i64,
        crawl_id: Option<&str>,
    ) {
        self.pushes
            .entry(job_id.to_string())
            .or_insert_with(|| OracleRecord {
                team_id: team_id.to_string(),
                priority,
                crawl_id: crawl_id.map(str::to_string),
                pushed_at: crate::ident::unix_millis(),
                confirmed: false,
                claimed: false,
                completed: false,
            });
    }

    /// Called only once the push request returned 2xx.
    pub fn confirm_push(&self, job_id: &str) {
        if let Some(mut record) = self.pushes.get_mut(job_id) {
            record.confirmed = true;
        }
    }

    /// Called for every non-null pop result.
    pub fn record_claim(&self, job_id: &str, team_id: &str, priority: i64) {
        if self.claims.contains_key(job_id) {
            self.push_violation(Violation::DoubleClaim {
                job_id: job_id.to_string(),
            });
            return;
        }
        self.claims.insert(job_id.to_string(), ());

        match self.pushes.get_mut(job_id) {
            None => {
                self.push_violation(Violation::UnknownClaim {
                    job_id: job_id.to_string(),
                });
            }
            Some(mut record) => {
                if record.team_id != team_id {
                    self.push_violation(Violation::CrossTenantClaim {
                        job_id: job_id.to_string(),
                        pushed_team: record.team_id.clone(),
                        claimed_team: team_id.to_string(),
                    });
                }
                // A claim can outrun the push acknowledgement when the two
                // responses resolve on different tasks; the claim itself
                // proves the service accepted the push.
                record.confirmed = true;
                record.claimed = true;
            }
        }

        // Claims within a tenant must come back in non-decreasing priority.
        // An inversion is reported as a warning, not a violation.
        if let Some(previous) = self
            .last_claimed_priority
            .insert(team_id.to_string(), priority)
            && priority < previous
        {
            self.inversion_warnings.lock().expect("oracle lock poisoned").push(format!(
                "tenant {}: claim priority {} after {}",
                team_id, priority, previous
            ));
        }
    }

    /// Called when a claim is released back to the queue. The job becomes
    /// claimable again without tripping the double-claim rule.
    pub fn record_release(&self, job_id: &str) {
        self.claims.remove(job_id);
        if let Some(mut record) = self.pushes.get_mut(job_id) {
            record.claimed = false;
        }
    }

    /// Called when a promoted job finishes.
    pub fn record_complete(&self, job_id: &str) {
        if !self.claims.contains_key(job_id) {
            self.push_violation(Violation::CompleteBeforeClaim {
                job_id: job_id.to_string(),
            });
        }
        if let Some(mut record) = self.pushes.get_mut(job_id) {
            record.completed = true;
        }
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().expect("oracle lock poisoned").clone()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.lock().expect("oracle lock poisoned").len()
    }

    pub fn inversion_warnings(&self) -> Vec<String> {
        self.inversion_warnings
            .lock()
            .expect("oracle lock poisoned")
            .clone()
    }

    /// Snapshot of a job's record, mainly for tests.
    pub fn record_for(&self, job_id: &str) -> Option<OracleRecord> {
        self.pushes.get(job_id).map(|r| r.clone())
    }

    /// Builds the end-of-test report. Does not mutate state.
    pub fn run_end_of_test_verification(&self) -> VerificationReport {
        let mut report = VerificationReport {
            total_pushes: self.pushes.len(),
            total_claims: self.claims.len(),
            ..Default::default()
        };

        for entry in self.pushes.iter() {
            let record = entry.value();
            if record.confirmed {
                report.total_confirmed += 1;
                if !record.claimed {
                    report.confirmed_never_claimed.push(entry.key().clone());
                }
            }
            if record.completed {
                report.total_completes += 1;
            }
            if record.claimed && !record.completed {
                report.claimed_never_completed.push(entry.key().clone());
            }
        }
        report.confirmed_never_claimed.sort_unstable();
        report.claimed_never_completed.sort_unstable();

        for violation in self.violations.lock().expect("oracle lock poisoned").iter() {
            match violation {
                Violation::DoubleClaim { .. } => report.double_claims += 1,
                Violation::UnknownClaim { .. } => report.unknown_claims += 1,
                Violation::CompleteBeforeClaim { .. } => report.completes_before_claim += 1,
                Violation::CrossTenantClaim { .. } => report.cross_tenant_claims += 1,
            }
        }
        report.priority_inversions = self
            .inversion_warnings
            .lock()
            .expect("oracle lock poisoned")
            .len();

        report
    }

    fn push_violation(&self, violation: Violation) {
        tracing::debug!(violation = %violation, "oracle violation recorded");
        self.violations
            .lock()
            .expect("oracle lock poisoned")
            .push(violation);
    }
}

impl Default for Oracle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_and_confirm(oracle: &Oracle, job_id: &str, team: &str, priority: i64) {
        oracle.record_push(job_id, team, priority, None);
        oracle.confirm_push(job_id);
    }

    #[test]
    fn test_clean_lifecycle_has_no_violations() {
        let oracle = Oracle::new();
        push_and_confirm(&oracle, "j1", "t1", 10);
        oracle.record_claim("j1", "t1", 10);
        oracle.record_complete("j1");

        assert_eq!(oracle.violation_count(), 0);
        let report = oracle.run_end_of_test_verification();
        assert_eq!(report.total_violations(), 0);
        assert!(report.confirmed_never_claimed.is_empty());
        assert!(report.claimed_never_completed.is_empty());
    }

    #[test]
    fn test_double_claim_detected() {
        let oracle = Oracle::new();
        push_and_confirm(&oracle, "j1", "t1", 10);
        oracle.record_claim("j1", "t1", 10);
        oracle.record_claim("j1", "t1", 10);

        assert_eq!(
            oracle.violations(),
            vec![Violation::DoubleClaim {
                job_id: "j1".into()
            }]
        );
    }

    #[test]
    fn test_unknown_claim_detected() {
        let oracle = Oracle::new();
        oracle.record_claim("ghost", "t1", 5);
        assert_eq!(
            oracle.violations(),
            vec![Violation::UnknownClaim {
                job_id: "ghost".into()
            }]
        );
    }

    #[test]
    fn test_claim_of_in_flight_push_confirms_it() {
        let oracle = Oracle::new();
        oracle.record_push("j1", "t1", 10, None);
        // The pop response beat the push response; not a violation, and the
        // claim stands in for the missing confirmation.
        oracle.record_claim("j1", "t1", 10);
        assert_eq!(oracle.violation_count(), 0);
        assert!(oracle.record_for("j1").unwrap().confirmed);
    }

    #[test]
    fn test_release_permits_a_second_claim() {
        let oracle = Oracle::new();
        push_and_confirm(&oracle, "j1", "t1", 10);
        oracle.record_claim("j1", "t1", 10);
        oracle.record_release("j1");
        oracle.record_claim("j1", "t1", 10);
        assert_eq!(oracle.violation_count(), 0);
    }

    #[test]
    fn test_cross_tenant_claim_detected() {
        let oracle = Oracle::new();
        push_and_confirm(&oracle, "j1", "t1", 10);
        oracle.record_claim("j1", "t2", 10);

        let violations = oracle.violations();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            Violation::CrossTenantClaim { pushed_team, claimed_team, .. }
                if pushed_team == "t1" && claimed_team == "t2"
        ));
    }

    #[test]
    fn test_complete_before_claim_detected() {
        let oracle = Oracle::new();
        push_and_confirm(&oracle, "j1", "t1", 10);
        oracle.record_complete("j1");
        assert_eq!(
            oracle.violations(),
            vec![Violation::CompleteBeforeClaim {
                job_id: "j1".into()
            }]
        );
    }

    #[test]
    fn test_priority_inversion_is_warning_not_violation() {
        let oracle = Oracle::new();
        push_and_confirm(&oracle, "j1", "t1", 50);
        push_and_confirm(&oracle, "j2", "t1", 10);
        oracle.record_claim("j1", "t1", 50);
        oracle.record_claim("j2", "t1", 10);

        assert_eq!(oracle.violation_count(), 0);
        assert_eq!(oracle.inversion_warnings().len(), 1);
    }

    #[test]
    fn test_report_lists_leftovers() {
        let oracle = Oracle::new();
        push_and_confirm(&oracle, "never-claimed", "t1", 10);
        push_and_confirm(&oracle, "never-completed", "t1", 20);
        oracle.record_claim("never-completed", "t1", 20);

        let report = oracle.run_end_of_test_verification();
        assert_eq!(report.confirmed_never_claimed, vec!["never-claimed".to_string()]);
        assert_eq!(
            report.claimed_never_completed,
            vec!["never-completed".to_string()]
        );
        assert_eq!(report.total_confirmed, 2);
        assert_eq!(report.total_claims, 1);
    }

    #[test]
    fn test_push_retry_keeps_original_record() {
        let oracle = Oracle::new();
        oracle.record_push("j1", "t1", 10, Some("c1"));
        oracle.record_push("j1", "t1", 10, Some("c1"));
        oracle.confirm_push("j1");

        let report = oracle.run_end_of_test_verification();
        assert_eq!(report.total_pushes, 1);
        assert_eq!(report.total_confirmed, 1);
    }
}
