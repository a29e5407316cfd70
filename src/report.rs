//! Final run report.
//!
//! Progress during the run goes through tracing; the end-of-run summary is
//! printed straight to stdout so it survives any log filtering.

use num_format::{Locale, ToFormattedString};

use crate::metrics::{MetricsCollector, Operation};
use crate::oracle::Oracle;
use crate::scheduler::DriverSummary;

/// Bounded list of error records shown in the final report.
const RECENT_ERROR_LIMIT: usize = 10;

pub fn print_final_report(
    run_id: &str,
    summary: &DriverSummary,
    metrics: &MetricsCollector,
    oracle: Option<&Oracle>,
) {
    println!();
    println!("================ surge run report ================");
    println!("run id:        {}", run_id);
    println!("elapsed:       {:.2?}", summary.elapsed);
    println!(
        "jobs:          {} generated, {} completed",
        summary.generated.to_formatted_string(&Locale::en),
        summary.completed.to_formatted_string(&Locale::en),
    );
    println!(
        "leftover:      {} active, {} remote-queued, {} undispatched",
        summary.still_active,
        summary.remote_queued.to_formatted_string(&Locale::en),
        summary.undispatched,
    );
    if summary.drain_stalled {
        println!("drain:         STALLED (active count stopped moving)");
    }

    println!();
    println!("operation        total    ok%      p50     p90     p95     p99     max");
    for operation in Operation::ALL {
        let stats = metrics.stats(operation);
        if stats.total_requests == 0 {
            continue;
        }
        println!(
            "{:<16} {:>6}  {:>5.1}  {:>6}  {:>6}  {:>6}  {:>6}  {:>6}",
            operation.as_str(),
            stats.total_requests,
            stats.success_rate * 100.0,
            stats.latency.p50,
            stats.latency.p90,
            stats.latency.p95,
            stats.latency.p99,
            stats.latency.max,
        );
    }
    println!("(latencies in ms over the sampled window)");

    let breakdown = metrics.error_breakdown();
    println!();
    println!(
        "errors:        {} total (4xx {}, 5xx {}, network {}, timeout {}, other {})",
        metrics.total_errors(),
        breakdown.http_4xx,
        breakdown.http_5xx,
        breakdown.network,
        breakdown.timeout,
        breakdown.other,
    );
    for record in metrics.recent_errors(RECENT_ERROR_LIMIT) {
        let status = record
            .http_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{}] {} status={} {}",
            record.operation.as_str(),
            record.error.as_deref().unwrap_or("unknown error"),
            status,
            record.response_body.as_deref().unwrap_or(""),
        );
    }

    if let Some(oracle) = oracle {
        let report = oracle.run_end_of_test_verification();
        println!();
        println!(
            "oracle:        {} pushes ({} confirmed), {} claims, {} completes",
            report.total_pushes, report.total_confirmed, report.total_claims, report.total_completes,
        );
        println!(
            "               {} never claimed (still queued remotely), {} claimed but not completed",
            report.confirmed_never_claimed.len(),
            report.claimed_never_completed.len(),
        );
        if report.total_violations() == 0 {
            println!("               no violations");
        } else {
            println!(
                "               VIOLATIONS: {} double-claim, {} unknown-claim, {} complete-before-claim, {} cross-tenant",
                report.double_claims,
                report.unknown_claims,
                report.completes_before_claim,
                report.cross_tenant_claims,
            );
            for violation in oracle.violations().iter().take(RECENT_ERROR_LIMIT) {
                println!("                 - {}", violation);
            }
        }
        if report.priority_inversions > 0 {
            println!(
                "               warnings: {} priority inversions",
                report.priority_inversions
            );
        }
    }
    println!("==================================================");
}
