//! A single tenant at a generation rate well above its concurrency limit:
//! jobs must overflow to the remote queue and still all complete via
//! promotion, with no correctness violations.

mod helpers;

use helpers::MockQueueService;
use std::sync::Arc;
use std::time::Duration;
use surge::config::TierConfig;
use surge::ident::RunIdents;
use surge::metrics::MetricsCollector;
use surge::oracle::Oracle;
use surge::queue::QueueClient;
use surge::scheduler::{Driver, DriverParams, SchedulerCore};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_single_tenant_saturation() {
    let service = MockQueueService::start().await;
    let metrics = Arc::new(MetricsCollector::new(1000));
    let oracle = Arc::new(Oracle::new());
    let client = Arc::new(
        QueueClient::new(
            &service.url(),
            "driver-sat",
            metrics.clone(),
            Some(oracle.clone()),
            false,
        )
        .expect("client should build"),
    );

    let tiers = vec![TierConfig {
        name: "solo".to_string(),
        team_count: 1,
        concurrency_limit: 2,
        jobs_per_second: 10.0,
    }];
    let core = SchedulerCore::new(&tiers, RunIdents::with_run_id("sat"), 200);

    let params = DriverParams {
        duration: Duration::from_secs(2),
        worker_concurrency: 20,
        report_interval: Duration::from_secs(60),
        job_processing_delay: Duration::from_millis(200),
    };
    let driver = Driver::new(
        core,
        client,
        Some(oracle.clone()),
        metrics.clone(),
        params,
        CancellationToken::new(),
    );
    let summary = driver.run().await;

    assert!(
        summary.completed >= 15,
        "only {} of {} generated jobs completed",
        summary.completed,
        summary.generated
    );
    assert!(
        service.push_count() >= 1,
        "saturated tenant never overflowed to the remote queue"
    );
    assert_eq!(oracle.violation_count(), 0, "{:?}", oracle.violations());
    assert_eq!(summary.still_active, 0, "drain left jobs active");

    // Every acknowledged push was either claimed or is still sitting in the
    // remote queue.
    let report = oracle.run_end_of_test_verification();
    assert_eq!(
        report.confirmed_never_claimed.len() as u64,
        summary.remote_queued,
        "confirmed-but-unclaimed jobs should match the remote queue leftover"
    );
}
