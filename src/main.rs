use clap::Parser;
use figment::{Figment, providers::Env};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use surge::cli::Args;
use surge::config::Config;
use surge::ident::RunIdents;
use surge::metrics::MetricsCollector;
use surge::oracle::Oracle;
use surge::queue::QueueClient;
use surge::scheduler::{Driver, DriverParams, SchedulerCore};
use surge::{logging, report, shutdown};

const HEALTH_CHECK_ATTEMPTS: u32 = 3;
const HEALTH_CHECK_BACKOFF: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config: Config = match Figment::new().merge(Env::raw()).extract() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    // CLI flags win over the environment.
    if let Some(url) = args.service_url {
        config.service_url = url;
    }
    if let Some(seconds) = args.duration {
        config.duration = Duration::from_secs(seconds);
    }
    if let Some(concurrency) = args.worker_concurrency {
        config.worker_concurrency = concurrency;
    }
    if args.verbose {
        config.verbose = true;
    }

    logging::setup_logging(&config, args.tracing);

    let idents = RunIdents::new();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        run_id = idents.run_id(),
        service_url = config.service_url,
        duration = format!("{:.2?}", config.duration),
        worker_concurrency = config.worker_concurrency,
        correctness_checking = config.correctness_checking,
        "starting surge"
    );

    let metrics = Arc::new(MetricsCollector::new(config.metrics_buffer_size));
    let oracle = config.correctness_checking.then(|| Arc::new(Oracle::new()));

    let client = match QueueClient::new(
        &config.service_url,
        idents.driver_worker_id(),
        metrics.clone(),
        oracle.clone(),
        config.verbose,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = ?e, "failed to build queue client");
            return ExitCode::FAILURE;
        }
    };

    let mut healthy = false;
    for attempt in 1..=HEALTH_CHECK_ATTEMPTS {
        if client.health().await {
            healthy = true;
            break;
        }
        warn!(attempt, "queue service not healthy yet");
        time::sleep(HEALTH_CHECK_BACKOFF).await;
    }
    if !healthy {
        error!(
            service_url = config.service_url,
            "queue service failed health check"
        );
        return ExitCode::FAILURE;
    }

    let core = SchedulerCore::new(
        &config.team_tiers,
        idents.clone(),
        config.job_processing_delay.as_millis() as u64,
    );

    if args.flush_only || config.flush_before_run {
        let flushes = core.team_ids().into_iter().map(|team_id| {
            let client = client.clone();
            async move {
                let result = client.flush_team(&team_id).await;
                (team_id, result)
            }
        });

        let mut drained = 0;
        let mut removed = 0;
        for (team_id, result) in futures::future::join_all(flushes).await {
            match result {
                Ok(stats) => {
                    drained += stats.drained;
                    removed += stats.active_removed;
                }
                Err(e) => warn!(team_id, error = ?e, "flush failed"),
            }
        }
        info!(drained, active_removed = removed, "tenant flush complete");
        if args.flush_only {
            return ExitCode::SUCCESS;
        }
    }

    let cancel = CancellationToken::new();
    let signal_handle = shutdown::spawn_signal_listener(cancel.clone());

    let params = DriverParams {
        duration: config.duration,
        worker_concurrency: config.worker_concurrency,
        report_interval: config.report_interval,
        job_processing_delay: config.job_processing_delay,
    };
    let driver = Driver::new(
        core,
        client.clone(),
        oracle.clone(),
        metrics.clone(),
        params,
        cancel.clone(),
    );

    let summary = driver.run().await;
    signal_handle.abort();

    report::print_final_report(idents.run_id(), &summary, &metrics, oracle.as_deref());
    info!(
        generated = summary.generated,
        completed = summary.completed,
        "run complete"
    );
    ExitCode::SUCCESS
}
