use clap::Parser;

/// Surge - stress driver for the per-tenant concurrency-queue service
///
/// Generates synthetic scrape jobs across simulated tenants, overflows them
/// into the remote concurrency queue when tenants are at capacity, and
/// verifies scheduling correctness while measuring request latencies.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    /// Base URL of the queue service (overrides SERVICE_URL)
    #[arg(long)]
    pub service_url: Option<String>,

    /// Load-generation duration in seconds (overrides DURATION)
    #[arg(long)]
    pub duration: Option<u64>,

    /// Remote-call task concurrency (overrides WORKER_CONCURRENCY)
    #[arg(long)]
    pub worker_concurrency: Option<usize>,

    /// Log every failed remote operation as it happens
    #[arg(long)]
    pub verbose: bool,

    /// Flush all configured tenants' remote state and exit without running
    #[arg(long)]
    pub flush_only: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum TracingFormat {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Pretty;
#[cfg(not(debug_assertions))]
const DEFAULT_TRACING_FORMAT: TracingFormat = TracingFormat::Json;

fn default_tracing_format() -> TracingFormat {
    DEFAULT_TRACING_FORMAT
}
