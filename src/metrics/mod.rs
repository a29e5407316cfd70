//! Latency and error accounting for remote queue operations.
//!
//! Every remote call records exactly one sample. Samples live in a
//! fixed-capacity ring per operation; percentiles are computed on demand by
//! sorting the current ring contents rather than maintaining a digest.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum length of a captured response body.
const RESPONSE_BODY_LIMIT: usize = 300;

/// Remote queue operations the collector distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Push,
    Pop,
    Complete,
    Release,
    ActivePush,
    ActiveRemove,
    ActiveCount,
    TeamQueueCount,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Push,
        Operation::Pop,
        Operation::Complete,
        Operation::Release,
        Operation::ActivePush,
        Operation::ActiveRemove,
        Operation::ActiveCount,
        Operation::TeamQueueCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Push => "push",
            Operation::Pop => "pop",
            Operation::Complete => "complete",
            Operation::Release => "release",
            Operation::ActivePush => "activePush",
            Operation::ActiveRemove => "activeRemove",
            Operation::ActiveCount => "activeCount",
            Operation::TeamQueueCount => "teamQueueCount",
        }
    }
}

/// One recorded remote call.
#[derive(Debug, Clone)]
pub struct MetricsRecord {
    pub operation: Operation,
    pub latency_ms: u64,
    pub success: bool,
    /// Present only when an HTTP response was received.
    pub http_status: Option<u16>,
    pub error: Option<String>,
    /// Truncated response body text, captured on non-2xx responses.
    pub response_body: Option<String>,
    /// Wall-clock millis, for display only.
    pub recorded_at: i64,
    seq: u64,
}

/// Latency summary over the current sample buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
}

/// Per-operation request summary over the current sample buffer.
#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    pub total_requests: usize,
    pub success_count: usize,
    pub success_rate: f64,
    pub latency: LatencyPercentiles,
}

/// Error counts by coarse failure class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorBreakdown {
    pub http_4xx: usize,
    pub http_5xx: usize,
    pub network: usize,
    pub timeout: usize,
    pub other: usize,
}

pub struct MetricsCollector {
    buffer_size: usize,
    seq: AtomicU64,
    rings: Mutex<HashMap<Operation, VecDeque<MetricsRecord>>>,
}

impl MetricsCollector {
    pub fn new(buffer_size: usize) -> Self {
        let mut rings = HashMap::new();
        for op in Operation::ALL {
            rings.insert(op, VecDeque::with_capacity(buffer_size.min(1024)));
        }
        Self {
            buffer_size: buffer_size.max(1),
            seq: AtomicU64::new(0),
            rings: Mutex::new(rings),
        }
    }

    /// Appends a sample; the oldest sample of the operation is dropped when
    /// the ring is full.
    pub fn record(
        &self,
        operation: Operation,
        latency_ms: u64,
        success: bool,
        http_status: Option<u16>,
        error: Option<String>,
        response_body: Option<String>,
    ) {
        let record = MetricsRecord {
            operation,
            latency_ms,
            success,
            http_status,
            error,
            response_body: response_body.map(|b| truncate(b, RESPONSE_BODY_LIMIT)),
            recorded_at: crate::ident::unix_millis(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        let mut rings = self.rings.lock().expect("metrics lock poisoned");
        let ring = rings.entry(operation).or_default();
        if ring.len() >= self.buffer_size {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Summary for one operation over its current sample buffer.
    pub fn stats(&self, operation: Operation) -> OperationStats {
        let rings = self.rings.lock().expect("metrics lock poisoned");
        let Some(ring) = rings.get(&operation) else {
            return OperationStats::default();
        };

        let total_requests = ring.len();
        let success_count = ring.iter().filter(|r| r.success).count();
        let success_rate = if total_requests == 0 {
            0.0
        } else {
            success_count as f64 / total_requests as f64
        };

        let mut latencies: Vec<u64> = ring.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();

        OperationStats {
            total_requests,
            success_count,
            success_rate,
            latency: LatencyPercentiles {
                p50: percentile(&latencies, 50),
                p90: percentile(&latencies, 90),
                p95: percentile(&latencies, 95),
                p99: percentile(&latencies, 99),
                max: latencies.last().copied().unwrap_or(0),
            },
        }
    }

    /// Count of unsuccessful samples across all operations.
    pub fn total_errors(&self) -> usize {
        let rings = self.rings.lock().expect("metrics lock poisoned");
        rings
            .values()
            .flat_map(|ring| ring.iter())
            .filter(|r| !r.success)
            .count()
    }

    /// Error counts classified from status code and message text.
    pub fn error_breakdown(&self) -> ErrorBreakdown {
        let rings = self.rings.lock().expect("metrics lock poisoned");
        let mut breakdown = ErrorBreakdown::default();
        for record in rings.values().flat_map(|ring| ring.iter()) {
            if record.success {
                continue;
            }
            match classify(record) {
                ErrorClass::Http4xx => breakdown.http_4xx += 1,
                ErrorClass::Http5xx => breakdown.http_5xx += 1,
                ErrorClass::Network => breakdown.network += 1,
                ErrorClass::Timeout => breakdown.timeout += 1,
                ErrorClass::Other => breakdown.other += 1,
            }
        }
        breakdown
    }

    /// The `n` most recent error records, newest first.
    pub fn recent_errors(&self, n: usize) -> Vec<MetricsRecord> {
        let rings = self.rings.lock().expect("metrics lock poisoned");
        let mut errors: Vec<MetricsRecord> = rings
            .values()
            .flat_map(|ring| ring.iter())
            .filter(|r| !r.success)
            .cloned()
            .collect();
        errors.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
        errors.truncate(n);
        errors
    }
}

enum ErrorClass {
    Http4xx,
    Http5xx,
    Network,
    Timeout,
    Other,
}

fn classify(record: &MetricsRecord) -> ErrorClass {
    match record.http_status {
        Some(status) if (400..500).contains(&status) => ErrorClass::Http4xx,
        Some(status) if status >= 500 => ErrorClass::Http5xx,
        Some(_) => ErrorClass::Other,
        None => {
            let message = record
                .error
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if message.contains("timeout") || message.contains("timed out") {
                ErrorClass::Timeout
            } else if message.contains("connect")
                || message.contains("dns")
                || message.contains("network")
                || message.contains("sending request")
            {
                ErrorClass::Network
            } else {
                ErrorClass::Other
            }
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[u64], q: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (q as usize * sorted.len()).div_ceil(100);
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

fn truncate(mut body: String, limit: usize) -> String {
    if body.len() > limit {
        let mut cut = limit;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
