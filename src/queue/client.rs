//! Queue-service client implementation.
//!
//! Every operation is timed against a monotonic clock and records exactly
//! one metrics sample. Push and pop additionally notify the oracle, which is
//! wired here because this is where ground truth first becomes known.

use crate::error::Result;
use crate::metrics::{MetricsCollector, Operation};
use crate::oracle::Oracle;
use crate::queue::types::*;
use crate::scheduler::MainQueueJob;
use anyhow::Context;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Lease timeout granted to claimed jobs, in milliseconds.
const JOB_LEASE_TIMEOUT_MS: u64 = 60_000;

/// Flush pops wait longer than regular calls; the service long-polls.
const FLUSH_POP_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of one dispatched request.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl QueueError {
    fn http_status(&self) -> Option<u16> {
        match self {
            QueueError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn response_body(&self) -> Option<String> {
        match self {
            QueueError::Status { body, .. } if !body.is_empty() => Some(body.clone()),
            _ => None,
        }
    }
}

/// What a tenant flush removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushStats {
    pub drained: usize,
    pub active_removed: usize,
}

/// Typed, metered, oracle-observed wrapper over the queue-service REST API.
pub struct QueueClient {
    http: reqwest::Client,
    base_url: String,
    worker_id: String,
    metrics: Arc<MetricsCollector>,
    oracle: Option<Arc<Oracle>>,
    verbose: bool,
}

impl QueueClient {
    pub fn new(
        base_url: impl Into<String>,
        worker_id: impl Into<String>,
        metrics: Arc<MetricsCollector>,
        oracle: Option<Arc<Oracle>>,
        verbose: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .tcp_keepalive(Some(Duration::from_secs(60 * 5)))
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            worker_id: worker_id.into(),
            metrics,
            oracle,
            verbose,
        })
    }

    /// Health probe. Deliberately unmetered: it is a startup gate, not a
    /// measured operation.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Pushes an overflowed job into the tenant's remote queue.
    pub async fn push(&self, job: &MainQueueJob) -> OpResult<()> {
        if let Some(oracle) = &self.oracle {
            oracle.record_push(&job.job_id, &job.team_id, job.priority, job.crawl_id.as_deref());
        }

        let body = PushRequest {
            team_id: &job.team_id,
            job: PushJobBody {
                id: &job.job_id,
                data: serde_json::json!({
                    "url": format!("https://surge.invalid/{}", job.job_id),
                    "mode": "scrape",
                }),
                priority: job.priority,
                listenable: false,
            },
            timeout: JOB_LEASE_TIMEOUT_MS,
            crawl_id: job.crawl_id.as_deref(),
        };

        let url = format!("{}/queue/push", self.base_url);
        let result = self
            .execute_unit(Operation::Push, self.http.post(&url).json(&body))
            .await;

        if result.success && let Some(oracle) = &self.oracle {
            oracle.confirm_push(&job.job_id);
        }
        result
    }

    /// Pops the highest-priority queued job for a tenant, if any.
    pub async fn pop(&self, team_id: &str) -> OpResult<Option<ClaimedJob>> {
        let url = format!("{}/queue/pop/{}", self.base_url, team_id);
        let blocked: [String; 0] = [];
        let body = PopRequest {
            worker_id: &self.worker_id,
            blocked_crawl_ids: &blocked,
        };

        let result = self
            .execute::<Option<ClaimedJob>>(Operation::Pop, self.http.post(&url).json(&body))
            .await;

        if let Some(Some(claim)) = &result.data
            && let Some(oracle) = &self.oracle
        {
            oracle.record_claim(&claim.job.id, team_id, claim.job.priority);
        }
        result
    }

    /// Acknowledges a claimed job by its queue key.
    pub async fn complete(&self, queue_key: &str) -> OpResult<bool> {
        let url = format!("{}/queue/complete", self.base_url);
        let body = CompleteRequest { queue_key };
        let result = self
            .execute::<CompleteResponse>(Operation::Complete, self.http.post(&url).json(&body))
            .await;

        OpResult {
            success: result.success,
            data: result.data.map(|r| r.success),
            error: result.error,
        }
    }

    /// Returns a claimed job to its queue.
    pub async fn release(&self, job_id: &str) -> OpResult<()> {
        let url = format!("{}/queue/release", self.base_url);
        let body = ReleaseRequest { job_id };
        let result = self
            .execute_unit(Operation::Release, self.http.post(&url).json(&body))
            .await;

        if result.success && let Some(oracle) = &self.oracle {
            oracle.record_release(job_id);
        }
        result
    }

    /// Registers a started job in the service's active-job tracking.
    pub async fn active_push(&self, team_id: &str, job_id: &str) -> OpResult<()> {
        let url = format!("{}/active/push", self.base_url);
        let body = ActivePushRequest {
            team_id,
            job_id,
            timeout: JOB_LEASE_TIMEOUT_MS,
        };
        self.execute_unit(Operation::ActivePush, self.http.post(&url).json(&body))
            .await
    }

    /// Removes a finished job from active-job tracking.
    pub async fn active_remove(&self, team_id: &str, job_id: &str) -> OpResult<()> {
        let url = format!("{}/active/remove", self.base_url);
        let body = ActiveRemoveRequest { team_id, job_id };
        self.execute_unit(Operation::ActiveRemove, self.http.delete(&url).json(&body))
            .await
    }

    /// Remote count of a tenant's tracked active jobs. Advisory only.
    pub async fn active_count(&self, team_id: &str) -> OpResult<u64> {
        let url = format!("{}/active/count/{}", self.base_url, team_id);
        let result = self
            .execute::<CountResponse>(Operation::ActiveCount, self.http.get(&url))
            .await;
        OpResult {
            success: result.success,
            data: result.data.map(|r| r.count),
            error: result.error,
        }
    }

    /// Remote count of a tenant's queued jobs.
    pub async fn team_queue_count(&self, team_id: &str) -> OpResult<u64> {
        let url = format!("{}/queue/count/team/{}", self.base_url, team_id);
        let result = self
            .execute::<CountResponse>(Operation::TeamQueueCount, self.http.get(&url))
            .await;
        OpResult {
            success: result.success,
            data: result.data.map(|r| r.count),
            error: result.error,
        }
    }

    /// Drains a tenant's remote queue and active tracking.
    ///
    /// Used before a run for a clean slate and by `--flush-only`. Flush
    /// traffic is maintenance, not measurement: it records no metrics and
    /// never touches the oracle, and pops under a `flush-` worker id so the
    /// oracle could not mistake them for driver claims even if wired up.
    pub async fn flush_team(&self, team_id: &str) -> Result<FlushStats> {
        let worker_id = format!("flush-{}", self.worker_id);
        let pop_url = format!("{}/queue/pop/{}", self.base_url, team_id);
        let complete_url = format!("{}/queue/complete", self.base_url);
        let blocked: [String; 0] = [];

        let mut stats = FlushStats::default();
        let mut consecutive_empty = 0;
        while consecutive_empty < 3 {
            let body = PopRequest {
                worker_id: &worker_id,
                blocked_crawl_ids: &blocked,
            };
            let response = self
                .http
                .post(&pop_url)
                .timeout(FLUSH_POP_TIMEOUT)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("flush pop failed for {team_id}"))?;
            if !response.status().is_success() {
                anyhow::bail!("flush pop for {} returned {}", team_id, response.status());
            }
            let claim: Option<ClaimedJob> = response
                .json()
                .await
                .with_context(|| format!("flush pop decode failed for {team_id}"))?;

            match claim {
                Some(claim) => {
                    stats.drained += 1;
                    consecutive_empty = 0;
                    // Complete best-effort; an expired lease re-queues the
                    // job and a later pop drains it again.
                    let body = CompleteRequest {
                        queue_key: &claim.queue_key,
                    };
                    let _ = self
                        .http
                        .post(&complete_url)
                        .timeout(FLUSH_CALL_TIMEOUT)
                        .json(&body)
                        .send()
                        .await;
                }
                None => consecutive_empty += 1,
            }
        }

        let jobs_url = format!("{}/active/jobs/{}", self.base_url, team_id);
        let response = self
            .http
            .get(&jobs_url)
            .timeout(FLUSH_CALL_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("flush active listing failed for {team_id}"))?;
        let active_ids: Vec<String> = if response.status().is_success() {
            response.json().await.unwrap_or_default()
        } else {
            Vec::new()
        };

        let remove_url = format!("{}/active/remove", self.base_url);
        for job_id in &active_ids {
            let body = ActiveRemoveRequest { team_id, job_id };
            let _ = self
                .http
                .delete(&remove_url)
                .timeout(FLUSH_CALL_TIMEOUT)
                .json(&body)
                .send()
                .await;
        }
        stats.active_removed = active_ids.len();

        Ok(stats)
    }

    /// Times one request, parses JSON on 2xx, and records exactly one
    /// metrics sample.
    async fn execute<T: DeserializeOwned>(
        &self,
        operation: Operation,
        request: reqwest::RequestBuilder,
    ) -> OpResult<T> {
        let started = Instant::now();
        let outcome = Self::dispatch::<T>(request).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok((data, status)) => {
                self.metrics
                    .record(operation, latency_ms, true, Some(status), None, None);
                OpResult::ok(data)
            }
            Err(error) => self.record_failure(operation, latency_ms, error),
        }
    }

    /// Like `execute` but treats any 2xx as success and ignores the body.
    async fn execute_unit(
        &self,
        operation: Operation,
        request: reqwest::RequestBuilder,
    ) -> OpResult<()> {
        let started = Instant::now();
        let outcome = Self::dispatch_unit(request).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(status) => {
                self.metrics
                    .record(operation, latency_ms, true, Some(status), None, None);
                OpResult::ok(())
            }
            Err(error) => self.record_failure(operation, latency_ms, error),
        }
    }

    fn record_failure<T>(
        &self,
        operation: Operation,
        latency_ms: u64,
        error: QueueError,
    ) -> OpResult<T> {
        let message = error.to_string();
        self.metrics.record(
            operation,
            latency_ms,
            false,
            error.http_status(),
            Some(message.clone()),
            error.response_body(),
        );
        if self.verbose {
            warn!(
                operation = operation.as_str(),
                error = %message,
                "queue operation failed"
            );
        }
        OpResult::failed(message)
    }

    async fn dispatch<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<(T, u16), QueueError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let status = status.as_u16();
        let data = response
            .json::<T>()
            .await
            .map_err(|e| QueueError::Decode(e.to_string()))?;
        Ok((data, status))
    }

    async fn dispatch_unit(request: reqwest::RequestBuilder) -> Result<u16, QueueError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueueError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(status.as_u16())
    }
}
