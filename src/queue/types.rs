//! Wire types for the queue-service REST contract.
//!
//! Request bodies use camelCase keys; the pop response uses the service's
//! snake_case field names. Both shapes are pinned by serde attributes so the
//! structs themselves can stay idiomatic.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest<'a> {
    pub team_id: &'a str,
    pub job: PushJobBody<'a>,
    /// Lease timeout in milliseconds granted to whoever claims the job.
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crawl_id: Option<&'a str>,
}

#[derive(Serialize, Debug)]
pub struct PushJobBody<'a> {
    pub id: &'a str,
    pub data: serde_json::Value,
    pub priority: i64,
    pub listenable: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PopRequest<'a> {
    pub worker_id: &'a str,
    pub blocked_crawl_ids: &'a [String],
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest<'a> {
    pub queue_key: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest<'a> {
    pub job_id: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ActivePushRequest<'a> {
    pub team_id: &'a str,
    pub job_id: &'a str,
    pub timeout: u64,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRemoveRequest<'a> {
    pub team_id: &'a str,
    pub job_id: &'a str,
}

/// A successful pop: the job plus the opaque key completion requires.
#[derive(Deserialize, Debug, Clone)]
pub struct ClaimedJob {
    pub job: QueueJob,
    #[serde(rename = "queueKey")]
    pub queue_key: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct QueueJob {
    pub id: String,
    pub priority: i64,
    pub created_at: i64,
    #[serde(default)]
    pub crawl_id: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Deserialize, Debug)]
pub struct CompleteResponse {
    pub success: bool,
}

/// Outcome of one remote operation.
///
/// Remote failures are data, not control flow: the scheduler inspects
/// `success` and leaves the triggering state in place for a later retry.
#[derive(Debug)]
pub struct OpResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> OpResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
