//! In-process mock of the concurrency-queue service REST contract.
//!
//! Implements per-team priority-ordered queues, queue-key leases,
//! active-job tracking, the count endpoints, and per-operation fault
//! injection (probability of responding HTTP 500).
#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct StoredJob {
    id: String,
    team_id: String,
    priority: i64,
    created_at: i64,
    crawl_id: Option<String>,
}

#[derive(Debug)]
struct QueuedEntry {
    priority: i64,
    seq: u64,
    job: StoredJob,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

/// Per-operation failure probability, stored as per-mille.
#[derive(Default)]
pub struct FaultPlan {
    push: AtomicU64,
    pop: AtomicU64,
    complete: AtomicU64,
}

impl FaultPlan {
    fn should_fail(&self, cell: &AtomicU64) -> bool {
        let per_mille = cell.load(AtomicOrdering::Relaxed);
        per_mille > 0 && rand::random_range(0..1000) < per_mille
    }
}

#[derive(Default)]
pub struct MockState {
    queues: Mutex<HashMap<String, BinaryHeap<Reverse<QueuedEntry>>>>,
    leases: Mutex<HashMap<String, StoredJob>>,
    active: Mutex<HashMap<String, HashSet<String>>>,
    seq: AtomicU64,
    key_seq: AtomicU64,
    pub push_count: AtomicU64,
    pub pop_count: AtomicU64,
    pub fault: FaultPlan,
}

pub struct MockQueueService {
    pub state: Arc<MockState>,
    addr: SocketAddr,
}

impl MockQueueService {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/health", get(health))
            .route("/queue/push", post(push))
            .route("/queue/pop/{team_id}", post(pop))
            .route("/queue/complete", post(complete))
            .route("/queue/release", post(release))
            .route("/active/push", post(active_push))
            .route("/active/remove", delete(active_remove))
            .route("/active/count/{team_id}", get(active_count))
            .route("/active/jobs/{team_id}", get(active_jobs))
            .route("/queue/count/team/{team_id}", get(team_queue_count))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("mock service bind failed");
        let addr = listener.local_addr().expect("mock service addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock service crashed");
        });

        Self { state, addr }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Fraction of push requests that should fail with HTTP 500.
    pub fn inject_push_failures(&self, rate: f64) {
        self.state
            .fault
            .push
            .store((rate * 1000.0) as u64, AtomicOrdering::Relaxed);
    }

    pub fn inject_pop_failures(&self, rate: f64) {
        self.state
            .fault
            .pop
            .store((rate * 1000.0) as u64, AtomicOrdering::Relaxed);
    }

    pub fn push_count(&self) -> u64 {
        self.state.push_count.load(AtomicOrdering::Relaxed)
    }

    pub fn pop_count(&self) -> u64 {
        self.state.pop_count.load(AtomicOrdering::Relaxed)
    }

    pub fn queued_for(&self, team_id: &str) -> usize {
        self.state
            .queues
            .lock()
            .unwrap()
            .get(team_id)
            .map_or(0, BinaryHeap::len)
    }

    pub fn total_queued(&self) -> usize {
        self.state
            .queues
            .lock()
            .unwrap()
            .values()
            .map(BinaryHeap::len)
            .sum()
    }

    pub fn lease_count(&self) -> usize {
        self.state.leases.lock().unwrap().len()
    }

    pub fn active_for(&self, team_id: &str) -> usize {
        self.state
            .active
            .lock()
            .unwrap()
            .get(team_id)
            .map_or(0, HashSet::len)
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn push(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if state.fault.should_fail(&state.fault.push) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let team_id = body["teamId"].as_str().unwrap_or_default().to_string();
    let job = &body["job"];
    let stored = StoredJob {
        id: job["id"].as_str().unwrap_or_default().to_string(),
        team_id: team_id.clone(),
        priority: job["priority"].as_i64().unwrap_or(100),
        created_at: chrono::Utc::now().timestamp_millis(),
        crawl_id: body["crawlId"].as_str().map(str::to_string),
    };

    let entry = QueuedEntry {
        priority: stored.priority,
        seq: state.seq.fetch_add(1, AtomicOrdering::Relaxed),
        job: stored,
    };
    state
        .queues
        .lock()
        .unwrap()
        .entry(team_id)
        .or_default()
        .push(Reverse(entry));
    state.push_count.fetch_add(1, AtomicOrdering::Relaxed);

    Json(json!({"ok": true})).into_response()
}

async fn pop(
    State(state): State<Arc<MockState>>,
    Path(team_id): Path<String>,
    Json(_body): Json<Value>,
) -> Response {
    if state.fault.should_fail(&state.fault.pop) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }
    state.pop_count.fetch_add(1, AtomicOrdering::Relaxed);

    let popped = state
        .queues
        .lock()
        .unwrap()
        .get_mut(&team_id)
        .and_then(BinaryHeap::pop);
    let Some(Reverse(entry)) = popped else {
        return Json(Value::Null).into_response();
    };

    let queue_key = format!("qk-{}", state.key_seq.fetch_add(1, AtomicOrdering::Relaxed));
    let response = json!({
        "job": {
            "id": entry.job.id,
            "priority": entry.job.priority,
            "created_at": entry.job.created_at,
            "crawl_id": entry.job.crawl_id,
        },
        "queueKey": queue_key,
    });
    state.leases.lock().unwrap().insert(queue_key, entry.job);

    Json(response).into_response()
}

async fn complete(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if state.fault.should_fail(&state.fault.complete) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let queue_key = body["queueKey"].as_str().unwrap_or_default();
    let removed = state.leases.lock().unwrap().remove(queue_key).is_some();
    Json(json!({"success": removed})).into_response()
}

async fn release(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let job_id = body["jobId"].as_str().unwrap_or_default();

    let mut leases = state.leases.lock().unwrap();
    let key = leases
        .iter()
        .find(|(_, job)| job.id == job_id)
        .map(|(key, _)| key.clone());
    let Some(key) = key else {
        return (StatusCode::NOT_FOUND, "no such lease").into_response();
    };
    let job = leases.remove(&key).expect("lease disappeared");
    drop(leases);

    let entry = QueuedEntry {
        priority: job.priority,
        seq: state.seq.fetch_add(1, AtomicOrdering::Relaxed),
        job,
    };
    state
        .queues
        .lock()
        .unwrap()
        .entry(entry.job.team_id.clone())
        .or_default()
        .push(Reverse(entry));

    Json(json!({"ok": true})).into_response()
}

async fn active_push(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> StatusCode {
    let team_id = body["teamId"].as_str().unwrap_or_default().to_string();
    let job_id = body["jobId"].as_str().unwrap_or_default().to_string();
    state
        .active
        .lock()
        .unwrap()
        .entry(team_id)
        .or_default()
        .insert(job_id);
    StatusCode::OK
}

async fn active_remove(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> StatusCode {
    let team_id = body["teamId"].as_str().unwrap_or_default();
    let job_id = body["jobId"].as_str().unwrap_or_default();
    if let Some(set) = state.active.lock().unwrap().get_mut(team_id) {
        set.remove(job_id);
    }
    StatusCode::OK
}

async fn active_count(
    State(state): State<Arc<MockState>>,
    Path(team_id): Path<String>,
) -> Json<Value> {
    let count = state
        .active
        .lock()
        .unwrap()
        .get(&team_id)
        .map_or(0, HashSet::len);
    Json(json!({"count": count}))
}

async fn active_jobs(
    State(state): State<Arc<MockState>>,
    Path(team_id): Path<String>,
) -> Json<Vec<String>> {
    let ids = state
        .active
        .lock()
        .unwrap()
        .get(&team_id)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default();
    Json(ids)
}

async fn team_queue_count(
    State(state): State<Arc<MockState>>,
    Path(team_id): Path<String>,
) -> Json<Value> {
    let count = state
        .queues
        .lock()
        .unwrap()
        .get(&team_id)
        .map_or(0, BinaryHeap::len);
    Json(json!({"count": count}))
}
