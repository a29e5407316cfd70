//! Client for the remote per-tenant concurrency-queue service.

pub mod client;
pub mod types;

pub use client::{FlushStats, QueueClient};
pub use types::{ClaimedJob, OpResult, QueueJob};
