//! Priority-ordered, per-tenant concurrency-governed job scheduling.
//!
//! `core` holds the synchronous state machine, `tenant` the per-team
//! records, and `driver` the async loop that wires them to the remote
//! queue service.

pub mod core;
pub mod driver;
pub mod tenant;

pub use self::core::SchedulerCore;
pub use self::driver::{Driver, DriverParams, DriverSummary};
pub use self::tenant::{ActiveJob, MainQueueJob, TenantState, Tier};
