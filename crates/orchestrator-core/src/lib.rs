//! Scheduling + work-leasing + pipeline-execution core shared by the
//! scheduler and worker daemons (SPEC_FULL.md §2).
//!
//! This crate has no HTTP surface of its own. The REST façade, auth,
//! event bus, and tool implementations are external collaborators
//! (SPEC_FULL.md §6); this crate defines the trait seams they plug
//! into (`TaskStore`, `ToolRegistry`) and the pure/async logic that
//! sits behind them.

pub mod cancellation;
pub mod clock;
pub mod config;
pub mod domain;
pub mod pipeline;
pub mod recurrence;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use cancellation::CancellationHandle;
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, CoreConfig, WorkerConfig};
pub use retry::RetryPolicy;
pub use scheduler::{ChangeMessage, EventMessage, Scheduler, SchedulerConfig, SchedulerError};
