//! Worker Pool: consumes leased WorkItems and runs their pipelines
//! (SPEC_FULL.md §4.4, §5).

pub mod backpressure;
pub mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
