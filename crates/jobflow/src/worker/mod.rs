//! Bounded worker pool that runs queued pipeline jobs.

mod pool;

pub use crate::config::BackpressurePolicy;
pub use pool::{CancelOutcome, Reservation, WorkerPool};
