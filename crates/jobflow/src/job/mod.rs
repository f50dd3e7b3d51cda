//! Job records and the job state machine.

mod record;
mod status;
mod transition;

pub use record::{ErrorDetail, FailureKind, Job, JobId, ResultRef, StageRecord};
pub use status::JobStatus;
pub use transition::Transition;
