/// Enumerated error kinds the scheduler recognizes. Admission denials
/// (`no_capacity`, `no_eligible_jobs`) are expected outcomes, not errors;
/// they live in `scheduler::LeaseOutcome`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("idempotency key conflict: {0}")]
    IdempotencyConflict(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("lease not found")]
    LeaseNotFound,

    #[error("lease is held by a different worker")]
    WorkerMismatch,

    #[error("lease expired or already released")]
    LeaseInactive,

    #[error("storage error: {0}")]
    Storage(String),
}

impl SchedError {
    /// Stable machine-readable code for the API error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SchedError::InvalidArguments(_) => "invalid_arguments",
            SchedError::IdempotencyConflict(_) => "idempotency_conflict",
            SchedError::JobNotFound(_) => "job_not_found",
            SchedError::LeaseNotFound => "lease_not_found",
            SchedError::WorkerMismatch => "worker_mismatch",
            SchedError::LeaseInactive => "lease_inactive",
            SchedError::Storage(_) => "storage_error",
        }
    }
}
