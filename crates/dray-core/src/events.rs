/// Audit events and the history channel payload.
///
/// The scheduler pushes events onto an unbounded channel while holding its
/// lock; the server's history writer drains the channel and performs all
/// durable I/O outside the critical section.

use serde::{Deserialize, Serialize};

use crate::job::JobHistoryRow;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    JobSubmitted {
        ts: u64,
        job_id: String,
        addon_id: String,
        job_type: String,
        priority: String,
        requested_units: u32,
    },
    JobCancelled {
        ts: u64,
        job_id: String,
    },
    LeaseGranted {
        ts: u64,
        lease_id: String,
        job_id: String,
        worker_id: String,
        capacity_units: u32,
    },
    LeaseReleased {
        ts: u64,
        lease_id: String,
        job_id: String,
        worker_id: String,
        status: String,
    },
    LeaseExpired {
        ts: u64,
        lease_id: String,
        job_id: String,
        worker_id: String,
    },
}

impl AuditEvent {
    pub fn ts(&self) -> u64 {
        match self {
            AuditEvent::JobSubmitted { ts, .. }
            | AuditEvent::JobCancelled { ts, .. }
            | AuditEvent::LeaseGranted { ts, .. }
            | AuditEvent::LeaseReleased { ts, .. }
            | AuditEvent::LeaseExpired { ts, .. } => *ts,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::JobSubmitted { .. } => "JOB_SUBMITTED",
            AuditEvent::JobCancelled { .. } => "JOB_CANCELLED",
            AuditEvent::LeaseGranted { .. } => "LEASE_GRANTED",
            AuditEvent::LeaseReleased { .. } => "LEASE_RELEASED",
            AuditEvent::LeaseExpired { .. } => "LEASE_EXPIRED",
        }
    }

    /// `(entity_kind, entity_id)` for the append-only event table.
    pub fn entity(&self) -> (&'static str, &str) {
        match self {
            AuditEvent::JobSubmitted { job_id, .. } | AuditEvent::JobCancelled { job_id, .. } => {
                ("job", job_id)
            }
            AuditEvent::LeaseGranted { lease_id, .. }
            | AuditEvent::LeaseReleased { lease_id, .. }
            | AuditEvent::LeaseExpired { lease_id, .. } => ("lease", lease_id),
        }
    }
}

/// Everything the history writer persists.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Audit(AuditEvent),
    /// Upsert of a job's denormalized history row (on lease and on finalize).
    JobRow(JobHistoryRow),
    /// Minute-aligned health sample.
    MinuteSample {
        ts_s: u64,
        busy: f64,
        snapshot: serde_json::Value,
    },
}
