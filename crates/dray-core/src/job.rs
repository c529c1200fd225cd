/// Job and lease model.
///
/// Jobs and leases are owned by the scheduler's in-memory store; everything
/// outside holds opaque ids. A `Job` references its lease by id and a
/// `Lease` references its job by id — neither owns the other, so removal
/// order is always: drop the lease first, then mutate the job.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub const MIN_REQUESTED_UNITS: u32 = 1;
pub const MAX_REQUESTED_UNITS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    /// Dispatch order: a lease request scans classes in this order.
    pub const ALL: [Priority; 4] = [
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
            Priority::Background => 3,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Leased,
    Running,
    Completed,
    Failed,
    Expired,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Leased => "leased",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Expired => "expired",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "leased" => Ok(JobState::Leased),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "expired" => Ok(JobState::Expired),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// Submission parameters, as received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub addon_id: String,
    pub job_type: String,
    pub priority: Priority,
    pub requested_units: u32,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub max_runtime_s: Option<u64>,
}

/// A unit of intended work. All timestamps are unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub addon_id: String,
    pub job_type: String,
    pub priority: Priority,
    pub requested_units: u32,
    pub unique: bool,
    pub idempotency_key: Option<String>,
    pub state: JobState,
    pub payload: serde_json::Value,
    pub tags: BTreeSet<String>,
    pub max_runtime_s: Option<u64>,
    pub lease_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub leased_at: Option<u64>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(job_id: String, spec: JobSpec, now_ms: u64) -> Self {
        Self {
            job_id,
            addon_id: spec.addon_id,
            job_type: spec.job_type,
            priority: spec.priority,
            requested_units: spec.requested_units,
            unique: spec.unique,
            idempotency_key: spec.idempotency_key,
            state: JobState::Queued,
            payload: spec.payload,
            tags: spec.tags,
            max_runtime_s: spec.max_runtime_s,
            lease_id: None,
            created_at: now_ms,
            updated_at: now_ms,
            leased_at: None,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }
}

/// Time-bounded permission to execute exactly one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub job_id: String,
    pub worker_id: String,
    pub capacity_units: u32,
    pub issued_at: u64,
    pub expires_at: u64,
    pub last_heartbeat: u64,
}

/// Denormalized projection of a job, written to the durable history when
/// the job leaves `queued` and again at each later transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryRow {
    pub job_id: String,
    pub addon_id: String,
    pub job_type: String,
    pub priority: Priority,
    pub requested_units: u32,
    pub state: JobState,
    pub created_at: u64,
    pub leased_at: Option<u64>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub queue_wait_s: Option<f64>,
    pub runtime_s: Option<f64>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobHistoryRow {
    pub fn from_job(job: &Job) -> Self {
        let queue_wait_s = job
            .leased_at
            .map(|leased| (leased.saturating_sub(job.created_at)) as f64 / 1000.0);
        let run_anchor = job.started_at.or(job.leased_at);
        let runtime_s = match (run_anchor, job.finished_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start) as f64 / 1000.0),
            _ => None,
        };
        Self {
            job_id: job.job_id.clone(),
            addon_id: job.addon_id.clone(),
            job_type: job.job_type.clone(),
            priority: job.priority,
            requested_units: job.requested_units,
            state: job.state,
            created_at: job.created_at,
            leased_at: job.leased_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            queue_wait_s,
            runtime_s,
            error: job.error.clone(),
            result: job.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_serde_uses_lowercase() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
        let p: Priority = serde_json::from_str("\"background\"").unwrap();
        assert_eq!(p, Priority::Background);
        assert!(serde_json::from_str::<Priority>("\"urgent\"").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Leased.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Expired.is_terminal());
    }

    #[test]
    fn history_row_derives_durations() {
        let spec = JobSpec {
            addon_id: "addon".into(),
            job_type: "scan".into(),
            priority: Priority::Normal,
            requested_units: 10,
            unique: false,
            idempotency_key: None,
            payload: serde_json::Value::Null,
            tags: BTreeSet::new(),
            max_runtime_s: None,
        };
        let mut job = Job::new("job-1".into(), spec, 10_000);
        job.leased_at = Some(12_500);
        job.started_at = Some(13_000);
        job.finished_at = Some(18_000);
        job.state = JobState::Completed;

        let row = JobHistoryRow::from_job(&job);
        assert_eq!(row.queue_wait_s, Some(2.5));
        assert_eq!(row.runtime_s, Some(5.0));
    }

    #[test]
    fn history_row_without_start_uses_lease_time() {
        let spec = JobSpec {
            addon_id: "addon".into(),
            job_type: "scan".into(),
            priority: Priority::Normal,
            requested_units: 10,
            unique: false,
            idempotency_key: None,
            payload: serde_json::Value::Null,
            tags: BTreeSet::new(),
            max_runtime_s: None,
        };
        let mut job = Job::new("job-2".into(), spec, 10_000);
        job.leased_at = Some(11_000);
        job.finished_at = Some(14_000);
        job.state = JobState::Expired;

        let row = JobHistoryRow::from_job(&job);
        assert_eq!(row.runtime_s, Some(3.0));
    }
}
