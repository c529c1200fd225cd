/// The scheduler: submit / lease-request / heartbeat / complete / cancel
/// plus the expiry sweep driven by the reaper.
///
/// All state lives behind one mutex and every operation is a short,
/// I/O-free critical section. Durable writes happen in the server's
/// history writer, fed through an unbounded channel so a send never
/// blocks while the lock is held.
///
/// Admission is gated by the busy rating published by the health sampler.
/// A rating that was never published or has gone stale counts as 10
/// (zero usable capacity): the scheduler fails closed when it cannot see
/// the host.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::capacity;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::SchedError;
use crate::events::{AuditEvent, HistoryEvent};
use crate::ids;
use crate::job::{
    Job, JobHistoryRow, JobSpec, JobState, Lease, Priority, MAX_REQUESTED_UNITS,
    MIN_REQUESTED_UNITS,
};
use crate::store::JobStore;

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub job_id: String,
    pub state: JobState,
    /// True when an existing job with the same idempotency key was returned.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

impl CompletionStatus {
    fn job_state(self) -> JobState {
        match self {
            CompletionStatus::Completed => JobState::Completed,
            CompletionStatus::Failed => JobState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::Failed => "failed",
        }
    }
}

/// Result of a lease request. Denial is an expected outcome carrying a
/// retry hint, not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum LeaseOutcome {
    Granted {
        lease: Lease,
        job: Job,
    },
    Denied {
        reason: String,
        detail: String,
        retry_after_ms: u64,
        busy_rating: f64,
        usable_units: u32,
        leased_units: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatAck {
    pub expires_at: u64,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub busy_rating: f64,
    pub total_capacity_units: u32,
    pub usable_capacity_units: u32,
    pub leased_capacity_units: u32,
    pub available_capacity_units: i64,
    pub queue_depths: BTreeMap<String, usize>,
    pub queued_jobs: usize,
    pub tracked_jobs: usize,
    pub active_leases: Vec<Lease>,
}

struct Inner {
    store: JobStore,
    busy: f64,
    /// Unix ms of the last busy update; 0 means never sampled.
    busy_at_ms: u64,
}

pub struct Scheduler {
    cfg: SchedulerConfig,
    clock: Arc<dyn Clock>,
    events_tx: UnboundedSender<HistoryEvent>,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        clock: Arc<dyn Clock>,
        events_tx: UnboundedSender<HistoryEvent>,
    ) -> Self {
        Self {
            cfg,
            clock,
            events_tx,
            inner: Mutex::new(Inner {
                store: JobStore::new(),
                busy: 10.0,
                busy_at_ms: 0,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Poisoning means a panic inside the critical section; the state
        // machine can no longer be trusted.
        self.inner.lock().expect("scheduler state poisoned")
    }

    fn emit(&self, event: HistoryEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Publish the latest busy rating (called by the health sampler).
    pub fn set_busy(&self, rating: f64) {
        let mut inner = self.lock();
        inner.busy = rating.clamp(0.0, 10.0);
        inner.busy_at_ms = self.clock.now_ms();
    }

    /// The rating admission actually uses: never-sampled or stale reads
    /// count as 10.
    fn effective_busy(&self, inner: &Inner, now_ms: u64) -> f64 {
        if inner.busy_at_ms == 0 {
            return 10.0;
        }
        if now_ms.saturating_sub(inner.busy_at_ms) > self.cfg.busy_stale_after_s * 1000 {
            return 10.0;
        }
        inner.busy
    }

    // ── Submit ──

    pub fn submit(&self, spec: JobSpec) -> Result<SubmitOutcome, SchedError> {
        if spec.addon_id.trim().is_empty() {
            return Err(SchedError::InvalidArguments("addon_id must not be empty".into()));
        }
        if spec.job_type.trim().is_empty() {
            return Err(SchedError::InvalidArguments("job_type must not be empty".into()));
        }
        if !(MIN_REQUESTED_UNITS..=MAX_REQUESTED_UNITS).contains(&spec.requested_units) {
            return Err(SchedError::InvalidArguments(format!(
                "requested_units must be in [{MIN_REQUESTED_UNITS}, {MAX_REQUESTED_UNITS}], got {}",
                spec.requested_units
            )));
        }
        if spec.requested_units > self.cfg.total_capacity_units {
            return Err(SchedError::InvalidArguments(format!(
                "requested_units ({}) exceeds total capacity ({})",
                spec.requested_units, self.cfg.total_capacity_units
            )));
        }

        let now = self.clock.now_ms();
        let mut inner = self.lock();

        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = inner.store.job_by_idempotency(key) {
                if existing.addon_id != spec.addon_id
                    || existing.job_type != spec.job_type
                    || existing.priority != spec.priority
                    || existing.requested_units != spec.requested_units
                {
                    return Err(SchedError::IdempotencyConflict(format!(
                        "key '{key}' already identifies job {} with a different shape",
                        existing.job_id
                    )));
                }
                return Ok(SubmitOutcome {
                    job_id: existing.job_id.clone(),
                    state: existing.state,
                    deduplicated: true,
                });
            }
        }

        let job = Job::new(ids::job_id(), spec, now);
        let outcome = SubmitOutcome {
            job_id: job.job_id.clone(),
            state: job.state,
            deduplicated: false,
        };
        self.emit(HistoryEvent::Audit(AuditEvent::JobSubmitted {
            ts: now,
            job_id: job.job_id.clone(),
            addon_id: job.addon_id.clone(),
            job_type: job.job_type.clone(),
            priority: job.priority.as_str().to_string(),
            requested_units: job.requested_units,
        }));
        info!(job_id = %job.job_id, addon = %job.addon_id, priority = job.priority.as_str(), units = job.requested_units, "job submitted");
        inner.store.insert_queued(job);
        Ok(outcome)
    }

    // ── Lease request (the pull primitive) ──

    pub fn lease_request(
        &self,
        worker_id: &str,
        max_units: Option<u32>,
    ) -> Result<LeaseOutcome, SchedError> {
        if worker_id.trim().is_empty() {
            return Err(SchedError::InvalidArguments("worker_id must not be empty".into()));
        }

        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let busy = self.effective_busy(&inner, now);
        let usable = capacity::usable_units(
            busy,
            self.cfg.total_capacity_units,
            self.cfg.reserve_units,
        );
        let leased = inner.store.leased_units();
        let available = usable as i64 - leased as i64;

        if available <= 0 {
            let retry_after_ms = capacity::retry_after_ms(busy, self.cfg.retry_base_ms);
            debug!(worker = worker_id, busy, usable, leased, "lease denied: no capacity");
            return Ok(LeaseOutcome::Denied {
                reason: "no_capacity".into(),
                detail: format!("busy={busy:.1} usable={usable} used={leased}"),
                retry_after_ms,
                busy_rating: busy,
                usable_units: usable,
                leased_units: leased,
            });
        }

        let worker_cap = max_units.unwrap_or(u32::MAX);
        let cap = (available as u32).min(worker_cap);
        let mut capacity_blocked = false;

        for priority in Priority::ALL {
            // One candidate per class: the oldest queued job. A skipped
            // candidate keeps its place at the head of the class.
            let Some(head) = inner.store.queue_head(priority) else {
                continue;
            };
            let units = head.requested_units;
            if units > cap {
                // Distinguish "the budget is too tight right now" from
                // "the worker asked for less": only the former is a
                // capacity denial with busy-proportional backoff.
                if units <= worker_cap && units as i64 > available {
                    capacity_blocked = true;
                }
                continue;
            }
            if head.unique && inner.store.worker_holds_lease(worker_id) {
                continue;
            }

            let job_id = inner
                .store
                .dequeue_head(priority)
                .expect("queue head vanished during scan");
            let lease_id = ids::lease_id();

            let job = inner
                .store
                .job_mut(&job_id)
                .expect("queued job missing from table");
            job.state = JobState::Leased;
            job.lease_id = Some(lease_id.clone());
            job.leased_at = Some(now);
            job.updated_at = now;
            let job = job.clone();

            let lease = Lease {
                lease_id,
                job_id: job.job_id.clone(),
                worker_id: worker_id.to_string(),
                capacity_units: job.requested_units,
                issued_at: now,
                expires_at: now + self.cfg.lease_duration_ms(),
                last_heartbeat: now,
            };
            inner.store.insert_lease(lease.clone());

            self.emit(HistoryEvent::Audit(AuditEvent::LeaseGranted {
                ts: now,
                lease_id: lease.lease_id.clone(),
                job_id: job.job_id.clone(),
                worker_id: worker_id.to_string(),
                capacity_units: lease.capacity_units,
            }));
            self.emit(HistoryEvent::JobRow(JobHistoryRow::from_job(&job)));
            info!(
                lease_id = %lease.lease_id,
                job_id = %job.job_id,
                worker = worker_id,
                units = lease.capacity_units,
                "lease granted"
            );
            return Ok(LeaseOutcome::Granted { lease, job });
        }

        if capacity_blocked {
            let retry_after_ms = capacity::retry_after_ms(busy, self.cfg.retry_base_ms);
            debug!(worker = worker_id, busy, usable, leased, "lease denied: head does not fit");
            return Ok(LeaseOutcome::Denied {
                reason: "no_capacity".into(),
                detail: format!("busy={busy:.1} usable={usable} used={leased}"),
                retry_after_ms,
                busy_rating: busy,
                usable_units: usable,
                leased_units: leased,
            });
        }

        let queued = inner.store.queued_total();
        let retry_after_ms = capacity::retry_after_ms(0.0, self.cfg.retry_base_ms);
        debug!(worker = worker_id, queued, "lease denied: no eligible jobs");
        Ok(LeaseOutcome::Denied {
            reason: "no_eligible_jobs".into(),
            detail: format!("queued={queued} grantable=0"),
            retry_after_ms,
            busy_rating: busy,
            usable_units: usable,
            leased_units: leased,
        })
    }

    // ── Heartbeat ──

    pub fn heartbeat(&self, lease_id: &str, worker_id: &str) -> Result<HeartbeatAck, SchedError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let Some(lease) = inner.store.lease(lease_id) else {
            return Err(SchedError::LeaseNotFound);
        };
        if lease.worker_id != worker_id {
            return Err(SchedError::WorkerMismatch);
        }
        if lease.expires_at < now {
            // The reaper has not swept yet; finalize here so a stale worker
            // learns immediately that its lease is gone.
            self.expire_locked(&mut inner, lease_id, now);
            return Err(SchedError::LeaseInactive);
        }

        let expires_at = now + self.cfg.lease_duration_ms();
        let lease = inner
            .store
            .lease_mut(lease_id)
            .expect("lease vanished under lock");
        lease.last_heartbeat = now;
        lease.expires_at = expires_at;
        let job_id = lease.job_id.clone();

        let job = inner
            .store
            .job_mut(&job_id)
            .unwrap_or_else(|| panic!("lease {lease_id} references missing job {job_id}"));
        if job.state == JobState::Leased {
            // First heartbeat promotes the job to running, exactly once.
            job.state = JobState::Running;
            job.started_at = Some(now);
            job.updated_at = now;
            let row = JobHistoryRow::from_job(job);
            debug!(lease_id, job_id = %job_id, "first heartbeat, job running");
            self.emit(HistoryEvent::JobRow(row));
        }
        let state = job.state;

        Ok(HeartbeatAck { expires_at, state })
    }

    // ── Complete ──

    /// Finalize a job. Idempotent: completing an unknown lease is a late
    /// reconfirmation and returns `Ok(false)`.
    pub fn complete(
        &self,
        lease_id: &str,
        worker_id: &str,
        status: CompletionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool, SchedError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let Some(lease) = inner.store.lease(lease_id) else {
            return Ok(false);
        };
        if lease.worker_id != worker_id {
            return Err(SchedError::WorkerMismatch);
        }

        // Lease first, then job (ids only across the boundary).
        let lease = inner
            .store
            .remove_lease(lease_id)
            .expect("lease vanished under lock");
        let job = inner
            .store
            .job_mut(&lease.job_id)
            .unwrap_or_else(|| panic!("lease {lease_id} references missing job {}", lease.job_id));

        job.state = status.job_state();
        job.lease_id = None;
        job.result = result;
        job.error = error;
        job.finished_at = Some(now);
        job.updated_at = now;
        let row = JobHistoryRow::from_job(job);
        let job_id = job.job_id.clone();
        inner.store.push_terminal(&job_id);

        self.emit(HistoryEvent::Audit(AuditEvent::LeaseReleased {
            ts: now,
            lease_id: lease.lease_id.clone(),
            job_id: job_id.clone(),
            worker_id: worker_id.to_string(),
            status: status.as_str().to_string(),
        }));
        self.emit(HistoryEvent::JobRow(row));
        info!(lease_id, job_id = %job_id, status = status.as_str(), units = lease.capacity_units, "lease released");
        Ok(true)
    }

    // ── Cancel ──

    /// Remove a queued job. Jobs that already hold a lease cannot be
    /// cancelled; the scheduler has no mid-flight preemption.
    pub fn cancel(&self, job_id: &str) -> Result<(), SchedError> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let Some(job) = inner.store.job(job_id) else {
            return Err(SchedError::JobNotFound(job_id.to_string()));
        };
        if job.state != JobState::Queued {
            return Err(SchedError::InvalidArguments(format!(
                "job is {}, only queued jobs can be cancelled",
                job.state.as_str()
            )));
        }

        inner.store.remove_job(job_id);
        self.emit(HistoryEvent::Audit(AuditEvent::JobCancelled {
            ts: now,
            job_id: job_id.to_string(),
        }));
        info!(job_id, "job cancelled");
        Ok(())
    }

    // ── Expiry sweep (reaper body) ──

    /// Expire leases past their deadline or whose job exceeded its
    /// max_runtime, then evict old terminal jobs. Returns the number of
    /// leases expired.
    pub fn expire_sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        let expired: Vec<String> = inner
            .store
            .leases()
            .filter(|lease| {
                if lease.expires_at < now {
                    return true;
                }
                inner
                    .store
                    .job(&lease.job_id)
                    .and_then(|job| job.max_runtime_s)
                    .is_some_and(|max_s| now >= lease.issued_at + max_s * 1000)
            })
            .map(|lease| lease.lease_id.clone())
            .collect();

        for lease_id in &expired {
            self.expire_locked(&mut inner, lease_id, now);
        }

        inner.store.evict_terminal(
            now,
            self.cfg.job_retention_s * 1000,
            self.cfg.job_retention_cap,
        );

        expired.len()
    }

    fn expire_locked(&self, inner: &mut Inner, lease_id: &str, now: u64) {
        let Some(lease) = inner.store.remove_lease(lease_id) else {
            return;
        };
        let job = inner
            .store
            .job_mut(&lease.job_id)
            .unwrap_or_else(|| panic!("lease {lease_id} references missing job {}", lease.job_id));

        job.state = JobState::Expired;
        job.lease_id = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        let row = JobHistoryRow::from_job(job);
        let job_id = job.job_id.clone();
        inner.store.push_terminal(&job_id);

        self.emit(HistoryEvent::Audit(AuditEvent::LeaseExpired {
            ts: now,
            lease_id: lease.lease_id.clone(),
            job_id: job_id.clone(),
            worker_id: lease.worker_id.clone(),
        }));
        self.emit(HistoryEvent::JobRow(row));
        info!(lease_id, job_id = %job_id, worker = %lease.worker_id, "lease expired");
    }

    // ── Introspection ──

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.lock().store.job(job_id).cloned()
    }

    pub fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Vec<Job> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .store
            .jobs()
            .filter(|job| state.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs.truncate(limit);
        jobs
    }

    pub fn status(&self) -> StatusSnapshot {
        let now = self.clock.now_ms();
        let inner = self.lock();

        let busy = self.effective_busy(&inner, now);
        let usable = capacity::usable_units(
            busy,
            self.cfg.total_capacity_units,
            self.cfg.reserve_units,
        );
        let leased = inner.store.leased_units();

        let mut queue_depths = BTreeMap::new();
        for priority in Priority::ALL {
            queue_depths.insert(
                priority.as_str().to_string(),
                inner.store.queue_depth(priority),
            );
        }

        let mut active_leases: Vec<Lease> = inner.store.leases().cloned().collect();
        active_leases.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));

        StatusSnapshot {
            busy_rating: busy,
            total_capacity_units: self.cfg.total_capacity_units,
            usable_capacity_units: usable,
            leased_capacity_units: leased,
            available_capacity_units: usable as i64 - leased as i64,
            queue_depths,
            queued_jobs: inner.store.queued_total(),
            tracked_jobs: inner.store.job_count(),
            active_leases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::BTreeSet;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const START_MS: u64 = 1_700_000_000_000;

    fn setup() -> (Scheduler, Arc<ManualClock>, UnboundedReceiver<HistoryEvent>) {
        setup_with(SchedulerConfig::default())
    }

    fn setup_with(
        cfg: SchedulerConfig,
    ) -> (Scheduler, Arc<ManualClock>, UnboundedReceiver<HistoryEvent>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let (tx, rx) = mpsc::unbounded_channel();
        let sched = Scheduler::new(cfg, clock.clone(), tx);
        (sched, clock, rx)
    }

    fn spec(priority: Priority, units: u32) -> JobSpec {
        JobSpec {
            addon_id: "addon.media".into(),
            job_type: "transcode".into(),
            priority,
            requested_units: units,
            unique: false,
            idempotency_key: None,
            payload: serde_json::json!({"src": "a.mkv"}),
            tags: BTreeSet::new(),
            max_runtime_s: None,
        }
    }

    fn grant(sched: &Scheduler, worker: &str) -> (Lease, Job) {
        match sched.lease_request(worker, None).unwrap() {
            LeaseOutcome::Granted { lease, job } => (lease, job),
            LeaseOutcome::Denied { reason, detail, .. } => {
                panic!("expected grant, denied: {reason} ({detail})")
            }
        }
    }

    fn deny(sched: &Scheduler, worker: &str) -> (String, String, u64) {
        match sched.lease_request(worker, None).unwrap() {
            LeaseOutcome::Denied {
                reason,
                detail,
                retry_after_ms,
                ..
            } => (reason, detail, retry_after_ms),
            LeaseOutcome::Granted { job, .. } => panic!("expected denial, granted {}", job.job_id),
        }
    }

    #[test]
    fn submit_validates_units() {
        let (sched, _, _rx) = setup();
        assert!(matches!(
            sched.submit(spec(Priority::Normal, 0)),
            Err(SchedError::InvalidArguments(_))
        ));
        assert!(matches!(
            sched.submit(spec(Priority::Normal, 101)),
            Err(SchedError::InvalidArguments(_))
        ));
        assert!(sched.submit(spec(Priority::Normal, 100)).is_ok());
    }

    #[test]
    fn submit_rejects_units_above_total_capacity() {
        let mut cfg = SchedulerConfig::default();
        cfg.total_capacity_units = 40;
        let (sched, _, _rx) = setup_with(cfg);
        assert!(matches!(
            sched.submit(spec(Priority::Normal, 50)),
            Err(SchedError::InvalidArguments(_))
        ));
    }

    #[test]
    fn capacity_deny_at_busy_five() {
        // total=100, reserve=0, busy=5 → usable=50. Two 20-unit grants fit
        // (used=40); the third would push used to 60 > 50 and is denied.
        let (sched, _, _rx) = setup();
        sched.set_busy(5.0);
        for _ in 0..3 {
            sched.submit(spec(Priority::Normal, 20)).unwrap();
        }

        let (_, job_a) = grant(&sched, "w1");
        let (_, job_b) = grant(&sched, "w1");
        assert_ne!(job_a.job_id, job_b.job_id);

        let (reason, detail, retry) = deny(&sched, "w1");
        assert_eq!(reason, "no_capacity");
        assert!(detail.contains("usable=50"), "detail: {detail}");
        assert!(detail.contains("used=40"), "detail: {detail}");
        // base 375ms doubles twice above busy 3 → ~1500ms ± jitter.
        assert!((1_275..=1_725).contains(&retry), "retry: {retry}");

        let status = sched.status();
        assert_eq!(status.leased_capacity_units, 40);
        assert!(status.leased_capacity_units <= status.total_capacity_units);
    }

    #[test]
    fn priority_classes_scan_in_order() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Low, 10)).unwrap();
        sched.submit(spec(Priority::Background, 10)).unwrap();
        let high = sched.submit(spec(Priority::High, 10)).unwrap();

        let (_, job) = grant(&sched, "w1");
        assert_eq!(job.job_id, high.job_id);
        assert_eq!(job.priority, Priority::High);
    }

    #[test]
    fn fifo_within_class() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        let first = sched.submit(spec(Priority::Normal, 10)).unwrap();
        clock.advance_ms(10);
        let second = sched.submit(spec(Priority::Normal, 10)).unwrap();

        let (_, a) = grant(&sched, "w1");
        let (_, b) = grant(&sched, "w2");
        assert_eq!(a.job_id, first.job_id);
        assert_eq!(b.job_id, second.job_id);
    }

    #[test]
    fn oversized_head_blocks_its_class_but_not_others() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(5.0); // usable = 50
        sched.submit(spec(Priority::Normal, 80)).unwrap();
        clock.advance_ms(5);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        clock.advance_ms(5);
        let low = sched.submit(spec(Priority::Low, 10)).unwrap();

        // The 80-unit head is skipped and stays at the head of normal; the
        // 10-unit job behind it is not considered. The low class grants.
        let (_, job) = grant(&sched, "w1");
        assert_eq!(job.job_id, low.job_id);

        let status = sched.status();
        assert_eq!(status.queue_depths["normal"], 2);
    }

    #[test]
    fn no_eligible_jobs_when_queues_empty() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        let (reason, _, retry) = deny(&sched, "w1");
        assert_eq!(reason, "no_eligible_jobs");
        assert!(retry <= 1_000, "small retry expected, got {retry}");
    }

    #[test]
    fn max_units_filters_candidates() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 40)).unwrap();

        match sched.lease_request("w1", Some(20)).unwrap() {
            LeaseOutcome::Denied { reason, .. } => assert_eq!(reason, "no_eligible_jobs"),
            LeaseOutcome::Granted { .. } => panic!("40-unit job granted past max_units=20"),
        }
        let (_, job) = grant(&sched, "w1");
        assert_eq!(job.requested_units, 40);
    }

    #[test]
    fn idempotency_returns_same_job() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        let mut s = spec(Priority::Normal, 10);
        s.idempotency_key = Some("k1".into());
        let first = sched.submit(s.clone()).unwrap();
        assert!(!first.deduplicated);

        let second = sched.submit(s).unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(sched.status().queued_jobs, 1);
    }

    #[test]
    fn idempotency_conflict_on_different_shape() {
        let (sched, _, _rx) = setup();
        let mut s = spec(Priority::Normal, 10);
        s.idempotency_key = Some("k1".into());
        sched.submit(s).unwrap();

        let mut other = spec(Priority::High, 20);
        other.idempotency_key = Some("k1".into());
        assert!(matches!(
            sched.submit(other),
            Err(SchedError::IdempotencyConflict(_))
        ));
    }

    #[test]
    fn idempotency_key_outlives_completion_until_eviction() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        let mut s = spec(Priority::Normal, 10);
        s.idempotency_key = Some("k1".into());
        let first = sched.submit(s.clone()).unwrap();

        let (lease, _) = grant(&sched, "w1");
        sched
            .complete(&lease.lease_id, "w1", CompletionStatus::Completed, None, None)
            .unwrap();

        // Terminal but still in the live set: the key still deduplicates.
        let dup = sched.submit(s.clone()).unwrap();
        assert!(dup.deduplicated);
        assert_eq!(dup.job_id, first.job_id);
        assert_eq!(dup.state, JobState::Completed);

        // After eviction the key is free again.
        clock.advance_secs(2 * 3600);
        sched.expire_sweep();
        let fresh = sched.submit(s).unwrap();
        assert!(!fresh.deduplicated);
        assert_ne!(fresh.job_id, first.job_id);
    }

    #[test]
    fn unique_job_excluded_from_busy_worker() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let mut u = spec(Priority::Normal, 10);
        u.unique = true;
        let unique_job = sched.submit(u).unwrap();

        let (_, _first) = grant(&sched, "w1");
        // w1 already holds a lease; the unique job is skipped for it.
        let (reason, _, _) = deny(&sched, "w1");
        assert_eq!(reason, "no_eligible_jobs");

        // Another worker can take it.
        let (_, job) = grant(&sched, "w2");
        assert_eq!(job.job_id, unique_job.job_id);
    }

    #[test]
    fn first_heartbeat_promotes_to_running_once() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, job) = grant(&sched, "w1");
        assert_eq!(job.state, JobState::Leased);

        clock.advance_secs(1);
        let ack = sched.heartbeat(&lease.lease_id, "w1").unwrap();
        assert_eq!(ack.state, JobState::Running);
        let started = sched.get_job(&job.job_id).unwrap().started_at.unwrap();

        clock.advance_secs(1);
        let ack = sched.heartbeat(&lease.lease_id, "w1").unwrap();
        assert_eq!(ack.state, JobState::Running);
        assert_eq!(sched.get_job(&job.job_id).unwrap().started_at, Some(started));
        assert!(ack.expires_at > lease.expires_at);
    }

    #[test]
    fn heartbeat_errors() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, _) = grant(&sched, "w1");

        assert!(matches!(
            sched.heartbeat("lease-unknown", "w1"),
            Err(SchedError::LeaseNotFound)
        ));
        assert!(matches!(
            sched.heartbeat(&lease.lease_id, "w2"),
            Err(SchedError::WorkerMismatch)
        ));
    }

    #[test]
    fn stale_heartbeat_finds_lease_inactive_then_gone() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, job) = grant(&sched, "w1");

        // ttl 30 + grace 5: at +36s the lease is past its deadline. The
        // first stale heartbeat finalizes it, later ones see it gone.
        clock.advance_secs(36);
        assert!(matches!(
            sched.heartbeat(&lease.lease_id, "w1"),
            Err(SchedError::LeaseInactive)
        ));
        assert!(matches!(
            sched.heartbeat(&lease.lease_id, "w1"),
            Err(SchedError::LeaseNotFound)
        ));
        assert_eq!(sched.get_job(&job.job_id).unwrap().state, JobState::Expired);
    }

    #[test]
    fn reaper_expires_silent_lease_and_releases_capacity() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 40)).unwrap();
        let (lease, job) = grant(&sched, "w1");
        assert_eq!(sched.status().leased_capacity_units, 40);

        clock.advance_secs(36);
        sched.set_busy(0.0); // keep the rating fresh across the jump
        assert_eq!(sched.expire_sweep(), 1);

        assert_eq!(sched.get_job(&job.job_id).unwrap().state, JobState::Expired);
        assert_eq!(sched.status().leased_capacity_units, 0);
        assert!(matches!(
            sched.heartbeat(&lease.lease_id, "w1"),
            Err(SchedError::LeaseNotFound)
        ));
    }

    #[test]
    fn heartbeats_keep_lease_alive() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, _) = grant(&sched, "w1");

        for _ in 0..10 {
            clock.advance_secs(10);
            sched.set_busy(0.0);
            sched.heartbeat(&lease.lease_id, "w1").unwrap();
            assert_eq!(sched.expire_sweep(), 0);
        }
    }

    #[test]
    fn max_runtime_expires_despite_heartbeats() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        let mut s = spec(Priority::Normal, 10);
        s.max_runtime_s = Some(20);
        sched.submit(s).unwrap();
        let (lease, job) = grant(&sched, "w1");

        clock.advance_secs(10);
        sched.set_busy(0.0);
        sched.heartbeat(&lease.lease_id, "w1").unwrap();
        assert_eq!(sched.expire_sweep(), 0);

        clock.advance_secs(11);
        sched.set_busy(0.0);
        sched.heartbeat(&lease.lease_id, "w1").unwrap();
        assert_eq!(sched.expire_sweep(), 1);
        assert_eq!(sched.get_job(&job.job_id).unwrap().state, JobState::Expired);
    }

    #[test]
    fn complete_finalizes_and_restores_capacity() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 30)).unwrap();
        let (lease, job) = grant(&sched, "w1");
        sched.heartbeat(&lease.lease_id, "w1").unwrap();

        let known = sched
            .complete(
                &lease.lease_id,
                "w1",
                CompletionStatus::Completed,
                Some(serde_json::json!({"frames": 1200})),
                None,
            )
            .unwrap();
        assert!(known);

        let done = sched.get_job(&job.job_id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert!(done.result.is_some());
        assert!(done.lease_id.is_none());

        let status = sched.status();
        assert_eq!(status.leased_capacity_units, 0);
        assert_eq!(status.available_capacity_units, 100);
    }

    #[test]
    fn complete_failed_records_error() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, job) = grant(&sched, "w1");

        sched
            .complete(
                &lease.lease_id,
                "w1",
                CompletionStatus::Failed,
                None,
                Some("decoder crashed".into()),
            )
            .unwrap();
        let done = sched.get_job(&job.job_id).unwrap();
        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.error.as_deref(), Some("decoder crashed"));
    }

    #[test]
    fn complete_is_idempotent() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, job) = grant(&sched, "w1");

        assert!(sched
            .complete(&lease.lease_id, "w1", CompletionStatus::Completed, None, None)
            .unwrap());
        let finished_at = sched.get_job(&job.job_id).unwrap().finished_at;

        // Late reconfirmation: unknown lease, ok, no state change.
        assert!(!sched
            .complete(&lease.lease_id, "w1", CompletionStatus::Failed, None, None)
            .unwrap());
        let done = sched.get_job(&job.job_id).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.finished_at, finished_at);
    }

    #[test]
    fn complete_rejects_wrong_worker() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, _) = grant(&sched, "w1");

        assert!(matches!(
            sched.complete(&lease.lease_id, "w2", CompletionStatus::Completed, None, None),
            Err(SchedError::WorkerMismatch)
        ));
        // The real worker still owns it.
        assert!(sched
            .complete(&lease.lease_id, "w1", CompletionStatus::Completed, None, None)
            .unwrap());
    }

    #[test]
    fn cancel_removes_queued_job_only() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        let mut s = spec(Priority::Normal, 10);
        s.idempotency_key = Some("k1".into());
        let queued = sched.submit(s.clone()).unwrap();

        sched.cancel(&queued.job_id).unwrap();
        assert!(sched.get_job(&queued.job_id).is_none());
        assert_eq!(sched.status().queued_jobs, 0);
        // The key is free after cancel.
        assert!(!sched.submit(s).unwrap().deduplicated);

        assert!(matches!(
            sched.cancel("job-unknown"),
            Err(SchedError::JobNotFound(_))
        ));

        let (_, job) = grant(&sched, "w1");
        assert!(matches!(
            sched.cancel(&job.job_id),
            Err(SchedError::InvalidArguments(_))
        ));
    }

    #[test]
    fn never_sampled_rating_fails_closed() {
        let (sched, _, _rx) = setup();
        sched.submit(spec(Priority::Normal, 10)).unwrap();

        let (reason, detail, _) = deny(&sched, "w1");
        assert_eq!(reason, "no_capacity");
        assert!(detail.contains("busy=10.0"), "detail: {detail}");
        assert_eq!(sched.status().usable_capacity_units, 0);
    }

    #[test]
    fn stale_rating_fails_closed() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();

        // Default staleness window is 15s; a 60s-old rating is ignored.
        clock.advance_secs(60);
        let (reason, _, _) = deny(&sched, "w1");
        assert_eq!(reason, "no_capacity");
    }

    #[test]
    fn leases_granted_before_spike_may_exceed_usable() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 60)).unwrap();
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (_, _) = grant(&sched, "w1");

        // Spike: usable drops to 50 while 60 units are already leased.
        // Existing leases stand; new grants are denied.
        sched.set_busy(5.0);
        let status = sched.status();
        assert_eq!(status.leased_capacity_units, 60);
        assert_eq!(status.usable_capacity_units, 50);
        assert!(status.available_capacity_units < 0);

        let (reason, _, _) = deny(&sched, "w2");
        assert_eq!(reason, "no_capacity");
    }

    #[test]
    fn list_jobs_orders_by_creation_desc() {
        let (sched, clock, _rx) = setup();
        sched.set_busy(0.0);
        let a = sched.submit(spec(Priority::Normal, 10)).unwrap();
        clock.advance_ms(5);
        let b = sched.submit(spec(Priority::Normal, 10)).unwrap();
        clock.advance_ms(5);
        let c = sched.submit(spec(Priority::High, 10)).unwrap();

        let all = sched.list_jobs(None, 10);
        let ids: Vec<&str> = all.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec![&c.job_id, &b.job_id, &a.job_id]);

        let queued = sched.list_jobs(Some(JobState::Queued), 2);
        assert_eq!(queued.len(), 2);
        assert!(sched.list_jobs(Some(JobState::Completed), 10).is_empty());
    }

    #[test]
    fn lifecycle_emits_audit_trail() {
        let (sched, _, mut rx) = setup();
        sched.set_busy(0.0);
        sched.submit(spec(Priority::Normal, 10)).unwrap();
        let (lease, _) = grant(&sched, "w1");
        sched.heartbeat(&lease.lease_id, "w1").unwrap();
        sched
            .complete(&lease.lease_id, "w1", CompletionStatus::Completed, None, None)
            .unwrap();

        let mut audits = Vec::new();
        let mut rows = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                HistoryEvent::Audit(a) => audits.push(a.kind()),
                HistoryEvent::JobRow(_) => rows += 1,
                HistoryEvent::MinuteSample { .. } => {}
            }
        }
        assert_eq!(audits, vec!["JOB_SUBMITTED", "LEASE_GRANTED", "LEASE_RELEASED"]);
        // Rows at lease, first heartbeat, and completion.
        assert_eq!(rows, 3);
    }

    #[test]
    fn worker_sees_own_complete_before_next_grant() {
        let (sched, _, _rx) = setup();
        sched.set_busy(0.0);
        let mut u = spec(Priority::Normal, 10);
        u.unique = true;
        sched.submit(u.clone()).unwrap();
        sched.submit(u).unwrap();

        let (lease, _) = grant(&sched, "w1");
        sched
            .complete(&lease.lease_id, "w1", CompletionStatus::Completed, None, None)
            .unwrap();
        // The release is visible: w1 no longer holds a lease, so the second
        // unique job is grantable to it.
        let (_, job) = grant(&sched, "w1");
        assert_eq!(job.state, JobState::Leased);
    }
}
