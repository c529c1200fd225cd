/// In-memory job and lease tables.
///
/// Single-owner data structure: the scheduler wraps one `JobStore` in its
/// mutex and is the only mutator. Invariant maintained here: a job id is in
/// a priority queue if and only if the job's state is `queued`.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::job::{Job, JobState, Lease, Priority};

#[derive(Default)]
pub struct JobStore {
    jobs: HashMap<String, Job>,
    by_idempotency: HashMap<String, String>,
    queues: [VecDeque<String>; 4],
    leases: HashMap<String, Lease>,
    worker_leases: HashMap<String, HashSet<String>>,
    /// Terminal job ids in finish order, for age/cap eviction.
    terminal_order: VecDeque<String>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Jobs ──

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job_by_idempotency(&self, key: &str) -> Option<&Job> {
        self.by_idempotency.get(key).and_then(|id| self.jobs.get(id))
    }

    /// Insert a freshly submitted job and enqueue it in its priority class.
    /// Queue order is `(created_at, job_id)` ascending; since wall time is
    /// non-decreasing this is an append in all but same-millisecond ties.
    pub fn insert_queued(&mut self, job: Job) {
        debug_assert_eq!(job.state, JobState::Queued);
        let queue = &mut self.queues[job.priority.index()];
        let key = (job.created_at, job.job_id.clone());
        let mut at = queue.len();
        while at > 0 {
            let prev = &queue[at - 1];
            let prev_job = &self.jobs[prev];
            if (prev_job.created_at, prev_job.job_id.as_str()) <= (key.0, key.1.as_str()) {
                break;
            }
            at -= 1;
        }
        queue.insert(at, job.job_id.clone());

        if let Some(key) = &job.idempotency_key {
            self.by_idempotency.insert(key.clone(), job.job_id.clone());
        }
        self.jobs.insert(job.job_id.clone(), job);
    }

    /// Remove a job entirely (cancel path). Clears the queue entry and the
    /// idempotency index.
    pub fn remove_job(&mut self, job_id: &str) -> Option<Job> {
        let job = self.jobs.remove(job_id)?;
        if job.state == JobState::Queued {
            let queue = &mut self.queues[job.priority.index()];
            if let Some(at) = queue.iter().position(|id| id == job_id) {
                queue.remove(at);
            }
        }
        if let Some(key) = &job.idempotency_key {
            self.by_idempotency.remove(key);
        }
        Some(job)
    }

    // ── Queues ──

    pub fn queue_head(&self, priority: Priority) -> Option<&Job> {
        self.queues[priority.index()]
            .front()
            .and_then(|id| self.jobs.get(id))
    }

    /// Dequeue the head of a class. Caller transitions the job out of
    /// `queued` immediately after.
    pub fn dequeue_head(&mut self, priority: Priority) -> Option<String> {
        self.queues[priority.index()].pop_front()
    }

    pub fn queue_depth(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn queued_total(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    // ── Leases ──

    pub fn lease(&self, lease_id: &str) -> Option<&Lease> {
        self.leases.get(lease_id)
    }

    pub fn lease_mut(&mut self, lease_id: &str) -> Option<&mut Lease> {
        self.leases.get_mut(lease_id)
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    pub fn insert_lease(&mut self, lease: Lease) {
        self.worker_leases
            .entry(lease.worker_id.clone())
            .or_default()
            .insert(lease.lease_id.clone());
        self.leases.insert(lease.lease_id.clone(), lease);
    }

    pub fn remove_lease(&mut self, lease_id: &str) -> Option<Lease> {
        let lease = self.leases.remove(lease_id)?;
        if let Some(set) = self.worker_leases.get_mut(&lease.worker_id) {
            set.remove(lease_id);
            if set.is_empty() {
                self.worker_leases.remove(&lease.worker_id);
            }
        }
        Some(lease)
    }

    pub fn worker_holds_lease(&self, worker_id: &str) -> bool {
        self.worker_leases
            .get(worker_id)
            .is_some_and(|set| !set.is_empty())
    }

    pub fn leased_units(&self) -> u32 {
        self.leases.values().map(|l| l.capacity_units).sum()
    }

    // ── Terminal eviction ──

    pub fn push_terminal(&mut self, job_id: &str) {
        self.terminal_order.push_back(job_id.to_string());
    }

    /// Drop terminal jobs beyond the cap or older (by finish time) than the
    /// retention window. The durable history remains the source of truth.
    pub fn evict_terminal(&mut self, now_ms: u64, retention_ms: u64, cap: usize) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.terminal_order.front().cloned() {
            let over_cap = self.terminal_order.len() > cap;
            let too_old = match self.jobs.get(&front) {
                Some(job) => job
                    .finished_at
                    .is_some_and(|t| t.saturating_add(retention_ms) < now_ms),
                // Id already gone (cancelled or double-pushed); just drop it.
                None => true,
            };
            if !(over_cap || too_old) {
                break;
            }
            self.terminal_order.pop_front();
            if let Some(job) = self.jobs.remove(&front) {
                if let Some(key) = &job.idempotency_key {
                    self.by_idempotency.remove(key);
                }
                evicted += 1;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use std::collections::BTreeSet;

    fn spec(priority: Priority) -> JobSpec {
        JobSpec {
            addon_id: "addon.test".into(),
            job_type: "scan".into(),
            priority,
            requested_units: 10,
            unique: false,
            idempotency_key: None,
            payload: serde_json::Value::Null,
            tags: BTreeSet::new(),
            max_runtime_s: None,
        }
    }

    fn queued(store: &mut JobStore, id: &str, priority: Priority, created_at: u64) {
        let job = Job::new(id.to_string(), spec(priority), created_at);
        store.insert_queued(job);
    }

    fn lease(id: &str, job_id: &str, worker: &str, units: u32) -> Lease {
        Lease {
            lease_id: id.into(),
            job_id: job_id.into(),
            worker_id: worker.into(),
            capacity_units: units,
            issued_at: 0,
            expires_at: 35_000,
            last_heartbeat: 0,
        }
    }

    #[test]
    fn queue_is_fifo_by_created_at() {
        let mut store = JobStore::new();
        queued(&mut store, "job-a", Priority::Normal, 1000);
        queued(&mut store, "job-b", Priority::Normal, 2000);
        queued(&mut store, "job-c", Priority::Normal, 3000);

        assert_eq!(store.queue_head(Priority::Normal).unwrap().job_id, "job-a");
        assert_eq!(store.dequeue_head(Priority::Normal).unwrap(), "job-a");
        assert_eq!(store.dequeue_head(Priority::Normal).unwrap(), "job-b");
        assert_eq!(store.dequeue_head(Priority::Normal).unwrap(), "job-c");
        assert!(store.dequeue_head(Priority::Normal).is_none());
    }

    #[test]
    fn same_millisecond_ties_break_on_job_id() {
        let mut store = JobStore::new();
        queued(&mut store, "job-b", Priority::Normal, 1000);
        queued(&mut store, "job-a", Priority::Normal, 1000);
        queued(&mut store, "job-c", Priority::Normal, 1000);

        assert_eq!(store.dequeue_head(Priority::Normal).unwrap(), "job-a");
        assert_eq!(store.dequeue_head(Priority::Normal).unwrap(), "job-b");
        assert_eq!(store.dequeue_head(Priority::Normal).unwrap(), "job-c");
    }

    #[test]
    fn classes_are_independent() {
        let mut store = JobStore::new();
        queued(&mut store, "job-low", Priority::Low, 1000);
        queued(&mut store, "job-high", Priority::High, 2000);

        assert_eq!(store.queue_depth(Priority::High), 1);
        assert_eq!(store.queue_depth(Priority::Low), 1);
        assert_eq!(store.queue_depth(Priority::Normal), 0);
        assert_eq!(store.queued_total(), 2);
    }

    #[test]
    fn remove_job_clears_queue_and_index() {
        let mut store = JobStore::new();
        let mut s = spec(Priority::Normal);
        s.idempotency_key = Some("k1".into());
        store.insert_queued(Job::new("job-a".into(), s, 1000));

        assert!(store.job_by_idempotency("k1").is_some());
        assert!(store.remove_job("job-a").is_some());
        assert!(store.job_by_idempotency("k1").is_none());
        assert_eq!(store.queue_depth(Priority::Normal), 0);
        assert!(store.remove_job("job-a").is_none());
    }

    #[test]
    fn lease_indexes_track_workers_and_units() {
        let mut store = JobStore::new();
        store.insert_lease(lease("lease-1", "job-a", "w1", 20));
        store.insert_lease(lease("lease-2", "job-b", "w1", 15));
        store.insert_lease(lease("lease-3", "job-c", "w2", 5));

        assert_eq!(store.leased_units(), 40);
        assert!(store.worker_holds_lease("w1"));
        assert!(store.worker_holds_lease("w2"));
        assert!(!store.worker_holds_lease("w3"));

        store.remove_lease("lease-1");
        assert_eq!(store.leased_units(), 20);
        assert!(store.worker_holds_lease("w1"));
        store.remove_lease("lease-2");
        assert!(!store.worker_holds_lease("w1"));
    }

    #[test]
    fn eviction_honors_age_and_cap() {
        let mut store = JobStore::new();
        for i in 0..5 {
            let id = format!("job-{i}");
            let mut job = Job::new(id.clone(), spec(Priority::Normal), 0);
            job.state = JobState::Completed;
            job.finished_at = Some(i * 1000);
            store.jobs.insert(id.clone(), job);
            store.push_terminal(&id);
        }

        // Age: retention 2.5s at now=4s drops jobs finished at 0s and 1s.
        let evicted = store.evict_terminal(4_000, 2_500, 100);
        assert_eq!(evicted, 2);
        assert!(store.job("job-0").is_none());
        assert!(store.job("job-2").is_some());

        // Cap: only 1 terminal job may remain.
        let evicted = store.evict_terminal(4_000, 60_000, 1);
        assert_eq!(evicted, 2);
        assert!(store.job("job-4").is_some());
    }
}
