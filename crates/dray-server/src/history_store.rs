/// Durable history: minute-aligned health samples in one SQLite file,
/// job history + audit events in another. Both run WAL journaling so
/// dashboard reads never block the single writer.
///
/// Architecture:
///   - the scheduler and sampler push `HistoryEvent`s onto an unbounded
///     channel while holding their own locks (send never blocks)
///   - `run_writer` drains the channel and performs every durable write,
///     retrying with backoff on storage errors
///   - read methods are called directly from request handlers
///
/// Retention: minute samples are pruned on every minute write; job history
/// is pruned by a daily tick and on demand via the cleanup endpoint.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dray_core::config::HistoryConfig;
use dray_core::events::{AuditEvent, HistoryEvent};
use dray_core::job::JobHistoryRow;

const WRITE_ATTEMPTS: u32 = 3;

pub struct HistoryStore {
    stats_db: Mutex<Connection>,
    jobs_db: Mutex<Connection>,
    /// Consecutive-failure counter, surfaced on /healthz.
    pub write_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteRow {
    pub ts: u64,
    pub busy: f64,
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: i64,
    pub ts: u64,
    pub entity_kind: String,
    pub entity_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddonStats {
    pub addon_id: String,
    pub jobs: u64,
    pub avg_runtime_s: f64,
    pub p95_runtime_s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub days: u32,
    pub total_jobs: u64,
    pub by_state: BTreeMap<String, u64>,
    pub success_rate: f64,
    pub avg_queue_wait_s: f64,
    pub addons: Vec<AddonStats>,
}

impl HistoryStore {
    pub fn open(stats_path: &Path, jobs_path: &Path) -> anyhow::Result<Self> {
        let stats_db = Connection::open(stats_path)?;
        stats_db.pragma_update(None, "journal_mode", "WAL")?;
        stats_db.pragma_update(None, "synchronous", "NORMAL")?;
        stats_db.execute_batch(
            "CREATE TABLE IF NOT EXISTS stats_minute (
                ts INTEGER PRIMARY KEY,
                busy REAL NOT NULL,
                snapshot BLOB NOT NULL
            );",
        )?;

        let jobs_db = Connection::open(jobs_path)?;
        jobs_db.pragma_update(None, "journal_mode", "WAL")?;
        jobs_db.pragma_update(None, "synchronous", "NORMAL")?;
        jobs_db.execute_batch(
            "CREATE TABLE IF NOT EXISTS job_history (
                job_id TEXT PRIMARY KEY,
                addon_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                priority TEXT NOT NULL,
                requested_units INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                leased_at INTEGER,
                started_at INTEGER,
                finished_at INTEGER,
                queue_wait_s REAL,
                runtime_s REAL,
                error TEXT,
                result BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_job_history_created
                ON job_history (created_at);

            CREATE TABLE IF NOT EXISTS job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                type TEXT NOT NULL,
                data BLOB
            );
            CREATE INDEX IF NOT EXISTS idx_job_events_ts
                ON job_events (ts);",
        )?;

        Ok(Self {
            stats_db: Mutex::new(stats_db),
            jobs_db: Mutex::new(jobs_db),
            write_errors: AtomicU64::new(0),
        })
    }

    // ── Writes (writer task only) ──

    /// Insert a minute sample and prune rows past the retention horizon in
    /// the same call.
    pub fn record_minute(
        &self,
        ts_s: u64,
        busy: f64,
        snapshot: &serde_json::Value,
        retention_hours: u32,
    ) -> rusqlite::Result<()> {
        let conn = self.stats_db.lock().expect("stats db poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO stats_minute (ts, busy, snapshot) VALUES (?1, ?2, ?3)",
            params![ts_s, busy, snapshot.to_string().into_bytes()],
        )?;
        let horizon = ts_s.saturating_sub(retention_hours as u64 * 3600);
        conn.execute("DELETE FROM stats_minute WHERE ts < ?1", params![horizon])?;
        Ok(())
    }

    pub fn upsert_job_row(&self, row: &JobHistoryRow) -> rusqlite::Result<()> {
        let conn = self.jobs_db.lock().expect("jobs db poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO job_history
                (job_id, addon_id, job_type, priority, requested_units, state,
                 created_at, leased_at, started_at, finished_at,
                 queue_wait_s, runtime_s, error, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.job_id,
                row.addon_id,
                row.job_type,
                row.priority.as_str(),
                row.requested_units,
                row.state.as_str(),
                row.created_at,
                row.leased_at,
                row.started_at,
                row.finished_at,
                row.queue_wait_s,
                row.runtime_s,
                row.error,
                row.result.as_ref().map(|v| v.to_string().into_bytes()),
            ],
        )?;
        Ok(())
    }

    pub fn append_event(&self, event: &AuditEvent) -> rusqlite::Result<()> {
        let (entity_kind, entity_id) = event.entity();
        let data = serde_json::to_string(event).unwrap_or_default();
        let conn = self.jobs_db.lock().expect("jobs db poisoned");
        conn.execute(
            "INSERT INTO job_events (ts, entity_kind, entity_id, type, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event.ts(), entity_kind, entity_id, event.kind(), data.into_bytes()],
        )?;
        Ok(())
    }

    /// Prune job history and events older than `days`. Returns
    /// `(history_rows, event_rows)` deleted.
    pub fn cleanup_jobs(&self, days: u32, now_ms: u64) -> rusqlite::Result<(usize, usize)> {
        let horizon = now_ms.saturating_sub(days as u64 * 86_400_000);
        let conn = self.jobs_db.lock().expect("jobs db poisoned");
        let rows = conn.execute(
            "DELETE FROM job_history WHERE created_at < ?1",
            params![horizon],
        )?;
        let events = conn.execute("DELETE FROM job_events WHERE ts < ?1", params![horizon])?;
        Ok((rows, events))
    }

    // ── Reads (request handlers) ──

    pub fn minute_range(&self, from_s: u64, to_s: u64) -> rusqlite::Result<Vec<MinuteRow>> {
        let conn = self.stats_db.lock().expect("stats db poisoned");
        let mut stmt = conn.prepare(
            "SELECT ts, busy, snapshot FROM stats_minute
             WHERE ts >= ?1 AND ts <= ?2 ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![from_s, to_s], |row| {
            let blob: Vec<u8> = row.get(2)?;
            Ok(MinuteRow {
                ts: row.get(0)?,
                busy: row.get(1)?,
                snapshot: serde_json::from_slice(&blob).unwrap_or(serde_json::Value::Null),
            })
        })?;
        rows.collect()
    }

    pub fn get_job_row(&self, job_id: &str) -> rusqlite::Result<Option<JobHistoryRow>> {
        let conn = self.jobs_db.lock().expect("jobs db poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_id, addon_id, job_type, priority, requested_units, state,
                    created_at, leased_at, started_at, finished_at,
                    queue_wait_s, runtime_s, error, result
             FROM job_history WHERE job_id = ?1",
        )?;
        stmt.query_row(params![job_id], row_to_history).optional()
    }

    pub fn recent_events(&self, limit: usize) -> rusqlite::Result<Vec<EventRow>> {
        let conn = self.jobs_db.lock().expect("jobs db poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, ts, entity_kind, entity_id, type, data
             FROM job_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let blob: Option<Vec<u8>> = row.get(5)?;
            Ok(EventRow {
                id: row.get(0)?,
                ts: row.get(1)?,
                entity_kind: row.get(2)?,
                entity_id: row.get(3)?,
                event_type: row.get(4)?,
                data: blob
                    .and_then(|b| serde_json::from_slice(&b).ok())
                    .unwrap_or(serde_json::Value::Null),
            })
        })?;
        rows.collect()
    }

    /// Aggregate job statistics over the last `days`. Percentiles are
    /// computed in memory; the window is bounded by retention so the row
    /// count stays modest.
    pub fn stats(&self, days: u32, now_ms: u64) -> rusqlite::Result<HistoryStats> {
        let horizon = now_ms.saturating_sub(days as u64 * 86_400_000);
        let conn = self.jobs_db.lock().expect("jobs db poisoned");
        let mut stmt = conn.prepare(
            "SELECT addon_id, state, queue_wait_s, runtime_s
             FROM job_history WHERE created_at >= ?1",
        )?;
        let rows: Vec<(String, String, Option<f64>, Option<f64>)> = stmt
            .query_map(params![horizon], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        let mut by_state: BTreeMap<String, u64> = BTreeMap::new();
        let mut waits: Vec<f64> = Vec::new();
        let mut per_addon: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (addon, state, wait, runtime) in &rows {
            *by_state.entry(state.clone()).or_default() += 1;
            if let Some(w) = wait {
                waits.push(*w);
            }
            per_addon.entry(addon.clone()).or_default();
            if let Some(r) = runtime {
                per_addon.entry(addon.clone()).or_default().push(*r);
            }
        }

        let completed = *by_state.get("completed").unwrap_or(&0);
        let failed = *by_state.get("failed").unwrap_or(&0);
        let expired = *by_state.get("expired").unwrap_or(&0);
        let terminal = completed + failed + expired;
        let success_rate = if terminal > 0 {
            completed as f64 / terminal as f64
        } else {
            0.0
        };

        let avg_queue_wait_s = if waits.is_empty() {
            0.0
        } else {
            waits.iter().sum::<f64>() / waits.len() as f64
        };

        let addon_totals: BTreeMap<&str, u64> = {
            let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
            for (addon, _, _, _) in &rows {
                *totals.entry(addon.as_str()).or_default() += 1;
            }
            totals
        };
        let addons = per_addon
            .iter()
            .map(|(addon, runtimes)| {
                let mut sorted = runtimes.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let avg = if sorted.is_empty() {
                    0.0
                } else {
                    sorted.iter().sum::<f64>() / sorted.len() as f64
                };
                let p95 = if sorted.is_empty() {
                    0.0
                } else {
                    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
                    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
                };
                AddonStats {
                    addon_id: addon.clone(),
                    jobs: *addon_totals.get(addon.as_str()).unwrap_or(&0),
                    avg_runtime_s: avg,
                    p95_runtime_s: p95,
                }
            })
            .collect();

        Ok(HistoryStats {
            days,
            total_jobs: rows.len() as u64,
            by_state,
            success_rate,
            avg_queue_wait_s,
            addons,
        })
    }
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobHistoryRow> {
    let priority: String = row.get(3)?;
    let state: String = row.get(5)?;
    let result: Option<Vec<u8>> = row.get(13)?;
    Ok(JobHistoryRow {
        job_id: row.get(0)?,
        addon_id: row.get(1)?,
        job_type: row.get(2)?,
        priority: priority.parse().unwrap_or(dray_core::job::Priority::Normal),
        requested_units: row.get(4)?,
        state: state.parse().unwrap_or(dray_core::job::JobState::Expired),
        created_at: row.get(6)?,
        leased_at: row.get(7)?,
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
        queue_wait_s: row.get(10)?,
        runtime_s: row.get(11)?,
        error: row.get(12)?,
        result: result.and_then(|b| serde_json::from_slice(&b).ok()),
    })
}

// ── Writer task ──

/// Drain the history channel and perform all durable writes. On shutdown,
/// finishes whatever is already queued before exiting.
pub async fn run_writer(
    store: Arc<HistoryStore>,
    mut rx: UnboundedReceiver<HistoryEvent>,
    cfg: HistoryConfig,
    cancel: CancellationToken,
) {
    let mut prune = tokio::time::interval(Duration::from_secs(86_400));
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; that doubles
    // as the startup prune.
    info!("history writer started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = prune.tick() => {
                let now_ms = unix_ms();
                match store.cleanup_jobs(cfg.retention_days, now_ms) {
                    Ok((rows, events)) if rows + events > 0 => {
                        info!(rows, events, days = cfg.retention_days, "pruned job history");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "history prune failed"),
                }
            }
            event = rx.recv() => match event {
                Some(event) => apply_with_retry(&store, &cfg, event).await,
                None => break,
            },
        }
    }

    // Flush everything the scheduler managed to enqueue before shutdown.
    let mut drained = 0usize;
    while let Ok(event) = rx.try_recv() {
        apply_with_retry(&store, &cfg, event).await;
        drained += 1;
    }
    if drained > 0 {
        debug!(drained, "history writer flushed backlog");
    }
    info!("history writer stopped");
}

async fn apply_with_retry(store: &HistoryStore, cfg: &HistoryConfig, event: HistoryEvent) {
    for attempt in 1..=WRITE_ATTEMPTS {
        match apply(store, cfg, &event) {
            Ok(()) => {
                store.write_errors.store(0, Ordering::Relaxed);
                return;
            }
            Err(e) if attempt < WRITE_ATTEMPTS => {
                warn!(error = %e, attempt, "history write failed, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(e) => {
                store.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "history write dropped after retries");
            }
        }
    }
}

fn apply(store: &HistoryStore, cfg: &HistoryConfig, event: &HistoryEvent) -> rusqlite::Result<()> {
    match event {
        HistoryEvent::Audit(audit) => store.append_event(audit),
        HistoryEvent::JobRow(row) => store.upsert_job_row(row),
        HistoryEvent::MinuteSample { ts_s, busy, snapshot } => {
            store.record_minute(*ts_s, *busy, snapshot, cfg.minute_retention_hours)
        }
    }
}

fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use dray_core::job::{JobState, Priority};
    use std::path::PathBuf;

    fn temp_paths(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("dray-history-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        (dir.join("stats.db"), dir.join("jobs.db"))
    }

    fn row(job_id: &str, addon: &str, state: JobState, created_at: u64, runtime_s: f64) -> JobHistoryRow {
        JobHistoryRow {
            job_id: job_id.into(),
            addon_id: addon.into(),
            job_type: "scan".into(),
            priority: Priority::Normal,
            requested_units: 10,
            state,
            created_at,
            leased_at: Some(created_at + 2_000),
            started_at: Some(created_at + 3_000),
            finished_at: Some(created_at + 3_000 + (runtime_s * 1000.0) as u64),
            queue_wait_s: Some(2.0),
            runtime_s: Some(runtime_s),
            error: None,
            result: Some(serde_json::json!({"ok": true})),
        }
    }

    #[test]
    fn minute_samples_round_trip_with_retention() {
        let (stats, jobs) = temp_paths("minute");
        let store = HistoryStore::open(&stats, &jobs).unwrap();

        let day = 86_400u64;
        store
            .record_minute(day, 2.0, &serde_json::json!({"cpu": 10}), 24)
            .unwrap();
        store
            .record_minute(day + 60, 3.5, &serde_json::json!({"cpu": 20}), 24)
            .unwrap();

        let rows = store.minute_range(0, day * 3).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, day);
        assert_eq!(rows[1].busy, 3.5);
        assert_eq!(rows[0].snapshot["cpu"], 10);

        // A write 25h later prunes the first two samples.
        store
            .record_minute(day + 25 * 3600, 1.0, &serde_json::json!({}), 24)
            .unwrap();
        let rows = store.minute_range(0, day * 3).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, day + 25 * 3600);
    }

    #[test]
    fn job_rows_upsert_by_id() {
        let (stats, jobs) = temp_paths("upsert");
        let store = HistoryStore::open(&stats, &jobs).unwrap();

        let mut r = row("job-1", "addon.a", JobState::Leased, 1_000, 0.0);
        r.finished_at = None;
        r.runtime_s = None;
        store.upsert_job_row(&r).unwrap();

        let r = row("job-1", "addon.a", JobState::Completed, 1_000, 5.0);
        store.upsert_job_row(&r).unwrap();

        let read = store.get_job_row("job-1").unwrap().unwrap();
        assert_eq!(read.state, JobState::Completed);
        assert_eq!(read.runtime_s, Some(5.0));
        assert_eq!(read.result, Some(serde_json::json!({"ok": true})));
        assert!(store.get_job_row("job-404").unwrap().is_none());
    }

    #[test]
    fn history_survives_reopen() {
        let (stats, jobs) = temp_paths("reopen");
        {
            let store = HistoryStore::open(&stats, &jobs).unwrap();
            store
                .upsert_job_row(&row("job-1", "addon.a", JobState::Completed, 1_000, 5.0))
                .unwrap();
        }
        let store = HistoryStore::open(&stats, &jobs).unwrap();
        let stats_out = store.stats(30, 2_000).unwrap();
        assert_eq!(stats_out.total_jobs, 1);
        assert_eq!(stats_out.by_state["completed"], 1);
    }

    #[test]
    fn stats_aggregates_states_and_addons() {
        let (stats, jobs) = temp_paths("stats");
        let store = HistoryStore::open(&stats, &jobs).unwrap();
        let now_ms = 10 * 86_400_000u64;

        for i in 0..8 {
            store
                .upsert_job_row(&row(
                    &format!("job-a{i}"),
                    "addon.a",
                    JobState::Completed,
                    now_ms - 1_000_000,
                    (i + 1) as f64,
                ))
                .unwrap();
        }
        let mut failed = row("job-f", "addon.b", JobState::Failed, now_ms - 1_000_000, 2.0);
        failed.error = Some("boom".into());
        store.upsert_job_row(&failed).unwrap();
        store
            .upsert_job_row(&row("job-e", "addon.b", JobState::Expired, now_ms - 1_000_000, 4.0))
            .unwrap();
        // Outside the window: ignored.
        store
            .upsert_job_row(&row("job-old", "addon.a", JobState::Completed, 1_000, 9.0))
            .unwrap();

        let out = store.stats(7, now_ms).unwrap();
        assert_eq!(out.total_jobs, 10);
        assert_eq!(out.by_state["completed"], 8);
        assert_eq!(out.by_state["failed"], 1);
        assert_eq!(out.by_state["expired"], 1);
        assert_eq!(out.success_rate, 0.8);
        assert_eq!(out.avg_queue_wait_s, 2.0);

        let addon_a = out.addons.iter().find(|a| a.addon_id == "addon.a").unwrap();
        assert_eq!(addon_a.jobs, 8);
        assert_eq!(addon_a.avg_runtime_s, 4.5);
        assert_eq!(addon_a.p95_runtime_s, 8.0);
    }

    #[test]
    fn cleanup_removes_only_old_rows() {
        let (stats, jobs) = temp_paths("cleanup");
        let store = HistoryStore::open(&stats, &jobs).unwrap();
        let now_ms = 40 * 86_400_000u64;

        store
            .upsert_job_row(&row("job-old", "addon.a", JobState::Completed, 1_000, 1.0))
            .unwrap();
        store
            .upsert_job_row(&row("job-new", "addon.a", JobState::Completed, now_ms - 1_000, 1.0))
            .unwrap();

        let (rows, _) = store.cleanup_jobs(30, now_ms).unwrap();
        assert_eq!(rows, 1);
        assert!(store.get_job_row("job-old").unwrap().is_none());
        assert!(store.get_job_row("job-new").unwrap().is_some());
    }

    #[test]
    fn events_append_and_read_back_newest_first() {
        let (stats, jobs) = temp_paths("events");
        let store = HistoryStore::open(&stats, &jobs).unwrap();

        store
            .append_event(&AuditEvent::JobSubmitted {
                ts: 1_000,
                job_id: "job-1".into(),
                addon_id: "addon.a".into(),
                job_type: "scan".into(),
                priority: "normal".into(),
                requested_units: 10,
            })
            .unwrap();
        store
            .append_event(&AuditEvent::LeaseGranted {
                ts: 2_000,
                lease_id: "lease-1".into(),
                job_id: "job-1".into(),
                worker_id: "w1".into(),
                capacity_units: 10,
            })
            .unwrap();

        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "LEASE_GRANTED");
        assert_eq!(events[0].entity_kind, "lease");
        assert_eq!(events[1].event_type, "JOB_SUBMITTED");
        assert_eq!(events[1].data["job_id"], "job-1");

        let limited = store.recent_events(1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn writer_drains_channel_on_shutdown() {
        let (stats, jobs) = temp_paths("writer");
        let store = Arc::new(HistoryStore::open(&stats, &jobs).unwrap());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_writer(
            store.clone(),
            rx,
            HistoryConfig::default(),
            cancel.clone(),
        ));

        tx.send(HistoryEvent::JobRow(row(
            "job-1",
            "addon.a",
            JobState::Completed,
            1_000,
            2.0,
        )))
        .unwrap();
        tx.send(HistoryEvent::MinuteSample {
            ts_s: 60,
            busy: 1.0,
            snapshot: serde_json::json!({}),
        })
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();

        assert!(store.get_job_row("job-1").unwrap().is_some());
        assert_eq!(store.minute_range(0, 120).unwrap().len(), 1);
    }
}
