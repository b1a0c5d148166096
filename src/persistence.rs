//! Persistence Store.
//!
//! An append-only JSON-Lines event log plus a compacted terminal-result
//! snapshot on disk: serde-based JSON state, loaded with a graceful
//! fallback to empty state on a missing or corrupt file (logged via
//! `tracing::warn!`), saved by writing the whole map back out.
//!
//! Durability contract: `plan_submitted` must be durable before
//! `submit_plan` returns to the caller; `request_running` must be durable
//! before the runner begins execution; `request_terminal` must be durable
//! before the environment is released back to the pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::model::{AllocationStatus, EnvId, ExecutionPlan, TestId, TestResult};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to write durable event: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("event log entry is corrupt: {0}")]
    CorruptLog(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// One durable event in the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    PlanSubmitted { plan: ExecutionPlan },
    RequestEnqueued { test_id: TestId, plan_id: String },
    RequestAllocated { test_id: TestId, env_id: EnvId },
    RequestRunning { test_id: TestId, attempt: u32 },
    RequestTerminal { result: TestResult },
    EnvStateChanged { env_id: EnvId, status: String },
    StatusChanged { test_id: TestId, status: AllocationStatus },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub ts: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// Compacted terminal-result snapshot, persisted alongside the raw log so
/// recovery and `get_result` don't need to replay the whole log.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ResultSnapshot {
    results: HashMap<String, TestResult>,
}

fn result_key(test_id: &str, attempt: u32) -> String {
    format!("{test_id}#{attempt}")
}

pub struct Persistence {
    root: PathBuf,
    seq: AtomicU64,
    log: Mutex<()>,
    snapshot: Mutex<ResultSnapshot>,
    errors: AtomicU64,
}

impl Persistence {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            seq: AtomicU64::new(0),
            log: Mutex::new(()),
            snapshot: Mutex::new(ResultSnapshot::default()),
            errors: AtomicU64::new(0),
        }
    }

    /// Count of failed durable writes since this store was opened. The
    /// Orchestrator watches this to decide when to enter degraded mode.
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join("results.json")
    }

    /// Loads the compacted result snapshot from disk. Falls back to an
    /// empty snapshot on a missing or corrupt file.
    pub async fn load(root: PathBuf) -> Self {
        let persistence = Self::new(root);
        let path = persistence.snapshot_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<ResultSnapshot>(&content) {
                Ok(snap) => {
                    *persistence.snapshot.lock().await = snap;
                }
                Err(e) => {
                    warn!("result snapshot at {} is corrupt, starting empty: {e}", path.display());
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("could not read result snapshot at {}: {e}", path.display());
            }
        }
        let max_seq = persistence.max_seq_in_log().await.unwrap_or(0);
        persistence.seq.store(max_seq, Ordering::SeqCst);
        persistence
    }

    async fn max_seq_in_log(&self) -> PersistenceResult<u64> {
        let mut max = 0u64;
        for record in self.read_all().await? {
            max = max.max(record.seq);
        }
        Ok(max)
    }

    async fn append_raw(&self, event: Event) -> PersistenceResult<EventRecord> {
        match self.append_raw_inner(event).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn append_raw_inner(&self, event: Event) -> PersistenceResult<EventRecord> {
        tokio::fs::create_dir_all(&self.root).await?;
        let _guard = self.log.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = EventRecord {
            seq,
            ts: chrono::Utc::now(),
            event,
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| PersistenceError::CorruptLog(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await
            .map_err(PersistenceError::WriteFailed)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(PersistenceError::WriteFailed)?;
        file.write_all(b"\n").await.map_err(PersistenceError::WriteFailed)?;
        file.flush().await.map_err(PersistenceError::WriteFailed)?;
        Ok(record)
    }

    pub async fn append_plan_submitted(&self, plan: &ExecutionPlan) -> PersistenceResult<()> {
        self.append_raw(Event::PlanSubmitted { plan: plan.clone() }).await?;
        Ok(())
    }

    pub async fn append_request_enqueued(&self, test_id: &str, plan_id: &str) -> PersistenceResult<()> {
        self.append_raw(Event::RequestEnqueued {
            test_id: test_id.to_string(),
            plan_id: plan_id.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn append_request_allocated(&self, test_id: &str, env_id: &str) -> PersistenceResult<()> {
        self.append_raw(Event::RequestAllocated {
            test_id: test_id.to_string(),
            env_id: env_id.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Durable before the runner begins execution.
    pub async fn append_request_running(&self, test_id: &str, attempt: u32) -> PersistenceResult<()> {
        self.append_raw(Event::RequestRunning {
            test_id: test_id.to_string(),
            attempt,
        })
        .await?;
        Ok(())
    }

    /// Durable before the environment is released. Idempotent: a
    /// second write for the same `(test_id, attempt)` overwrites the
    /// snapshot entry with an identical value (P9).
    pub async fn append_request_terminal(&self, result: &TestResult) -> PersistenceResult<()> {
        debug_assert!(result.is_complete(), "terminal result {} missing required fields", result.test_id);
        self.append_raw(Event::RequestTerminal { result: result.clone() }).await?;
        if let Err(e) = self.write_snapshot(result).await {
            self.errors.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn write_snapshot(&self, result: &TestResult) -> PersistenceResult<()> {
        let mut snapshot = self.snapshot.lock().await;
        snapshot
            .results
            .insert(result_key(&result.test_id, result.attempt), result.clone());
        let serialized = serde_json::to_string_pretty(&*snapshot)
            .map_err(|e| PersistenceError::CorruptLog(e.to_string()))?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.snapshot_path(), serialized).await?;
        Ok(())
    }

    pub async fn append_env_state_changed(&self, env_id: &str, status: &str) -> PersistenceResult<()> {
        self.append_raw(Event::EnvStateChanged {
            env_id: env_id.to_string(),
            status: status.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn append_status_change(&self, test_id: &str, status: AllocationStatus) -> PersistenceResult<()> {
        self.append_raw(Event::StatusChanged {
            test_id: test_id.to_string(),
            status,
        })
        .await?;
        Ok(())
    }

    /// Reads every record currently in the event log, in append order.
    /// Unknown event types are preserved and passed through as-is, which
    /// falls naturally out of serde's `#[serde(tag = "type")]` dispatch:
    /// unknown variants fail to parse that one line, which we skip rather
    /// than aborting recovery, for schema backward-compatibility.
    pub async fn read_all(&self) -> PersistenceResult<Vec<EventRecord>> {
        let path = self.log_path();
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(&line) {
                Ok(record) => out.push(record),
                Err(e) => warn!("skipping unreadable event-log line: {e}"),
            }
        }
        Ok(out)
    }

    pub async fn get_result(&self, test_id: &str) -> Option<TestResult> {
        let snapshot = self.snapshot.lock().await;
        snapshot
            .results
            .values()
            .filter(|r| r.test_id == test_id)
            .max_by_key(|r| r.attempt)
            .cloned()
    }

    pub async fn all_terminal_results(&self) -> HashMap<String, TestResult> {
        self.snapshot.lock().await.results.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArtifactBundle, AllocationStatus as Status};
    use tempfile::TempDir;

    fn sample_result(test_id: &str, attempt: u32, status: Status) -> TestResult {
        TestResult {
            test_id: test_id.to_string(),
            attempt,
            status,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
            artifacts: ArtifactBundle::default(),
            failure_class: None,
            env_id: "e1".to_string(),
        }
    }

    #[tokio::test]
    async fn load_falls_back_to_empty_on_missing_file() {
        let dir = TempDir::new().unwrap();
        let p = Persistence::load(dir.path().to_path_buf()).await;
        assert!(p.get_result("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn terminal_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let p = Persistence::load(dir.path().to_path_buf()).await;
        let r = sample_result("t1", 1, Status::Completed);
        p.append_request_terminal(&r).await.unwrap();
        p.append_request_terminal(&r).await.unwrap();
        let stored = p.get_result("t1").await.unwrap();
        assert_eq!(stored.attempt, 1);
        assert_eq!(p.all_terminal_results().await.len(), 1);
    }

    #[tokio::test]
    async fn get_result_returns_latest_attempt() {
        let dir = TempDir::new().unwrap();
        let p = Persistence::load(dir.path().to_path_buf()).await;
        p.append_request_terminal(&sample_result("t1", 1, Status::Failed)).await.unwrap();
        p.append_request_terminal(&sample_result("t1", 2, Status::Completed)).await.unwrap();
        let stored = p.get_result("t1").await.unwrap();
        assert_eq!(stored.attempt, 2);
        assert_eq!(stored.status, Status::Completed);
    }

    #[tokio::test]
    async fn reload_recovers_snapshot_across_restarts() {
        let dir = TempDir::new().unwrap();
        {
            let p = Persistence::load(dir.path().to_path_buf()).await;
            p.append_request_terminal(&sample_result("t1", 1, Status::Completed)).await.unwrap();
        }
        let p2 = Persistence::load(dir.path().to_path_buf()).await;
        assert!(p2.get_result("t1").await.is_some());
    }

    #[tokio::test]
    async fn error_count_starts_at_zero_and_climbs_on_write_failure() {
        let dir = TempDir::new().unwrap();
        let p = Persistence::load(dir.path().to_path_buf()).await;
        assert_eq!(p.error_count(), 0);

        // Replace the persistence root with a file so `create_dir_all`
        // inside the next append fails.
        std::fs::remove_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path(), b"not a directory").unwrap();

        let result = p.append_request_enqueued("t1", "plan1").await;
        assert!(result.is_err());
        assert_eq!(p.error_count(), 1);
    }

    #[tokio::test]
    async fn read_all_preserves_append_order() {
        let dir = TempDir::new().unwrap();
        let p = Persistence::load(dir.path().to_path_buf()).await;
        p.append_request_running("t1", 1).await.unwrap();
        p.append_request_terminal(&sample_result("t1", 1, Status::Completed)).await.unwrap();
        let records = p.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].seq < records[1].seq);
    }
}
