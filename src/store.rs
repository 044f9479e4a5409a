//! In-memory session and execution-job registry.
//!
//! One lock guards the whole table; every read and write goes through it, so
//! no caller ever observes a partially-updated job record. Sessions own their
//! jobs and both are ephemeral: nothing survives a process restart.

use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Lifecycle state of an execution job. Transitions are one-directional:
/// `Queued → Running → {Success | Error}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    /// Position in the state machine; transitions may only move forward.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Success | JobStatus::Error => 2,
        }
    }
}

/// One tracked attempt to run candidate code against a session's dataset.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionJob {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip)]
    pub created_at: SystemTime,
    #[serde(skip)]
    pub started_at: Option<SystemTime>,
    #[serde(skip)]
    pub finished_at: Option<SystemTime>,
    pub preview_rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub preview_columns: Vec<String>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<u64>,
    /// Full result artifact, present only on success.
    #[serde(skip)]
    pub output_path: Option<PathBuf>,
}

impl ExecutionJob {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            preview_rows: Vec::new(),
            preview_columns: Vec::new(),
            error_message: None,
            execution_time_ms: None,
            output_path: None,
        }
    }
}

/// Server-side context binding one uploaded dataset to subsequent operations.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub session_id: String,
    pub created_at: SystemTime,
    /// Cached columnar representation of the uploaded dataset (read-only).
    pub dataset_path: PathBuf,
    /// Directory that holds this session's per-job execution directories.
    pub session_dir: PathBuf,
    pub filename: String,
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<String>,
    pub dtypes: HashMap<String, String>,
    jobs: HashMap<String, ExecutionJob>,
}

impl SessionData {
    pub fn new(
        dataset_path: PathBuf,
        session_dir: PathBuf,
        filename: String,
        columns: Vec<String>,
        dtypes: HashMap<String, String>,
        row_count: usize,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: SystemTime::now(),
            dataset_path,
            session_dir,
            filename,
            row_count,
            column_count: columns.len(),
            columns,
            dtypes,
            jobs: HashMap::new(),
        }
    }
}

/// Concurrency-safe in-memory table of sessions and their jobs.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<String, SessionData>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(&self, session: SessionData) {
        let mut table = self.inner.lock().await;
        info!(session_id = %session.session_id, "session created");
        table.insert(session.session_id.clone(), session);
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionData> {
        let table = self.inner.lock().await;
        table.get(session_id).cloned()
    }

    /// Allocate a new job in `Queued` state, bound to the session.
    pub async fn create_job(&self, session_id: &str) -> Result<ExecutionJob> {
        let mut table = self.inner.lock().await;
        let session = table
            .get_mut(session_id)
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;
        let job = ExecutionJob::new(uuid::Uuid::new_v4().to_string());
        session.jobs.insert(job.job_id.clone(), job.clone());
        Ok(job)
    }

    pub async fn get_job(&self, session_id: &str, job_id: &str) -> Option<ExecutionJob> {
        let table = self.inner.lock().await;
        table
            .get(session_id)
            .and_then(|session| session.jobs.get(job_id))
            .cloned()
    }

    /// Replace the stored job record. Transitions that would move the state
    /// machine backwards (or rewrite a terminal job) are ignored.
    pub async fn update_job(&self, session_id: &str, job: ExecutionJob) {
        let mut table = self.inner.lock().await;
        let Some(session) = table.get_mut(session_id) else {
            warn!(session_id, job_id = %job.job_id, "update for unknown session dropped");
            return;
        };
        let Some(stored) = session.jobs.get_mut(&job.job_id) else {
            warn!(session_id, job_id = %job.job_id, "update for unknown job dropped");
            return;
        };
        if stored.status.is_terminal() || job.status.rank() < stored.status.rank() {
            warn!(
                job_id = %job.job_id,
                from = ?stored.status,
                to = ?job.status,
                "illegal job transition ignored"
            );
            return;
        }
        *stored = job;
    }

    /// Remove sessions (and their jobs) older than `ttl`. Returns the number
    /// removed.
    pub async fn cleanup_expired(&self, ttl: Duration) -> usize {
        let now = SystemTime::now();
        let mut table = self.inner.lock().await;
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, session)| {
                now.duration_since(session.created_at)
                    .map(|age| age > ttl)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            table.remove(id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sessions removed");
        }
        expired.len()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Periodic TTL sweep, meant to be spawned once at startup alongside the
/// store it guards.
pub async fn run_session_sweeper(
    store: std::sync::Arc<SessionStore>,
    ttl: Duration,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; skip it
    loop {
        ticker.tick().await;
        let removed = store.cleanup_expired(ttl).await;
        if removed > 0 {
            info!(removed, "session GC pass");
        }
    }
}
