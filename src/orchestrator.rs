//! Execution orchestration: validate, register, run in the background,
//! persist the outcome, and answer status/result queries.
//!
//! `submit` returns as soon as the job is registered in `Queued` state; the
//! execution itself happens on a spawned task that only ever talks back
//! through the lock-protected [`SessionStore`]. Every background path ends in
//! a terminal job state — nothing is retried and nothing escapes unhandled.

use crate::config::SandboxSettings;
use crate::errors::{Result, SandboxError};
use crate::policy::ValidationPolicy;
use crate::preview::read_csv_preview;
use crate::runner::{resolve_python, CodeRunner, RunRequest, SandboxRunner, OUTPUT_PATH_VAR};
use crate::store::{ExecutionJob, JobStatus, SessionData, SessionStore};
use crate::validator::CodeValidator;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, info};

const OUTPUT_FILE: &str = "output.csv";

pub struct ExecutionOrchestrator {
    store: Arc<SessionStore>,
    runner: Arc<dyn CodeRunner>,
    settings: SandboxSettings,
}

impl ExecutionOrchestrator {
    /// Build an orchestrator with the subprocess-backed runner and the
    /// default validation policy.
    ///
    /// Fails hard if the interpreter cannot be found or the working root is
    /// not writable — the system is not operable in either case.
    pub fn new(store: Arc<SessionStore>, settings: SandboxSettings) -> Result<Self> {
        let python = resolve_python(settings.python_path.as_deref())?;
        let validator = CodeValidator::new(python.clone(), ValidationPolicy::default());
        let runner = SandboxRunner::new(python, validator, settings.memory_limit_mb)
            .with_output_caps(settings.max_stdout_bytes, settings.max_stderr_bytes);
        Self::with_runner(store, Arc::new(runner), settings)
    }

    /// Build with an explicit runner implementation.
    pub fn with_runner(
        store: Arc<SessionStore>,
        runner: Arc<dyn CodeRunner>,
        settings: SandboxSettings,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.work_root)?;
        Ok(Self {
            store,
            runner,
            settings,
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Register an uploaded dataset as a new session and return its id.
    /// The session directory (which will hold per-job execution directories)
    /// is created under the configured working root.
    pub async fn register_dataset(
        &self,
        dataset_path: PathBuf,
        filename: String,
        columns: Vec<String>,
        dtypes: HashMap<String, String>,
        row_count: usize,
    ) -> Result<String> {
        let mut session = SessionData::new(
            dataset_path,
            PathBuf::new(),
            filename,
            columns,
            dtypes,
            row_count,
        );
        session.session_dir = self.settings.work_root.join(&session.session_id);
        tokio::fs::create_dir_all(&session.session_dir).await?;
        let session_id = session.session_id.clone();
        self.store.create_session(session).await;
        Ok(session_id)
    }

    /// Validate `code` and queue it for execution against the session's
    /// dataset. Returns the job id immediately; poll [`get_status`] for the
    /// outcome.
    ///
    /// A validation failure is synchronous and creates no job.
    ///
    /// [`get_status`]: ExecutionOrchestrator::get_status
    pub async fn submit(&self, session_id: &str, code: &str) -> Result<String> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .ok_or_else(|| SandboxError::SessionNotFound(session_id.to_string()))?;

        let report = self.runner.validate(code).await?;
        if !report.is_valid() {
            return Err(SandboxError::Validation(report.combined_message()));
        }

        let job = self.store.create_job(session_id).await?;
        let job_id = job.job_id.clone();

        let store = self.store.clone();
        let runner = self.runner.clone();
        let settings = self.settings.clone();
        let session_id = session_id.to_string();
        let code = code.to_string();
        let spawned_job_id = job_id.clone();
        tokio::spawn(async move {
            run_job(store, runner, settings, session, session_id, spawned_job_id, code).await;
        });

        info!(job_id = %job_id, "execution job queued");
        Ok(job_id)
    }

    /// Current snapshot of a job. Idempotent; safe to poll.
    pub async fn get_status(&self, session_id: &str, job_id: &str) -> Result<ExecutionJob> {
        if self.store.get_session(session_id).await.is_none() {
            return Err(SandboxError::SessionNotFound(session_id.to_string()));
        }
        self.store
            .get_job(session_id, job_id)
            .await
            .ok_or_else(|| SandboxError::JobNotFound(job_id.to_string()))
    }

    /// Path of the full result artifact. Available only once the job has
    /// succeeded.
    pub async fn get_result_artifact(&self, session_id: &str, job_id: &str) -> Result<PathBuf> {
        let job = self.get_status(session_id, job_id).await?;
        if job.status != JobStatus::Success {
            return Err(SandboxError::OutputNotReady(job_id.to_string()));
        }
        job.output_path
            .ok_or_else(|| SandboxError::OutputNotReady(job_id.to_string()))
    }
}

/// Background execution path. Always leaves the job in a terminal state.
async fn run_job(
    store: Arc<SessionStore>,
    runner: Arc<dyn CodeRunner>,
    settings: SandboxSettings,
    session: SessionData,
    session_id: String,
    job_id: String,
    code: String,
) {
    let Some(mut job) = store.get_job(&session_id, &job_id).await else {
        return;
    };
    job.status = JobStatus::Running;
    job.started_at = Some(SystemTime::now());
    store.update_job(&session_id, job.clone()).await;

    let exec_id = uuid::Uuid::new_v4().simple().to_string();
    let exec_dir = session.session_dir.join(format!("exec_{}", &exec_id[..8]));
    let output_path = exec_dir.join(OUTPUT_FILE);
    let request = RunRequest {
        code,
        input_path: session.dataset_path.clone(),
        output_path: output_path.clone(),
        exec_dir,
        timeout: settings.timeout,
    };

    match runner.run(&request).await {
        Err(e) => {
            error!(job_id = %job_id, error = %e, "sandbox runner failed");
            job.finished_at = Some(SystemTime::now());
            job.status = JobStatus::Error;
            job.error_message = Some(format!("Internal error: {e}"));
        }
        Ok(outcome) => {
            job.finished_at = Some(SystemTime::now());
            job.execution_time_ms = Some(outcome.execution_time_ms);
            if outcome.timed_out {
                job.status = JobStatus::Error;
                job.error_message = Some(format!(
                    "Timeout: execution exceeded {}s limit.",
                    settings.timeout.as_secs()
                ));
            } else if outcome.exit_code != 0 {
                job.status = JobStatus::Error;
                let detail = if outcome.stderr.trim().is_empty() {
                    "Execution failed with no error output.".to_string()
                } else {
                    outcome.stderr
                };
                job.error_message = Some(detail);
            } else if !tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
                job.status = JobStatus::Error;
                job.error_message = Some(format!(
                    "No output file was generated. Ensure your code writes to the path named by {OUTPUT_PATH_VAR}."
                ));
            } else {
                match read_csv_preview(&output_path, settings.preview_row_count).await {
                    Ok(preview) => {
                        job.status = JobStatus::Success;
                        job.preview_columns = preview.columns;
                        job.preview_rows = preview.rows;
                        job.output_path = Some(output_path);
                    }
                    Err(e) => {
                        job.status = JobStatus::Error;
                        job.error_message = Some(format!("Output file could not be read: {e}"));
                    }
                }
            }
        }
    }

    info!(job_id = %job_id, status = ?job.status, "job finished");
    store.update_job(&session_id, job).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunOutcome;
    use crate::validator::ValidationReport;
    use async_trait::async_trait;
    use std::time::Duration;

    enum Behavior {
        /// Write this CSV text to the requested output path, exit 0.
        WriteCsv(&'static str),
        /// Exit 0 without producing any artifact.
        NoOutput,
        /// Exit nonzero with this stderr.
        Fail(&'static str),
        /// Report a timeout.
        TimeOut,
        /// Environment failure.
        Broken,
    }

    struct FakeRunner {
        behavior: Behavior,
    }

    #[async_trait]
    impl CodeRunner for FakeRunner {
        async fn validate(&self, code: &str) -> crate::errors::Result<ValidationReport> {
            let mut report = ValidationReport::default();
            if code.contains("import socket") {
                report.errors.push("Blocked import: 'socket'".to_string());
            }
            Ok(report)
        }

        async fn run(&self, request: &RunRequest) -> crate::errors::Result<RunOutcome> {
            let ok = RunOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
                execution_time_ms: 7,
            };
            match &self.behavior {
                Behavior::WriteCsv(text) => {
                    tokio::fs::create_dir_all(&request.exec_dir).await.unwrap();
                    tokio::fs::write(&request.output_path, text).await.unwrap();
                    Ok(ok)
                }
                Behavior::NoOutput => Ok(ok),
                Behavior::Fail(stderr) => Ok(RunOutcome {
                    exit_code: 1,
                    stderr: stderr.to_string(),
                    ..ok
                }),
                Behavior::TimeOut => Ok(RunOutcome {
                    exit_code: -1,
                    timed_out: true,
                    ..ok
                }),
                Behavior::Broken => {
                    Err(SandboxError::Internal("work dir vanished".to_string()))
                }
            }
        }
    }

    struct Fixture {
        orchestrator: ExecutionOrchestrator,
        session_id: String,
        _work: tempfile::TempDir,
    }

    async fn fixture(behavior: Behavior) -> Fixture {
        let work = tempfile::tempdir().unwrap();
        let settings = SandboxSettings {
            work_root: work.path().join("sessions"),
            timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let store = Arc::new(SessionStore::new());
        let orchestrator = ExecutionOrchestrator::with_runner(
            store,
            Arc::new(FakeRunner { behavior }),
            settings,
        )
        .unwrap();

        let dataset = work.path().join("data.csv");
        tokio::fs::write(&dataset, "a,b\n1,x\n").await.unwrap();
        let session_id = orchestrator
            .register_dataset(
                dataset,
                "data.csv".to_string(),
                vec!["a".to_string(), "b".to_string()],
                HashMap::new(),
                1,
            )
            .await
            .unwrap();

        Fixture {
            orchestrator,
            session_id,
            _work: work,
        }
    }

    async fn wait_terminal(f: &Fixture, job_id: &str) -> ExecutionJob {
        for _ in 0..500 {
            let job = f
                .orchestrator
                .get_status(&f.session_id, job_id)
                .await
                .unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_returns_queued_job_immediately() {
        let f = fixture(Behavior::WriteCsv("c1,c2\n1,2\n3,4\n5,6\n")).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        assert!(!job_id.is_empty());
        let job = wait_terminal(&f, &job_id).await;
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.preview_columns, vec!["c1", "c2"]);
        assert_eq!(job.preview_rows.len(), 3);
        assert_eq!(job.execution_time_ms, Some(7));
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn validation_failure_is_synchronous_and_creates_no_job() {
        let f = fixture(Behavior::WriteCsv("c\n1\n")).await;
        let err = f
            .orchestrator
            .submit(&f.session_id, "import socket\n")
            .await
            .unwrap_err();
        match err {
            SandboxError::Validation(msg) => assert!(msg.contains("socket")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_artifact_is_a_terminal_error() {
        let f = fixture(Behavior::NoOutput).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let job = wait_terminal(&f, &job_id).await;
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_message.unwrap().contains("OUTPUT_FILE_PATH"));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let f = fixture(Behavior::Fail("EXECUTION ERROR: boom")).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let job = wait_terminal(&f, &job_id).await;
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn nonzero_exit_with_empty_stderr_gets_a_generic_message() {
        let f = fixture(Behavior::Fail("")).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let job = wait_terminal(&f, &job_id).await;
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.error_message.as_deref(),
            Some("Execution failed with no error output.")
        );
    }

    #[tokio::test]
    async fn timeout_becomes_a_terminal_error() {
        let f = fixture(Behavior::TimeOut).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let job = wait_terminal(&f, &job_id).await;
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_message.unwrap().starts_with("Timeout:"));
    }

    #[tokio::test]
    async fn runner_failure_becomes_an_internal_error_state() {
        let f = fixture(Behavior::Broken).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let job = wait_terminal(&f, &job_id).await;
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error_message.unwrap().starts_with("Internal error:"));
    }

    #[tokio::test]
    async fn unknown_session_and_job_are_not_found() {
        let f = fixture(Behavior::NoOutput).await;
        assert!(matches!(
            f.orchestrator.submit("missing", "def main(): pass").await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert!(matches!(
            f.orchestrator.get_status("missing", "job").await,
            Err(SandboxError::SessionNotFound(_))
        ));
        assert!(matches!(
            f.orchestrator.get_status(&f.session_id, "missing").await,
            Err(SandboxError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn artifact_is_only_available_after_success() {
        let f = fixture(Behavior::WriteCsv("c\n1\n")).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let job = wait_terminal(&f, &job_id).await;
        assert_eq!(job.status, JobStatus::Success);

        let path = f
            .orchestrator
            .get_result_artifact(&f.session_id, &job_id)
            .await
            .unwrap();
        assert!(path.ends_with("output.csv"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn artifact_of_a_failed_job_is_not_ready() {
        let f = fixture(Behavior::NoOutput).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        wait_terminal(&f, &job_id).await;
        assert!(matches!(
            f.orchestrator
                .get_result_artifact(&f.session_id, &job_id)
                .await,
            Err(SandboxError::OutputNotReady(_))
        ));
    }

    #[tokio::test]
    async fn observed_statuses_never_move_backwards() {
        let f = fixture(Behavior::WriteCsv("c\n1\n")).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();

        let order = |s: &JobStatus| match s {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Success | JobStatus::Error => 2,
        };
        let mut last = 0;
        for _ in 0..200 {
            let job = f
                .orchestrator
                .get_status(&f.session_id, &job_id)
                .await
                .unwrap();
            let rank = order(&job.status);
            assert!(rank >= last, "status moved backwards");
            last = rank;
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(last, 2);
    }

    #[tokio::test]
    async fn terminal_snapshot_is_idempotent() {
        let f = fixture(Behavior::WriteCsv("c\n1\n2\n")).await;
        let job_id = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let first = wait_terminal(&f, &job_id).await;
        let second = f
            .orchestrator
            .get_status(&f.session_id, &job_id)
            .await
            .unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.preview_rows, second.preview_rows);
        assert_eq!(first.execution_time_ms, second.execution_time_ms);
    }

    #[tokio::test]
    async fn concurrent_jobs_for_one_session_both_finish() {
        let f = fixture(Behavior::WriteCsv("c\n1\n")).await;
        let a = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    pass\n")
            .await
            .unwrap();
        let b = f
            .orchestrator
            .submit(&f.session_id, "def main():\n    print('second')\n")
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(wait_terminal(&f, &a).await.status, JobStatus::Success);
        assert_eq!(wait_terminal(&f, &b).await.status, JobStatus::Success);
    }
}
