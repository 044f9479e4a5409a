//! Sandboxed execution of untrusted Python transform code against uploaded
//! tabular datasets.
//!
//! The pipeline has three independently-testable stages:
//!
//! 1. **Validation** ([`validator`]): the candidate source is AST-walked
//!    against a denylist policy without ever being executed. Rejected code
//!    never becomes a job.
//! 2. **Execution** ([`runner`]): accepted code runs in a subprocess with a
//!    scrubbed environment, restricted builtins, resource limits, and a hard
//!    wall-clock timeout. The code talks to the host only through two
//!    environment variables naming an input and an output file.
//! 3. **Lifecycle** ([`store`] + [`orchestrator`]): jobs move through
//!    `queued → running → {success | error}` in a concurrency-safe in-memory
//!    registry, submitted fire-and-forget and observed by polling.
//!
//! ```no_run
//! use pandasbox::{ExecutionOrchestrator, SandboxSettings, SessionStore};
//! use std::sync::Arc;
//!
//! # async fn demo() -> pandasbox::Result<()> {
//! let store = Arc::new(SessionStore::new());
//! let orchestrator = ExecutionOrchestrator::new(store, SandboxSettings::default())?;
//!
//! let session_id = orchestrator
//!     .register_dataset(
//!         "/data/sales.csv".into(),
//!         "sales.csv".to_string(),
//!         vec!["region".to_string(), "amount".to_string()],
//!         Default::default(),
//!         1000,
//!     )
//!     .await?;
//!
//! let code = r#"
//! import os
//! import pandas as pd
//!
//! def main():
//!     df = pd.read_csv(os.environ['INPUT_FILE_PATH'])
//!     df.groupby('region').sum().to_csv(os.environ['OUTPUT_FILE_PATH'])
//! "#;
//! let job_id = orchestrator.submit(&session_id, code).await?;
//! let job = orchestrator.get_status(&session_id, &job_id).await?;
//! println!("{:?}", job.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod policy;
pub mod preview;
pub mod runner;
pub mod store;
pub mod validator;

pub use config::SandboxSettings;
pub use errors::{Result, SandboxError};
pub use orchestrator::ExecutionOrchestrator;
pub use policy::ValidationPolicy;
pub use preview::TablePreview;
pub use runner::{CodeRunner, RunOutcome, RunRequest, SandboxRunner};
pub use store::{run_session_sweeper, ExecutionJob, JobStatus, SessionData, SessionStore};
pub use validator::{CodeValidator, ValidationReport};
