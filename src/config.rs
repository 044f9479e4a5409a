use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Settings for the execution core, supplied once at process start.
///
/// Values come from built-in defaults overridden by `PANDASBOX_*` environment
/// variables (see [`SandboxSettings::from_env`]). They are never renegotiated
/// per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Root directory for per-session execution directories.
    pub work_root: PathBuf,
    /// Hard wall-clock timeout for one execution.
    pub timeout: Duration,
    /// Address-space limit for the child process, in MB.
    pub memory_limit_mb: u64,
    /// Number of result rows returned for display.
    pub preview_row_count: usize,
    /// Sessions older than this are swept away along with their jobs.
    pub session_ttl: Duration,
    /// Captured stdout is truncated to this many bytes.
    pub max_stdout_bytes: usize,
    /// Captured stderr is truncated to this many bytes.
    pub max_stderr_bytes: usize,
    /// Explicit interpreter path; `None` means discover via PATH.
    pub python_path: Option<PathBuf>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("pandasbox-sessions"),
            timeout: Duration::from_secs(30),
            memory_limit_mb: 512,
            preview_row_count: 50,
            session_ttl: Duration::from_secs(3600),
            max_stdout_bytes: 4000,
            max_stderr_bytes: 2000,
            python_path: None,
        }
    }
}

impl SandboxSettings {
    /// Build settings from defaults overridden by OS environment variables.
    ///
    /// Recognized variables: `PANDASBOX_WORK_ROOT`, `PANDASBOX_TIMEOUT_SECONDS`,
    /// `PANDASBOX_MEMORY_LIMIT_MB`, `PANDASBOX_PREVIEW_ROW_COUNT`,
    /// `PANDASBOX_SESSION_TTL_SECONDS`, `PANDASBOX_PYTHON`.
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(dir) = std::env::var("PANDASBOX_WORK_ROOT") {
            if !dir.trim().is_empty() {
                settings.work_root = PathBuf::from(dir);
            }
        }
        if let Some(secs) = read_env_u64("PANDASBOX_TIMEOUT_SECONDS") {
            settings.timeout = Duration::from_secs(secs.clamp(5, 300));
        }
        if let Some(mb) = read_env_u64("PANDASBOX_MEMORY_LIMIT_MB") {
            settings.memory_limit_mb = mb.clamp(64, 4096);
        }
        if let Some(rows) = read_env_u64("PANDASBOX_PREVIEW_ROW_COUNT") {
            settings.preview_row_count = rows.clamp(5, 500) as usize;
        }
        if let Some(secs) = read_env_u64("PANDASBOX_SESSION_TTL_SECONDS") {
            settings.session_ttl = Duration::from_secs(secs.max(60));
        }
        if let Ok(path) = std::env::var("PANDASBOX_PYTHON") {
            if !path.trim().is_empty() {
                settings.python_path = Some(PathBuf::from(path));
            }
        }

        info!(
            work_root = %settings.work_root.display(),
            timeout_s = settings.timeout.as_secs(),
            memory_mb = settings.memory_limit_mb,
            preview_rows = settings.preview_row_count,
            "settings loaded"
        );
        settings
    }
}

fn read_env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
