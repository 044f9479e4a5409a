//! Out-of-process execution of validated candidate code.
//!
//! Each run gets a fresh execution directory holding the candidate source
//! (`transform.py`), a generated launcher that execs it under restricted
//! builtins, and the output artifact. The child process sees a scrubbed
//! environment whose only data channel is the `INPUT_FILE_PATH` /
//! `OUTPUT_FILE_PATH` variable pair, and is killed unconditionally when the
//! wall-clock timeout expires.

use crate::errors::{Result, SandboxError};
use crate::policy::SAFE_BUILTINS;
use crate::validator::{CodeValidator, ValidationReport};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

/// Environment variable naming the input dataset path inside the sandbox.
pub const INPUT_PATH_VAR: &str = "INPUT_FILE_PATH";
/// Environment variable naming the output artifact path inside the sandbox.
pub const OUTPUT_PATH_VAR: &str = "OUTPUT_FILE_PATH";

const CANDIDATE_FILE: &str = "transform.py";
const LAUNCHER_FILE: &str = "launcher.py";

/// One execution request. `exec_dir` must be unique to this run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub code: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub exec_dir: PathBuf,
    pub timeout: Duration,
}

/// What happened when the child ran. Misbehaving candidate code is always
/// encoded here, never as an `Err`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub execution_time_ms: u64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Executes validated code against an input dataset.
///
/// `Err` is reserved for environment failures (cannot write the execution
/// directory, cannot spawn the interpreter); everything the candidate code
/// does wrong comes back as a [`RunOutcome`].
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Statically vet candidate code before any execution is attempted.
    async fn validate(&self, code: &str) -> Result<ValidationReport>;

    /// Execute previously validated code.
    async fn run(&self, request: &RunRequest) -> Result<RunOutcome>;
}

/// Locate the interpreter: explicit path if given, otherwise PATH discovery.
pub fn resolve_python(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => {
            if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(SandboxError::PythonNotFound)
            }
        }
        None => which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound),
    }
}

/// Subprocess-based runner with restricted builtins and resource limits.
pub struct SandboxRunner {
    python_path: PathBuf,
    validator: CodeValidator,
    memory_limit_mb: u64,
    max_stdout_bytes: usize,
    max_stderr_bytes: usize,
}

impl SandboxRunner {
    pub fn new(python_path: PathBuf, validator: CodeValidator, memory_limit_mb: u64) -> Self {
        Self {
            python_path,
            validator,
            memory_limit_mb,
            max_stdout_bytes: 4000,
            max_stderr_bytes: 2000,
        }
    }

    pub fn with_output_caps(mut self, max_stdout_bytes: usize, max_stderr_bytes: usize) -> Self {
        self.max_stdout_bytes = max_stdout_bytes;
        self.max_stderr_bytes = max_stderr_bytes;
        self
    }

    pub fn python_path(&self) -> &PathBuf {
        &self.python_path
    }

    /// The launcher injected next to the candidate code. It execs the
    /// candidate under an allowlisted `__builtins__` (with `__import__`
    /// re-permitted so allowlisted imports resolve) and then calls the
    /// required zero-argument `main()`.
    fn launcher_script(&self) -> String {
        let builtin_entries = SAFE_BUILTINS
            .iter()
            .map(|name| format!("    '{name}': {name},"))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"import os
import sys

SAFE_BUILTINS = {{
{builtin_entries}
    '__name__': '__main__',
    '__doc__': None,
    '__import__': __import__,
}}

user_code_path = os.path.join(os.path.dirname(os.path.abspath(__file__)), '{CANDIDATE_FILE}')
with open(user_code_path, 'r', encoding='utf-8') as f:
    user_code = f.read()

namespace = {{'__builtins__': SAFE_BUILTINS}}
try:
    exec(compile(user_code, '{CANDIDATE_FILE}', 'exec'), namespace)
except Exception as exc:
    print(f"EXECUTION ERROR: {{exc}}", file=sys.stderr)
    sys.exit(1)

entry = namespace.get('main')
if not callable(entry):
    print("EXECUTION ERROR: code must define a main() function", file=sys.stderr)
    sys.exit(1)

try:
    entry()
except Exception as exc:
    print(f"EXECUTION ERROR: {{exc}}", file=sys.stderr)
    sys.exit(1)
"#
        )
    }

    /// Minimal PATH for the child: just enough to run the interpreter.
    fn sandbox_path(&self) -> String {
        #[cfg(unix)]
        {
            "/usr/bin:/bin".to_string()
        }
        #[cfg(not(unix))]
        {
            self.python_path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        }
    }

    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command, timeout: Duration) {
        let memory_bytes = self.memory_limit_mb * 1024 * 1024;
        let cpu_seconds = timeout.as_secs().max(1);

        unsafe {
            cmd.pre_exec(move || {
                // New process group so the whole tree can be killed at once.
                libc::setpgid(0, 0);

                #[cfg(not(target_os = "macos"))]
                {
                    // macOS does not honor RLIMIT_AS.
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command, _timeout: Duration) {}

    #[cfg(unix)]
    fn kill_process_group(pid: u32) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    fn kill_process_group(_pid: u32) {}
}

#[async_trait]
impl CodeRunner for SandboxRunner {
    async fn validate(&self, code: &str) -> Result<ValidationReport> {
        self.validator.validate(code).await
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        tokio::fs::create_dir_all(&request.exec_dir).await?;
        tokio::fs::write(request.exec_dir.join(CANDIDATE_FILE), &request.code).await?;
        let launcher_path = request.exec_dir.join(LAUNCHER_FILE);
        tokio::fs::write(&launcher_path, self.launcher_script()).await?;

        let mut cmd = Command::new(&self.python_path);
        cmd.arg(&launcher_path)
            .current_dir(&request.exec_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear()
            .env(INPUT_PATH_VAR, &request.input_path)
            .env(OUTPUT_PATH_VAR, &request.output_path)
            .env("PATH", self.sandbox_path())
            .env("PYTHONPATH", "")
            .env("PYTHONDONTWRITEBYTECODE", "1");

        self.apply_resource_limits(&mut cmd, request.timeout);

        let start = Instant::now();
        let child = cmd.spawn()?;
        let pid = child.id();

        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                let exit_code = output.status.code().unwrap_or(-1);
                let stdout = truncate_utf8(&output.stdout, self.max_stdout_bytes);
                let stderr = truncate_utf8(&output.stderr, self.max_stderr_bytes);

                if exit_code != 0 {
                    warn!(exit_code, elapsed_ms, "sandbox exec failed");
                } else {
                    info!(elapsed_ms, "sandbox exec finished");
                }

                Ok(RunOutcome {
                    exit_code,
                    stdout,
                    stderr,
                    timed_out: false,
                    execution_time_ms: elapsed_ms,
                })
            }
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_) => {
                if let Some(pid) = pid {
                    Self::kill_process_group(pid);
                }
                let elapsed_ms = start.elapsed().as_millis() as u64;
                warn!(timeout_s = request.timeout.as_secs(), "sandbox exec timed out");
                Ok(RunOutcome {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!(
                        "Execution timed out after {} seconds.",
                        request.timeout.as_secs()
                    ),
                    timed_out: true,
                    execution_time_ms: elapsed_ms,
                })
            }
        }
    }
}

/// Lossy UTF-8 decode truncated to at most `max_bytes` bytes of text, cut on
/// a character boundary, with a marker when anything was dropped.
fn truncate_utf8(data: &[u8], max_bytes: usize) -> String {
    let s = String::from_utf8_lossy(data);
    if s.len() <= max_bytes {
        return s.into_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [output truncated]", &s[..end])
}
