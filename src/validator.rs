//! Static pre-execution validation of candidate code.
//!
//! The candidate source is parsed and walked with the interpreter's own `ast`
//! module, inside a throwaway subprocess that gets the source on stdin and
//! prints violations as a JSON array. Nothing from the candidate code is ever
//! executed here; a non-empty violation list blocks job creation entirely.

use crate::errors::{Result, SandboxError};
use crate::policy::ValidationPolicy;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Outcome of static validation. `errors` is empty iff the code may proceed
/// to execution.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All violations joined into one display string.
    pub fn combined_message(&self) -> String {
        self.errors.join("; ")
    }
}

/// Runs the AST-level denylist check against candidate source text.
pub struct CodeValidator {
    python_path: PathBuf,
    policy: ValidationPolicy,
}

impl CodeValidator {
    pub fn new(python_path: PathBuf, policy: ValidationPolicy) -> Self {
        Self {
            python_path,
            policy,
        }
    }

    /// Validate `code` without executing it. Deterministic for a given
    /// source and policy.
    ///
    /// Returns `Err` only when the analyzer itself cannot run (interpreter
    /// missing or crashed) — never for problems found in the candidate code.
    pub async fn validate(&self, code: &str) -> Result<ValidationReport> {
        let analyzer = self.analyzer_program();

        let mut child = Command::new(&self.python_path)
            .arg("-c")
            .arg(&analyzer)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|_| SandboxError::PythonNotFound)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Internal("analyzer stdin unavailable".into()))?;
        stdin.write_all(code.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr, "code analyzer crashed");
            return Err(SandboxError::Internal(format!(
                "code analyzer failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let errors: Vec<String> = serde_json::from_str(stdout.trim())?;

        if errors.is_empty() {
            debug!("code validation passed");
        } else {
            warn!(count = errors.len(), "code validation failed");
        }
        Ok(ValidationReport { errors })
    }

    /// The analyzer script with the policy sets interpolated.
    fn analyzer_program(&self) -> String {
        format!(
            r#"
import ast
import json
import sys

BLOCKED_MODULES = {blocked_modules}
BLOCKED_CALLS = {blocked_calls}
BLOCKED_ATTRIBUTES = {blocked_attributes}

source = sys.stdin.read()
errors = []

try:
    tree = ast.parse(source, filename='<candidate>')
except SyntaxError as exc:
    print(json.dumps([f"Syntax error: {{exc}}"]))
    sys.exit(0)

for node in ast.walk(tree):
    if isinstance(node, ast.Import):
        for alias in node.names:
            if alias.name.split('.')[0] in BLOCKED_MODULES:
                errors.append(f"Blocked import: '{{alias.name}}'")
    elif isinstance(node, ast.ImportFrom):
        module = node.module or ''
        if module.split('.')[0] in BLOCKED_MODULES:
            errors.append(f"Blocked import from: '{{module}}'")
    elif isinstance(node, ast.Call):
        if isinstance(node.func, ast.Name) and node.func.id in BLOCKED_CALLS:
            errors.append(f"Blocked call: '{{node.func.id}}()'")
    elif isinstance(node, ast.Attribute):
        if node.attr in BLOCKED_ATTRIBUTES:
            errors.append(f"Blocked attribute access: '.{{node.attr}}'")

print(json.dumps(errors))
"#,
            blocked_modules = ValidationPolicy::as_python_set(&self.policy.blocked_modules),
            blocked_calls = ValidationPolicy::as_python_set(&self.policy.blocked_calls),
            blocked_attributes = ValidationPolicy::as_python_set(&self.policy.blocked_attributes),
        )
    }
}
