//! Security policy: module denylist, blocked builtins/attributes for static
//! validation, and the builtin allowlist injected into the launcher script.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Builtin names left available to candidate code. Everything else is removed
/// from its `__builtins__` before the code runs. `__import__` is re-added by
/// the launcher so allowlisted imports still resolve.
pub const SAFE_BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "bytes", "dict", "divmod", "enumerate",
    "filter", "float", "format", "frozenset", "getattr", "hasattr", "hash",
    "hex", "int", "isinstance", "issubclass", "iter", "len", "list", "map",
    "max", "min", "next", "object", "oct", "ord", "pow", "print", "range",
    "repr", "reversed", "round", "set", "setattr", "slice", "sorted", "str",
    "sum", "tuple", "type", "zip",
];

/// What the static validator rejects.
///
/// This is a cheap pre-filter, not the isolation boundary: the launcher's
/// restricted builtins and the subprocess sandbox still apply to anything
/// that slips past it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Root module names whose import (plain or `from`-style) is rejected.
    pub blocked_modules: HashSet<String>,
    /// Builtin names whose direct call is rejected.
    pub blocked_calls: HashSet<String>,
    /// Attribute names whose access is rejected (dunder escape hatches).
    pub blocked_attributes: HashSet<String>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            blocked_modules: [
                // process spawning
                "subprocess",
                "multiprocessing",
                // networking / HTTP clients
                "socket",
                "requests",
                "urllib",
                "http",
                // dynamic import machinery
                "importlib",
                // low-level FFI
                "ctypes",
                // interpreter / process control
                "sys",
                "signal",
                "resource",
                "pty",
                "tty",
                "termios",
                "fcntl",
                "grp",
                "pwd",
                "platform",
                "sysconfig",
                "site",
                "builtins",
                "gc",
                "weakref",
                "inspect",
                "dis",
                "tokenize",
                "ast",
                "code",
                "codeop",
                "pdb",
                "faulthandler",
                // filesystem mutation outside the I/O contract
                "shutil",
                "tempfile",
                // serialization that executes code on load
                "pickle",
                "shelve",
                // concurrency that could outlive the sandbox
                "threading",
                "concurrent",
                "asyncio",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            blocked_calls: ["exec", "eval", "compile", "__import__", "open"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            blocked_attributes: [
                "__class__",
                "__bases__",
                "__subclasses__",
                "__globals__",
                "__builtins__",
                "__code__",
                "__closure__",
                "__func__",
                "__self__",
                "__dict__",
                "__module__",
                "__qualname__",
                "mro",
                "__mro__",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl ValidationPolicy {
    /// Render a set as a Python set literal for interpolation into generated
    /// scripts.
    pub(crate) fn as_python_set(items: &HashSet<String>) -> String {
        if items.is_empty() {
            return "set()".to_string();
        }
        let mut sorted: Vec<&String> = items.iter().collect();
        sorted.sort();
        format!(
            "{{{}}}",
            sorted
                .iter()
                .map(|s| format!("'{}'", s))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_blocks_the_dangerous_modules() {
        let policy = ValidationPolicy::default();
        for module in ["subprocess", "socket", "ctypes", "pickle", "importlib"] {
            assert!(policy.blocked_modules.contains(module), "{module}");
        }
        // The data stack must stay usable.
        for module in ["pandas", "numpy", "os", "pathlib", "datetime", "json"] {
            assert!(!policy.blocked_modules.contains(module), "{module}");
        }
    }

    #[test]
    fn safe_builtins_exclude_code_execution() {
        for name in ["exec", "eval", "compile", "open", "__import__"] {
            assert!(!SAFE_BUILTINS.contains(&name), "{name}");
        }
        assert!(SAFE_BUILTINS.contains(&"print"));
        assert!(SAFE_BUILTINS.contains(&"len"));
    }

    #[test]
    fn python_set_rendering() {
        let mut set = HashSet::new();
        assert_eq!(ValidationPolicy::as_python_set(&set), "set()");
        set.insert("b".to_string());
        set.insert("a".to_string());
        assert_eq!(ValidationPolicy::as_python_set(&set), "{'a', 'b'}");
    }
}
