//! Tool-call policy evaluation. Rules are evaluated in order; the first
//! rule that blocks wins, short-circuiting the rest.

use std::path::{Path, PathBuf};

use serde_json::Value;

pub trait PolicyRule: Send + Sync {
    fn id(&self) -> &'static str;

    /// `Some(reason)` blocks the call; `None` lets it proceed to the next rule.
    fn evaluate(&self, tool_name: &str, args: &Value, worktree_path: &Path) -> Option<String>;
}

pub struct PolicyVerdict {
    pub policy_id: Option<&'static str>,
    pub blocked: bool,
    pub reason: Option<String>,
}

pub fn evaluate(rules: &[Box<dyn PolicyRule>], tool_name: &str, args: &Value, worktree_path: &Path) -> PolicyVerdict {
    for rule in rules {
        if let Some(reason) = rule.evaluate(tool_name, args, worktree_path) {
            return PolicyVerdict {
                policy_id: Some(rule.id()),
                blocked: true,
                reason: Some(reason),
            };
        }
    }
    PolicyVerdict {
        policy_id: None,
        blocked: false,
        reason: None,
    }
}

pub fn built_in_rules() -> Vec<Box<dyn PolicyRule>> {
    vec![
        Box::new(WorktreeBoundary),
        Box::new(DotGitProtection),
        Box::new(SensitiveFileWrite),
        Box::new(ShellInjection),
    ]
}

pub fn built_in_catalog() -> Vec<(&'static str, &'static str)> {
    vec![
        ("worktree_boundary", "Tool file paths must resolve inside the run's worktree"),
        ("dotgit_protection", "Tool calls may not touch .git"),
        ("sensitive_file_write", "Tool calls may not write known-sensitive files"),
        ("shell_injection", "Shell tool arguments may not contain shell metacharacters"),
    ]
}

fn path_args(args: &Value) -> Vec<String> {
    let mut out = Vec::new();
    for key in ["path", "file_path", "destination"] {
        if let Some(p) = args.get(key).and_then(|v| v.as_str()) {
            out.push(p.to_string());
        }
    }
    out
}

fn resolve_within(worktree_path: &Path, candidate: &str) -> Option<PathBuf> {
    let joined = if Path::new(candidate).is_absolute() {
        PathBuf::from(candidate)
    } else {
        worktree_path.join(candidate)
    };
    Some(joined)
}

struct WorktreeBoundary;

impl PolicyRule for WorktreeBoundary {
    fn id(&self) -> &'static str {
        "worktree_boundary"
    }

    fn evaluate(&self, _tool_name: &str, args: &Value, worktree_path: &Path) -> Option<String> {
        for candidate in path_args(args) {
            if candidate.contains("..") {
                return Some(format!("path '{candidate}' escapes the worktree via '..'"));
            }
            if let Some(resolved) = resolve_within(worktree_path, &candidate)
                && !resolved.starts_with(worktree_path)
            {
                return Some(format!("path '{candidate}' resolves outside the worktree"));
            }
        }
        None
    }
}

struct DotGitProtection;

impl PolicyRule for DotGitProtection {
    fn id(&self) -> &'static str {
        "dotgit_protection"
    }

    fn evaluate(&self, _tool_name: &str, args: &Value, _worktree_path: &Path) -> Option<String> {
        for candidate in path_args(args) {
            if candidate.split(['/', '\\']).any(|segment| segment == ".git") {
                return Some(format!("path '{candidate}' touches .git"));
            }
        }
        None
    }
}

const SENSITIVE_BASENAMES: &[&str] = &[".env", "id_rsa", "id_ed25519", "credentials.json", ".npmrc", ".netrc"];

struct SensitiveFileWrite;

impl PolicyRule for SensitiveFileWrite {
    fn id(&self) -> &'static str {
        "sensitive_file_write"
    }

    fn evaluate(&self, tool_name: &str, args: &Value, _worktree_path: &Path) -> Option<String> {
        if !tool_name.contains("write") && !tool_name.contains("edit") {
            return None;
        }
        for candidate in path_args(args) {
            let basename = Path::new(&candidate).file_name().and_then(|n| n.to_str()).unwrap_or("");
            if SENSITIVE_BASENAMES.contains(&basename) || basename.ends_with(".pem") || basename.ends_with(".key") {
                return Some(format!("'{candidate}' is a sensitive file"));
            }
        }
        None
    }
}

const SHELL_METACHARACTERS: &[&str] = &[";", "&&", "||", "$(", "`", "|", "\n", ">", "<"];

struct ShellInjection;

impl PolicyRule for ShellInjection {
    fn id(&self) -> &'static str {
        "shell_injection"
    }

    fn evaluate(&self, tool_name: &str, args: &Value, _worktree_path: &Path) -> Option<String> {
        if tool_name != "shell" && tool_name != "run_command" {
            return None;
        }
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return None;
        };
        for meta in SHELL_METACHARACTERS {
            if command.contains(meta) {
                return Some(format!("command contains disallowed metacharacter '{meta}'"));
            }
        }
        None
    }
}
