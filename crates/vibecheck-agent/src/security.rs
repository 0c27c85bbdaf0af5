//! Path-based tool gating.
//!
//! Every filesystem-touching tool call is checked against the trusted-path
//! set before the assistant may proceed. Untrusted paths suspend the tool
//! call on an approval round-trip with the UI. Trust lives for the process
//! lifetime only.

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vibecheck_shared::labels;
use vibecheck_shared::protocol::AgentMessage;

use crate::connection::Outbound;
use crate::sdk::types::PermissionResult;

/// Read-only shell commands that never need approval, even when their text
/// mentions untrusted paths.
const SAFE_COMMANDS: &[&str] = &[
    "nvidia-smi",
    "df",
    "free",
    "uptime",
    "whoami",
    "hostname",
    "cat /proc/cpuinfo",
    "cat /proc/meminfo",
    "ps",
    "top -bn1",
    "ls",
    "pwd",
    "date",
    "which",
    "echo",
    "git status",
    "git log",
    "git diff",
];

/// Resolve `.`/`..` components lexically, without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                } else {
                    parts.push(component);
                }
            }
            _ => parts.push(component),
        }
    }
    parts.iter().collect()
}

/// Make a path absolute against `base`, then normalize.
fn resolve(path: &str, base: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        normalize(p)
    } else {
        normalize(&base.join(p))
    }
}

/// Insertion-only set of trusted absolute path prefixes.
pub struct TrustedPathSet {
    paths: Vec<PathBuf>,
}

impl TrustedPathSet {
    pub fn new(seed: PathBuf) -> Self {
        Self {
            paths: vec![normalize(&seed)],
        }
    }

    pub fn add(&mut self, path: PathBuf) {
        let path = normalize(&path);
        if !self.paths.contains(&path) {
            info!(path = %path.display(), "trusted path added");
            self.paths.push(path);
        }
    }

    /// A path is trusted iff it equals a member or is a descendant of one
    /// (prefix match up to a path separator; `/a/bc` is not under `/a/b`).
    pub fn is_trusted(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.paths
            .iter()
            .any(|trusted| path == *trusted || path.starts_with(trusted))
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.paths.clone()
    }
}

/// Paths a tool invocation would touch, by tool.
pub fn extract_paths(tool: &str, input: &Value, work_dir: &Path) -> Vec<PathBuf> {
    match tool {
        "Read" | "Write" | "Edit" => input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(|p| vec![resolve(p, work_dir)])
            .unwrap_or_default(),
        "Glob" | "Grep" => input
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| vec![resolve(p, work_dir)])
            .unwrap_or_default(),
        "Bash" => input
            .get("command")
            .and_then(|v| v.as_str())
            .map(|c| extract_command_paths(c, work_dir))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Heuristic extraction of paths mentioned in free-form shell text.
///
/// Absolute tokens and explicit `./`/`../` tokens are taken; bare extension
/// tokens like `.png` are skipped. This is defense in depth on top of the
/// per-tool `file_path`/`path` checks and cannot be sound.
fn extract_command_paths(command: &str, work_dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for raw in command.split_whitespace() {
        let token = raw
            .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '(' | ')' | ';' | '|' | '&' | ','));
        if token.len() < 2 {
            continue;
        }
        let candidate = if token.starts_with('/') {
            Some(resolve(token, work_dir))
        } else if token.starts_with("./") || token.starts_with("../") {
            Some(resolve(token, work_dir))
        } else {
            None
        };
        if let Some(path) = candidate {
            if !out.contains(&path) {
                out.push(path);
            }
        }
    }
    out
}

/// Whether a Bash command, trimmed, is one of the safe read-only commands or
/// starts with one followed by a space.
pub fn is_safe_command(command: &str) -> bool {
    let trimmed = command.trim();
    SAFE_COMMANDS.iter().any(|safe| {
        trimmed == *safe
            || (trimmed.len() > safe.len()
                && trimmed.starts_with(safe)
                && trimmed.as_bytes()[safe.len()] == b' ')
    })
}

/// One in-flight approval round-trip.
struct PendingApproval {
    resolver: oneshot::Sender<PermissionResult>,
    tool: String,
    input: Value,
}

/// Gates tool calls on the trusted-path set and the approval protocol.
///
/// The wire protocol carries no approval correlation id; at most one
/// approval can be pending, which the single-flight execution guarantees.
pub struct SecurityMediator {
    work_dir: PathBuf,
    trusted: Mutex<TrustedPathSet>,
    pending: Mutex<Option<PendingApproval>>,
    outbound: Outbound,
}

impl SecurityMediator {
    pub fn new(work_dir: PathBuf, outbound: Outbound) -> Self {
        let trusted = TrustedPathSet::new(work_dir.clone());
        Self {
            work_dir,
            trusted: Mutex::new(trusted),
            pending: Mutex::new(None),
            outbound,
        }
    }

    pub fn add_trusted_path(&self, path: &str) {
        let resolved = resolve(path, &self.work_dir);
        self.trusted.lock().unwrap().add(resolved);
    }

    /// Permission callback handed to the assistant SDK.
    ///
    /// Returns immediately for trusted or safe calls; otherwise parks the
    /// caller until the UI answers or the query aborts.
    pub async fn can_use_tool(
        &self,
        tool: &str,
        input: &Value,
        abort: CancellationToken,
    ) -> PermissionResult {
        let untrusted: Vec<PathBuf> = {
            let trusted = self.trusted.lock().unwrap();
            extract_paths(tool, input, &self.work_dir)
                .into_iter()
                .filter(|p| !trusted.is_trusted(p))
                .collect()
        };

        if untrusted.is_empty() {
            return PermissionResult::allow(input);
        }

        if tool == "Bash" {
            if let Some(command) = input.get("command").and_then(|v| v.as_str()) {
                if is_safe_command(command) {
                    debug!(command, "safe command auto-allowed");
                    return PermissionResult::allow(input);
                }
            }
        }

        let rx = self.request_approval(tool, input, &untrusted);

        tokio::select! {
            decision = rx => decision.unwrap_or_else(|_| {
                PermissionResult::deny(labels::APPROVAL_ABORTED)
            }),
            _ = abort.cancelled() => {
                // Clear the slot so a later approval frame is a no-op.
                self.pending.lock().unwrap().take();
                PermissionResult::deny(labels::APPROVAL_ABORTED)
            }
        }
    }

    fn request_approval(
        &self,
        tool: &str,
        input: &Value,
        untrusted: &[PathBuf],
    ) -> oneshot::Receiver<PermissionResult> {
        let (tx, rx) = oneshot::channel();

        let input_text = serde_json::to_string(input).unwrap_or_default();
        let summary: String = input_text.chars().take(200).collect();
        let paths: Vec<String> = untrusted
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        info!(tool, ?paths, "approval required");

        {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                warn!("replacing an unresolved pending approval");
            }
            *pending = Some(PendingApproval {
                resolver: tx,
                tool: tool.to_string(),
                input: input.clone(),
            });
        }

        self.outbound.send(&AgentMessage::ApprovalRequired {
            paths,
            message: format!("{tool}: {summary}"),
        });

        rx
    }

    /// Resolve the pending approval. Idempotent: a second call (or a call
    /// with nothing pending) does nothing.
    pub fn resolve_approval(&self, approved: bool, permanent: bool) {
        let Some(pending) = self.pending.lock().unwrap().take() else {
            debug!("approval frame with nothing pending, ignored");
            return;
        };

        if approved && permanent {
            let paths = extract_paths(&pending.tool, &pending.input, &self.work_dir);
            let mut trusted = self.trusted.lock().unwrap();
            for path in paths {
                trusted.add(path);
            }
        }

        let result = if approved {
            PermissionResult::allow(&pending.input)
        } else {
            PermissionResult::deny(labels::APPROVAL_DENIED)
        };
        let _ = pending.resolver.send(result);
    }

    #[cfg(test)]
    fn trusted_snapshot(&self) -> Vec<PathBuf> {
        self.trusted.lock().unwrap().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descendant_match_respects_separator() {
        let set = TrustedPathSet::new(PathBuf::from("/a/b"));
        assert!(set.is_trusted(Path::new("/a/b")));
        assert!(set.is_trusted(Path::new("/a/b/c")));
        assert!(!set.is_trusted(Path::new("/a/bc")));
        assert!(!set.is_trusted(Path::new("/a")));
    }

    #[test]
    fn add_is_idempotent() {
        let mut set = TrustedPathSet::new(PathBuf::from("/work"));
        set.add(PathBuf::from("/other"));
        set.add(PathBuf::from("/other"));
        assert_eq!(set.snapshot().len(), 2);
        assert!(set.is_trusted(Path::new("/other/deep/file.txt")));
    }

    #[test]
    fn normalize_resolves_dotdot() {
        let set = TrustedPathSet::new(PathBuf::from("/work"));
        assert!(set.is_trusted(Path::new("/work/sub/../file.txt")));
        assert!(!set.is_trusted(Path::new("/work/../etc/passwd")));
    }

    #[test]
    fn file_tools_extract_file_path() {
        let paths = extract_paths(
            "Write",
            &json!({"file_path": "/outside/x.txt"}),
            Path::new("/work"),
        );
        assert_eq!(paths, vec![PathBuf::from("/outside/x.txt")]);
    }

    #[test]
    fn relative_file_path_resolves_against_work_dir() {
        let paths = extract_paths(
            "Read",
            &json!({"file_path": "src/main.rs"}),
            Path::new("/work"),
        );
        assert_eq!(paths, vec![PathBuf::from("/work/src/main.rs")]);
    }

    #[test]
    fn bash_extracts_absolute_and_relative_tokens() {
        let paths = extract_paths(
            "Bash",
            &json!({"command": "cp /etc/hosts ./backup/hosts && rm -f notes.txt"}),
            Path::new("/work"),
        );
        assert!(paths.contains(&PathBuf::from("/etc/hosts")));
        assert!(paths.contains(&PathBuf::from("/work/backup/hosts")));
        // Bare filenames are not treated as paths.
        assert!(!paths.contains(&PathBuf::from("/work/notes.txt")));
    }

    #[test]
    fn unknown_tools_touch_no_paths() {
        assert!(extract_paths("WebSearch", &json!({"query": "/x"}), Path::new("/w")).is_empty());
    }

    #[test]
    fn safe_command_matching() {
        assert!(is_safe_command("ls"));
        assert!(is_safe_command("  ls -la /etc"));
        assert!(is_safe_command("git status"));
        assert!(is_safe_command("git log --oneline"));
        assert!(!is_safe_command("lsof"));
        assert!(!is_safe_command("git push"));
        assert!(!is_safe_command("rm -rf /"));
    }

    fn mediator() -> SecurityMediator {
        SecurityMediator::new(PathBuf::from("/work"), Outbound::detached())
    }

    #[tokio::test]
    async fn trusted_write_is_allowed_without_approval() {
        let m = mediator();
        let result = m
            .can_use_tool(
                "Write",
                &json!({"file_path": "/work/a.txt"}),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, PermissionResult::Allow { .. }));
    }

    #[tokio::test]
    async fn approval_flow_allows_and_trusts_permanently() {
        let m = std::sync::Arc::new(mediator());

        let m2 = m.clone();
        let gate = tokio::spawn(async move {
            m2.can_use_tool("Write", &json!({"file_path": "/outside/x.txt"}), CancellationToken::new())
                .await
        });

        // Wait until the pending slot is occupied, then approve permanently.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if m.pending.lock().unwrap().is_some() {
                break;
            }
        }
        m.resolve_approval(true, true);

        let result = gate.await.unwrap();
        assert!(matches!(result, PermissionResult::Allow { .. }));
        // The raw extracted path itself is now trusted.
        assert!(m.trusted_snapshot().contains(&PathBuf::from("/outside/x.txt")));
    }

    #[tokio::test]
    async fn abort_resolves_as_deny() {
        let m = std::sync::Arc::new(mediator());
        let token = CancellationToken::new();

        let m2 = m.clone();
        let t2 = token.clone();
        let gate = tokio::spawn(async move {
            m2.can_use_tool("Write", &json!({"file_path": "/outside/x.txt"}), t2)
                .await
        });

        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if m.pending.lock().unwrap().is_some() {
                break;
            }
        }
        token.cancel();

        match gate.await.unwrap() {
            PermissionResult::Deny { message } => assert_eq!(message, labels::APPROVAL_ABORTED),
            other => panic!("expected deny, got {other:?}"),
        }
        // A late approval frame is a no-op.
        m.resolve_approval(true, true);
        assert!(!m.trusted_snapshot().contains(&PathBuf::from("/outside/x.txt")));
    }

    #[test]
    fn resolve_twice_is_noop() {
        let m = mediator();
        m.resolve_approval(true, false);
        m.resolve_approval(false, false);
    }
}
