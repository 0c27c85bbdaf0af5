//! Spawns the assistant CLI and bridges its stream-json protocol.
//!
//! stdout JSONL becomes a stream of [`SdkMessage`]s; permission responses and
//! interrupt requests are written back over stdin. stderr is collected so a
//! failed process can report a useful error.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{
    interrupt_frame, permission_response_frame, user_prompt_frame, PermissionResult, QueryOptions,
    SdkMessage,
};

/// Handle for writing control frames to the running CLI. Clonable so the
/// permission gate can answer from a spawned task.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<String>,
    next_id: Arc<AtomicU64>,
}

impl ControlHandle {
    pub fn respond_permission(&self, request_id: &str, result: &PermissionResult) {
        let frame = permission_response_frame(request_id, result);
        let _ = self.tx.send(frame.to_string());
    }

    /// Ask the CLI to stop. Returns false when stdin is already gone, in
    /// which case the caller falls back to killing the process.
    pub fn interrupt(&self) -> bool {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx.send(interrupt_frame(id).to_string()).is_ok()
    }
}

/// A running assistant query.
pub struct SdkQuery {
    rx: mpsc::UnboundedReceiver<SdkMessage>,
    child: Child,
    control: ControlHandle,
    stderr: Arc<Mutex<String>>,
}

impl SdkQuery {
    /// Next event, or `None` when the stream ends.
    pub async fn next_message(&mut self) -> Option<SdkMessage> {
        self.rx.recv().await
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    /// Hard-stop fallback when the interrupt control frame cannot be sent.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "kill after interrupt fallback failed");
        }
    }

    /// Reap the process. Returns the captured stderr when it exited nonzero.
    pub async fn exit_error(&mut self) -> Option<String> {
        match self.child.wait().await {
            Ok(status) if status.success() => None,
            Ok(status) => {
                let text = self.stderr.lock().unwrap().trim().to_string();
                if text.is_empty() {
                    Some(format!("claude exited with {status}"))
                } else {
                    Some(text)
                }
            }
            Err(e) => Some(format!("failed to reap claude process: {e}")),
        }
    }
}

/// Spawn one query against the CLI.
pub fn spawn_query(prompt: &str, options: &QueryOptions) -> anyhow::Result<SdkQuery> {
    let mut args: Vec<String> = vec![
        "--print".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--input-format".into(),
        "stream-json".into(),
        "--include-partial-messages".into(),
        "--verbose".into(),
        "--permission-prompt-tool".into(),
        "stdio".into(),
        "--permission-mode".into(),
        "default".into(),
    ];

    if let Some(ref model) = options.model {
        args.push("--model".into());
        args.push(model.clone());
    }
    if let Some(ref append) = options.append_system_prompt {
        args.push("--append-system-prompt".into());
        args.push(append.clone());
    }
    if !options.allowed_tools.is_empty() {
        args.push("--allowedTools".into());
        args.push(options.allowed_tools.join(","));
    }
    if let Some(ref resume) = options.resume {
        args.push("--resume".into());
        args.push(resume.clone());
    } else if options.continue_conversation {
        args.push("--continue".into());
    }
    if let Some(ref agents) = options.agents {
        args.push("--agents".into());
        args.push(serde_json::to_string(agents)?);
    }

    debug!(cwd = %options.cwd, "spawning claude {}", args.join(" "));

    let mut child = Command::new("claude")
        .args(&args)
        .current_dir(&options.cwd)
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take().expect("child stdout is piped");
    let stdin = child.stdin.take().expect("child stdin is piped");

    // stderr collector, for post-mortem error text.
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    if let Some(stderr) = child.stderr.take() {
        let buf = stderr_buf.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                warn!("[claude-stderr] {line}");
                let mut buf = buf.lock().unwrap();
                if !buf.is_empty() {
                    buf.push('\n');
                }
                buf.push_str(&line);
            }
        });
    }

    // Writer task: prompt first, then control frames as they come.
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
    let _ = stdin_tx.send(user_prompt_frame(prompt).to_string());
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = stdin_rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.write_all(b"\n").await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });

    // Reader task: JSONL to SdkMessage.
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<SdkMessage>(trimmed) {
                Ok(msg) => {
                    if msg_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "unparseable sdk line: {trimmed}"),
            }
        }
    });

    Ok(SdkQuery {
        rx: msg_rx,
        child,
        control: ControlHandle {
            tx: stdin_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
        stderr: stderr_buf,
    })
}
