use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::payload::WorkerPayload;
use crate::error::{ArmadaError, Result};
use crate::queue::Handoff;

/// Cap on retained stderr; workers can be chatty and stderr is only kept for
/// diagnostics.
const STDERR_CAP_BYTES: usize = 64 * 1024;

static WORKER_LINE_PATTERN: OnceLock<Regex> = OnceLock::new();
static TOOL_CALLS_PATTERN: OnceLock<Regex> = OnceLock::new();

fn worker_line_pattern() -> &'static Regex {
    WORKER_LINE_PATTERN
        .get_or_init(|| Regex::new(r"^\[worker:([^\]]+)\] ?(.*)$").unwrap())
}

fn tool_calls_pattern() -> &'static Regex {
    TOOL_CALLS_PATTERN.get_or_init(|| Regex::new(r"Tool calls: (\d+)").unwrap())
}

/// One classified line of interim worker stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    /// `[spawn] <text>` sandbox-lifecycle progress.
    Spawn(String),
    /// `[worker:<id>] <text>` in-sandbox agent progress. `tool_calls` is
    /// populated when the text carries a `Tool calls: <n>` marker.
    Progress {
        task_id: String,
        text: String,
        tool_calls: Option<u64>,
    },
    /// Anything else.
    Raw(String),
}

impl WorkerLine {
    pub fn classify(line: &str) -> Self {
        if let Some(text) = line.strip_prefix("[spawn] ") {
            return Self::Spawn(text.to_string());
        }
        if let Some(caps) = worker_line_pattern().captures(line) {
            let text = caps[2].to_string();
            let tool_calls = tool_calls_pattern()
                .captures(&text)
                .and_then(|c| c[1].parse().ok());
            return Self::Progress {
                task_id: caps[1].to_string(),
                text,
                tool_calls,
            };
        }
        Self::Raw(line.to_string())
    }
}

pub type LineSink = Arc<dyn Fn(WorkerLine) + Send + Sync>;

/// Executes a single task in an ephemeral sandbox and returns its handoff.
/// The dispatcher supplies the wall-clock timeout and a sink for interim
/// stdout lines.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        payload: &WorkerPayload,
        timeout: Duration,
        lines: LineSink,
    ) -> Result<Handoff>;
}

/// Default runner: spawns the configured executable in its own process
/// group, writes the payload JSON to stdin, streams stdout line-buffered,
/// and parses the last stdout line as the handoff. Non-zero exit is fine as
/// long as the handoff line was printed.
pub struct ProcessSandboxRunner {
    command: String,
    args: Vec<String>,
}

impl ProcessSandboxRunner {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn kill_process_group(child: &mut Child, pgid: Option<u32>) {
        #[cfg(unix)]
        if let Some(pgid) = pgid {
            // The child leads its own process group; negative pid targets
            // the whole group so sandbox-spawned descendants die too.
            unsafe {
                libc::kill(-(pgid as i32), libc::SIGKILL);
            }
        }
        let _ = child.start_kill();
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandboxRunner {
    async fn run(
        &self,
        payload: &WorkerPayload,
        timeout: Duration,
        lines: LineSink,
    ) -> Result<Handoff> {
        let task_id = payload.task.id.clone();
        let payload_json = serde_json::to_string(payload)?;

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ArmadaError::Dispatch {
            task_id: task_id.clone(),
            message: format!("failed to start sandbox runner '{}': {}", self.command, e),
        })?;
        let pgid = child.id();

        let mut stdin = child.stdin.take().ok_or_else(|| ArmadaError::Dispatch {
            task_id: task_id.clone(),
            message: "sandbox runner stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ArmadaError::Dispatch {
            task_id: task_id.clone(),
            message: "sandbox runner stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take();

        // Collect stderr concurrently so the child never blocks on a full
        // pipe; retained only up to the cap.
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if collected.len() < STDERR_CAP_BYTES {
                        collected.push_str(&line);
                        collected.push('\n');
                    }
                }
            }
            collected
        });

        stdin
            .write_all(payload_json.as_bytes())
            .await
            .map_err(|e| ArmadaError::Dispatch {
                task_id: task_id.clone(),
                message: format!("failed to write payload: {}", e),
            })?;
        drop(stdin);

        // Stream stdout retaining only the last complete line; interior
        // lines go to the sink.
        let read_loop = async {
            let mut reader = BufReader::new(stdout).lines();
            let mut last_line: Option<String> = None;
            while let Some(line) = reader.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(prev) = last_line.replace(line) {
                    lines(WorkerLine::classify(&prev));
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, last_line))
        };

        let outcome = tokio::time::timeout(timeout, read_loop).await;

        let (status, last_line) = match outcome {
            Err(_) => {
                Self::kill_process_group(&mut child, pgid);
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(ArmadaError::WorkerTimeout {
                    task_id,
                    timeout_secs: timeout.as_secs(),
                });
            }
            Ok(Err(e)) => {
                Self::kill_process_group(&mut child, pgid);
                return Err(ArmadaError::Dispatch {
                    task_id,
                    message: format!("stdout stream error: {}", e),
                });
            }
            Ok(Ok(pair)) => pair,
        };

        let stderr_text = stderr_task.await.unwrap_or_default();
        if stderr_text.to_lowercase().contains("error") {
            warn!(
                task_id = %task_id,
                stderr = %crate::utils::truncate_str(&stderr_text, 500),
                "Sandbox runner reported errors on stderr"
            );
        }

        let last_line = last_line.ok_or_else(|| ArmadaError::Dispatch {
            task_id: task_id.clone(),
            message: "sandbox runner produced no output".to_string(),
        })?;

        match serde_json::from_str::<Handoff>(&last_line) {
            Ok(handoff) => {
                debug!(
                    task_id = %task_id,
                    status = %handoff.status,
                    exit = ?status.code(),
                    "Handoff received from sandbox"
                );
                Ok(handoff)
            }
            Err(e) => Err(ArmadaError::InvalidHandoff {
                task_id,
                message: format!(
                    "last stdout line is not a handoff ({}): {}",
                    e,
                    crate::utils::truncate_str(&last_line, 200)
                ),
            }),
        }
    }
}
