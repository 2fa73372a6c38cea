//! Dedicated writer thread for the newline-delimited JSON event log.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use super::events::RunEvent;
use crate::error::{ArmadaError, Result};

enum WriteCommand {
    Append(Box<RunEvent>),
    Shutdown,
}

/// Append-only JSONL event log. Emission is fire-and-forget; serialization
/// and IO happen on a dedicated thread so hot paths never block on disk.
pub struct EventLog {
    tx: Sender<WriteCommand>,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (tx, rx) = mpsc::channel::<WriteCommand>();

        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("event-log".into())
            .spawn(move || Self::process_commands(file, rx, &thread_path))
            .map_err(|e| ArmadaError::EventLog(format!("Failed to spawn writer thread: {}", e)))?;

        Ok(Self {
            tx,
            handle: Some(handle),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emit(&self, event: RunEvent) {
        if self.tx.send(WriteCommand::Append(Box::new(event))).is_err() {
            warn!("Event log writer is gone; event dropped");
        }
    }

    fn process_commands(file: File, rx: Receiver<WriteCommand>, path: &Path) {
        let mut writer = BufWriter::new(file);
        for cmd in rx {
            match cmd {
                WriteCommand::Append(event) => match serde_json::to_string(&*event) {
                    Ok(line) => {
                        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush())
                        {
                            error!(path = %path.display(), error = %e, "Event log write failed");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Event serialization failed");
                    }
                },
                WriteCommand::Shutdown => {
                    debug!("Event log writer received shutdown");
                    break;
                }
            }
        }
        let _ = writer.flush();
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        let _ = self.tx.send(WriteCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Event log writer thread panicked");
            }
        }
    }
}
