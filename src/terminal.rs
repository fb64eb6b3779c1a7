//! Local interactive shells on pseudo-terminals.

use crate::config::TerminalConfig;
use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::session::pty::{PtyHandles, pty_size, spawn_shell};
use crate::session::shell::LaunchPlan;
use crate::session::utf8::Utf8Chunker;
use crate::session::{OutputSink, SessionRecord, SessionRegistry, new_session_id, now_ms};
use async_trait::async_trait;
use portable_pty::{ChildKiller, MasterPty};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, timeout};

/// How long the exit watcher waits for buffered output after the child is
/// gone. A grandchild holding the pty open must not delay the exit event
/// forever.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TerminalCreated {
    pub id: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSummary {
    pub id: String,
    pub pid: u32,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at: u64,
}

pub struct TerminalSession {
    id: String,
    pid: u32,
    shell: PathBuf,
    created_at: u64,
    size: Mutex<(u16, u16)>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    killed: AtomicBool,
    /// Set once the child has been reaped, before trailing output drains.
    exited: AtomicBool,
}

impl TerminalSession {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn is_live(&self) -> bool {
        !self.killed.load(Ordering::SeqCst) && !self.exited.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut killer = self.killer.lock().expect("killer mutex poisoned");
        if let Err(err) = killer.kill() {
            // The process may already be gone.
            tracing::debug!(terminal_id = %self.id, pid = self.pid, error = %err, "Kill failed");
        }
    }

    fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        let master = self.master.lock().expect("master mutex poisoned");
        master.resize(pty_size(cols, rows)).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to resize pty").with_details(err.to_string())
        })?;
        *self.size.lock().expect("size mutex poisoned") = (cols, rows);
        Ok(())
    }

    fn summary(&self) -> TerminalSummary {
        let (cols, rows) = *self.size.lock().expect("size mutex poisoned");
        TerminalSummary {
            id: self.id.clone(),
            pid: self.pid,
            shell: self.shell.display().to_string(),
            cols,
            rows,
            created_at: self.created_at,
        }
    }
}

#[async_trait]
impl SessionRecord for TerminalSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn cleanup(&self) {
        self.terminate();
    }
}

pub struct TerminalManager {
    config: TerminalConfig,
    registry: Arc<SessionRegistry<TerminalSession>>,
}

impl TerminalManager {
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new("terminal")),
        }
    }

    /// Spawns a shell on a new pty. Output and the exit event go to
    /// `sink` on channels named after the returned id.
    pub async fn create_terminal(
        &self,
        cols: Option<u16>,
        rows: Option<u16>,
        sink: OutputSink,
    ) -> BridgeResult<TerminalCreated> {
        let cols = cols.filter(|c| *c > 0).unwrap_or(self.config.default_cols);
        let rows = rows.filter(|r| *r > 0).unwrap_or(self.config.default_rows);
        let config = self.config.clone();

        let handles = tokio::task::spawn_blocking(move || {
            spawn_shell(cols, rows, |skip| LaunchPlan::resolve(&config, skip))
        })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::SpawnFailed, "Failed to join spawn").with_details(err.to_string())
        })??;

        let PtyHandles {
            master,
            mut child,
            reader,
            writer,
            pid,
            shell,
        } = handles;

        let id = new_session_id();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let session = Arc::new(TerminalSession {
            id: id.clone(),
            pid,
            shell,
            created_at: now_ms(),
            size: Mutex::new((cols, rows)),
            input: input_tx,
            master: Mutex::new(master),
            killer: Mutex::new(child.clone_killer()),
            killed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        self.registry.register(id.clone(), session.clone()).await;

        spawn_writer(id.clone(), writer, input_rx);
        let drained = spawn_reader(id.clone(), reader, sink.clone());

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            let exit_code = match status {
                Ok(Ok(status)) => Some(status.exit_code()),
                Ok(Err(err)) => {
                    tracing::warn!(terminal_id = %session.id, error = %err, "Wait on shell failed");
                    None
                }
                Err(err) => {
                    tracing::warn!(terminal_id = %session.id, error = %err, "Wait task failed");
                    None
                }
            };
            session.exited.store(true, Ordering::SeqCst);
            if timeout(DRAIN_GRACE, drained).await.is_err() {
                tracing::debug!(terminal_id = %session.id, "Pty output still open after exit");
            }
            let signal = kill_signal(session.killed.load(Ordering::SeqCst));
            tracing::info!(terminal_id = %session.id, pid = session.pid, ?exit_code, ?signal, "Shell exited");
            sink.terminal_exit(&session.id, exit_code, signal);
            registry.remove(&session.id).await;
        });

        tracing::info!(terminal_id = %id, pid, cols, rows, "Terminal created");
        Ok(TerminalCreated { id, pid })
    }

    /// Queues `data` for the shell. Returns false for unknown ids.
    pub async fn write(&self, id: &str, data: impl Into<Vec<u8>>) -> bool {
        let Some(session) = self.registry.get(id).await.filter(|s| s.is_live()) else {
            tracing::warn!(terminal_id = %id, "Write to unknown or exited terminal dropped");
            return false;
        };
        session.input.send(data.into()).is_ok()
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) {
        let Some(session) = self.registry.get(id).await.filter(|s| s.is_live()) else {
            tracing::warn!(terminal_id = %id, "Resize of unknown or exited terminal dropped");
            return;
        };
        if cols == 0 || rows == 0 {
            tracing::debug!(terminal_id = %id, cols, rows, "Ignoring empty resize");
            return;
        }
        if let Err(err) = session.resize(cols, rows) {
            tracing::warn!(terminal_id = %id, error = %err, "Resize failed");
        }
    }

    /// Terminates the shell. True only when the id was live.
    pub async fn kill(&self, id: &str) -> bool {
        match self.registry.remove(id).await {
            Some(session) => {
                tracing::info!(terminal_id = %id, pid = session.pid, "Killing terminal");
                session.terminate();
                true
            }
            None => false,
        }
    }

    pub async fn kill_all(&self) -> usize {
        self.registry.remove_all().await
    }

    pub async fn list(&self) -> Vec<TerminalSummary> {
        let mut terminals: Vec<TerminalSummary> = self
            .registry
            .records()
            .await
            .iter()
            .map(|session| session.summary())
            .collect();
        terminals.sort_by_key(|summary| summary.created_at);
        terminals
    }
}

#[cfg(unix)]
fn kill_signal(killed: bool) -> Option<i32> {
    // portable-pty hangs up the child to kill it.
    killed.then_some(libc::SIGHUP)
}

#[cfg(not(unix))]
fn kill_signal(_killed: bool) -> Option<i32> {
    None
}

fn spawn_writer(
    id: String,
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    thread::spawn(move || {
        while let Some(data) = input.blocking_recv() {
            if let Err(err) = writer.write_all(&data).and_then(|_| writer.flush()) {
                tracing::debug!(terminal_id = %id, error = %err, "Pty write failed");
                break;
            }
        }
    });
}

fn spawn_reader(
    id: String,
    mut reader: Box<dyn Read + Send>,
    sink: OutputSink,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    thread::spawn(move || {
        let mut chunker = Utf8Chunker::default();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = chunker.push(&buf[..n]);
                    if !text.is_empty() {
                        sink.terminal_output(&id, text);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Linux reports EIO once the last slave descriptor closes.
                    tracing::trace!(terminal_id = %id, error = %err, "Pty read ended");
                    break;
                }
            }
        }
        let tail = chunker.finish();
        if !tail.is_empty() {
            sink.terminal_output(&id, tail);
        }
        let _ = done_tx.send(());
    });
    done_rx
}
