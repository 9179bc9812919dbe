//! One terminal session bridged to one client connection.
//!
//! A [`Turn`] owns the PTY, the process and the connection. PTY output is
//! pumped to the client by a background task started with the session;
//! client input is pumped to the PTY by [`Turn::loop_read`], driven by the
//! caller. Either side failing closes everything.

use super::pty::PtyHandle;
use super::recording::{ChunkKind, SharedRecorder};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webssh_core::{
    parse_frame, ChildProcess, ClientFrame, MessageConnection, MessageKind, Terminal,
    WebsshError, WebsshResult,
};

/// Maximum bytes read from the PTY per output message.
pub const OUTPUT_CHUNK_SIZE: usize = 4096;

/// What to run on a new session's PTY.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Program to run; `None` means the user's shell.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: HashMap<String, String>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            cols: 80,
            rows: 24,
            env: HashMap::new(),
        }
    }
}

/// A running terminal session.
pub struct Turn {
    id: String,
    pty: Arc<dyn Terminal>,
    process: Arc<dyn ChildProcess>,
    conn: Arc<dyn MessageConnection>,
    recorder: Option<SharedRecorder>,
    closed: AtomicBool,
}

impl Turn {
    /// Spawn the command on a fresh PTY and start pumping its output to `conn`.
    ///
    /// On failure no session exists and the PTY is released; `conn` is left
    /// to the caller.
    pub fn spawn(
        id: String,
        conn: Arc<dyn MessageConnection>,
        opts: &SpawnOptions,
        recorder: Option<SharedRecorder>,
    ) -> WebsshResult<Arc<Self>> {
        let env = (!opts.env.is_empty()).then_some(&opts.env);
        let pty = Arc::new(PtyHandle::spawn(
            opts.command.as_deref(),
            &opts.args,
            opts.cols,
            opts.rows,
            env,
        )?);
        Ok(Self::start(id, pty.clone(), pty, conn, recorder))
    }

    /// Assemble a session from existing capabilities and start the output pump.
    pub fn start(
        id: String,
        pty: Arc<dyn Terminal>,
        process: Arc<dyn ChildProcess>,
        conn: Arc<dyn MessageConnection>,
        recorder: Option<SharedRecorder>,
    ) -> Arc<Self> {
        let turn = Arc::new(Self {
            id,
            pty,
            process,
            conn,
            recorder,
            closed: AtomicBool::new(false),
        });

        let pump = turn.clone();
        tokio::spawn(async move {
            pump.pipe_output().await;
        });

        info!(session_id = %turn.id, recording = turn.recorder.is_some(), "session started");
        turn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// PTY to client. Runs until a read or write fails, then closes the session.
    async fn pipe_output(self: Arc<Self>) {
        let mut buf = [0u8; OUTPUT_CHUNK_SIZE];
        loop {
            let n = match self.pty.read(&mut buf).await {
                Ok(0) => {
                    info!(session_id = %self.id, "PTY closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    if self.is_closed() {
                        debug!(session_id = %self.id, error = %e, "PTY read ended after close");
                    } else {
                        warn!(session_id = %self.id, error = %e, "error reading from PTY");
                    }
                    break;
                }
            };

            let data = &buf[..n];
            if let Err(e) = self.conn.write_message(MessageKind::Binary, data).await {
                warn!(session_id = %self.id, error = %e, "error writing to client");
                break;
            }

            if let Some(recorder) = &self.recorder {
                recorder.lock().await.write_data(ChunkKind::Output, data).await;
            }
        }

        // Failures are already logged by close.
        let _ = self.close().await;
    }

    /// Client to PTY. Processes inbound frames in order until `cancel` fires
    /// or something fails; every input byte is also appended to `log_buf`.
    ///
    /// Cancellation is checked once per frame, so a blocked read only ends
    /// when the connection closes. The session is not closed here; callers
    /// close it after this returns.
    pub async fn loop_read<W>(&self, log_buf: &mut W, cancel: &CancellationToken) -> WebsshResult<()>
    where
        W: Write + ?Sized,
    {
        loop {
            if cancel.is_cancelled() {
                debug!(session_id = %self.id, "input loop cancelled");
                return Err(WebsshError::Cancelled);
            }

            let (_, msg) = self.conn.read_message().await.map_err(|e| {
                warn!(session_id = %self.id, error = %e, "error reading client message");
                e
            })?;

            match parse_frame(&msg) {
                Ok(ClientFrame::Resize(cmd)) => {
                    if let Some((rows, cols)) = cmd.dimensions() {
                        self.pty.resize(rows, cols).map_err(|e| {
                            warn!(session_id = %self.id, error = %e, "failed to resize PTY");
                            e
                        })?;
                    } else {
                        debug!(session_id = %self.id, columns = cmd.columns, rows = cmd.rows, "ignoring non-positive resize");
                    }
                }
                Ok(ClientFrame::Data(data)) => {
                    self.pty.write(&data).await.map_err(|e| {
                        warn!(session_id = %self.id, error = %e, "PTY write error");
                        e
                    })?;

                    log_buf.write_all(&data).map_err(|e| {
                        warn!(session_id = %self.id, error = %e, "log buffer write error");
                        WebsshError::Io(e)
                    })?;

                    if let Some(recorder) = &self.recorder {
                        recorder.lock().await.write_data(ChunkKind::Input, &data).await;
                    }
                }
                Ok(ClientFrame::Unknown(tag)) => {
                    debug!(session_id = %self.id, tag, "ignoring unknown message type");
                }
                Ok(ClientFrame::Empty) => {}
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "failed to parse resize message");
                    return Err(e);
                }
            }
        }
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&self) -> WebsshResult<i32> {
        self.process.wait().await
    }

    /// Kill the process, close the PTY, then close the connection.
    ///
    /// Only the first call does anything. All three releases are attempted;
    /// the first failure is returned.
    pub async fn close(&self) -> WebsshResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_err = None;

        if let Err(e) = self.process.kill() {
            warn!(session_id = %self.id, error = %e, "failed to kill process");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.pty.close() {
            warn!(session_id = %self.id, error = %e, "failed to close PTY");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.conn.close().await {
            warn!(session_id = %self.id, error = %e, "failed to close connection");
            first_err.get_or_insert(e);
        }

        info!(session_id = %self.id, "session closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
