//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal with a given command and size and exposes it
//! through the [`Terminal`] and [`ChildProcess`] capabilities. Blocking
//! reads, writes and waits run on the tokio blocking pool.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use webssh_core::{BoxFuture, ChildProcess, Terminal, WebsshError, WebsshResult};

/// EIO, returned by the master once the slave side has hung up.
#[cfg(unix)]
const EIO: i32 = 5;

/// A managed PTY instance and the process attached to it.
pub struct PtyHandle {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    /// Held for resize; dropped on close.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    /// Separate from `child` so kill never waits behind a blocked `wait`.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyHandle {
    /// Spawn `command` with `args` on a new PTY of the given size.
    ///
    /// If `command` is None, the user's default shell is used. Nothing is
    /// leaked on failure: the PTY pair is dropped with the error.
    pub fn spawn(
        command: Option<&str>,
        args: &[String],
        cols: u16,
        rows: u16,
        env: Option<&HashMap<String, String>>,
    ) -> WebsshResult<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| WebsshError::Pty(format!("failed to open PTY: {e}")))?;

        let program = match command {
            Some(c) if c.trim().is_empty() => {
                return Err(WebsshError::Pty("empty command".into()));
            }
            Some(c) => c.to_string(),
            None => default_shell(),
        };
        let mut cmd = CommandBuilder::new(&program);
        cmd.args(args);

        if let Some(env_map) = env {
            for (key, value) in env_map {
                cmd.env(key, value);
            }
        }
        cmd.env("TERM", "xterm-256color");

        // Taken before spawning so a failure here leaves no process behind.
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WebsshError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WebsshError::Pty(format!("failed to take PTY writer: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WebsshError::Process(format!("failed to start command: {e}")))?;
        // Keeping the slave open would hide the child's exit from the reader.
        drop(pair.slave);

        info!(program = %program, cols, rows, "PTY spawned");

        let killer = child.clone_killer();

        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(Some(writer))),
            master: Mutex::new(Some(pair.master)),
            child: Arc::new(Mutex::new(child)),
            killer: Mutex::new(killer),
        })
    }
}

impl Terminal for PtyHandle {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, WebsshResult<usize>> {
        let reader = self.reader.clone();
        let len = buf.len();
        Box::pin(async move {
            let (n, chunk) = tokio::task::spawn_blocking(move || -> WebsshResult<(usize, Vec<u8>)> {
                let mut chunk = vec![0u8; len];
                let mut reader = reader
                    .lock()
                    .map_err(|_| WebsshError::Pty("PTY reader lock poisoned".into()))?;
                match reader.read(&mut chunk) {
                    Ok(n) => Ok((n, chunk)),
                    #[cfg(unix)]
                    Err(e) if e.raw_os_error() == Some(EIO) => Ok((0, chunk)),
                    Err(e) => Err(WebsshError::Io(e)),
                }
            })
            .await
            .map_err(|e| WebsshError::Other(format!("join error: {e}")))??;
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, WebsshResult<usize>> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> WebsshResult<usize> {
                let mut guard = writer
                    .lock()
                    .map_err(|_| WebsshError::Pty("PTY writer lock poisoned".into()))?;
                let writer = guard
                    .as_mut()
                    .ok_or_else(|| WebsshError::Pty("PTY closed".into()))?;
                writer.write_all(&data)?;
                writer.flush()?;
                Ok(data.len())
            })
            .await
            .map_err(|e| WebsshError::Other(format!("join error: {e}")))?
        })
    }

    fn resize(&self, rows: u16, cols: u16) -> WebsshResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| WebsshError::Pty("PTY master lock poisoned".into()))?;
        master
            .as_ref()
            .ok_or_else(|| WebsshError::Pty("PTY closed".into()))?
            .resize(size)
            .map_err(|e| WebsshError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn close(&self) -> WebsshResult<()> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| WebsshError::Pty("PTY writer lock poisoned".into()))?
            .take();
        let master = self
            .master
            .lock()
            .map_err(|_| WebsshError::Pty("PTY master lock poisoned".into()))?
            .take();
        if writer.is_some() || master.is_some() {
            debug!("PTY closed");
        }
        Ok(())
    }
}

impl ChildProcess for PtyHandle {
    fn wait(&self) -> BoxFuture<'_, WebsshResult<i32>> {
        let child = self.child.clone();
        Box::pin(async move {
            let status = tokio::task::spawn_blocking(move || -> WebsshResult<portable_pty::ExitStatus> {
                let mut child = child
                    .lock()
                    .map_err(|_| WebsshError::Process("child lock poisoned".into()))?;
                child
                    .wait()
                    .map_err(|e| WebsshError::Process(format!("wait error: {e}")))
            })
            .await
            .map_err(|e| WebsshError::Other(format!("join error: {e}")))??;

            let code: i32 = status.exit_code().try_into().unwrap_or(-1);
            info!(code, "PTY child exited");
            Ok(code)
        })
    }

    fn kill(&self) -> WebsshResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| WebsshError::Process("killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| WebsshError::Process(format!("kill failed: {e}")))
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
