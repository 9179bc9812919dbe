//! Capabilities a terminal session is built from.
//!
//! The session layer only talks to these traits; the server provides
//! portable-pty and WebSocket implementations, tests provide in-memory ones.
//! Methods take `&self` so one handle can be shared by both session
//! directions; implementations synchronise internally.

use crate::error::WebsshResult;
use crate::messages::MessageKind;
use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future returned by the capability traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The master side of a pseudo-terminal.
pub trait Terminal: Send + Sync {
    /// Read up to `buf.len()` bytes of terminal output. `Ok(0)` means EOF.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, WebsshResult<usize>>;

    /// Write input bytes to the terminal. Returns the number of bytes written.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, WebsshResult<usize>>;

    /// Change the window size.
    fn resize(&self, rows: u16, cols: u16) -> WebsshResult<()>;

    /// Release the terminal. Later reads and writes fail.
    fn close(&self) -> WebsshResult<()>;
}

/// The process attached to the terminal.
pub trait ChildProcess: Send + Sync {
    /// Wait for the process to exit and return its exit code.
    fn wait(&self) -> BoxFuture<'_, WebsshResult<i32>>;

    /// Kill the process.
    fn kill(&self) -> WebsshResult<()>;
}

/// A message-oriented client connection.
pub trait MessageConnection: Send + Sync {
    /// Receive the next message. Fails once the connection is closed.
    fn read_message(&self) -> BoxFuture<'_, WebsshResult<(MessageKind, Vec<u8>)>>;

    /// Send one message.
    fn write_message<'a>(
        &'a self,
        kind: MessageKind,
        payload: &'a [u8],
    ) -> BoxFuture<'a, WebsshResult<()>>;

    /// Close the connection. Pending reads fail.
    fn close(&self) -> BoxFuture<'_, WebsshResult<()>>;
}
