//! webssh-core: Shared protocol library for the browser terminal.
//!
//! Provides the inbound frame codec, message and resize types, and the
//! terminal/process/connection capability traits a session is built from.

pub mod codec;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, encode_frame, encode_resize, parse_frame};
pub use error::{WebsshError, WebsshResult};
pub use messages::{ClientFrame, MessageKind, MsgType, ResizeCommand};
pub use transport::{BoxFuture, ChildProcess, MessageConnection, Terminal};
