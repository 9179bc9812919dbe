//! Session management: PTY, recording, and the turn that bridges them to a client.

pub mod pty;
pub mod recording;
pub mod turn;

pub use recording::{SessionRecorder, SharedRecorder};
pub use turn::{SpawnOptions, Turn};
