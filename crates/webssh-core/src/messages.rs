//! Message types exchanged with the browser terminal.
//!
//! Every inbound message starts with a one-byte discriminant followed by a
//! base64 payload. Outbound terminal output is sent as raw binary.

use serde::{Deserialize, Serialize};

/// Inbound message discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Terminal input bytes.
    Data = b'1',
    /// Window size change.
    Resize = b'2',
}

impl MsgType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'1' => Some(Self::Data),
            b'2' => Some(Self::Resize),
            _ => None,
        }
    }
}

/// Transport-level kind of a connection message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Window size requested by the client.
///
/// Missing fields decode as zero, which makes the command a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResizeCommand {
    #[serde(default)]
    pub columns: i64,
    #[serde(default)]
    pub rows: i64,
}

impl ResizeCommand {
    pub fn new(columns: i64, rows: i64) -> Self {
        Self { columns, rows }
    }

    /// `(rows, cols)` to apply, or `None` when either side is non-positive.
    ///
    /// Values beyond the 16-bit pty range are clamped.
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        if self.columns <= 0 || self.rows <= 0 {
            return None;
        }
        let clamp = |v: i64| u16::try_from(v).unwrap_or(u16::MAX);
        Some((clamp(self.rows), clamp(self.columns)))
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Input bytes for the pty.
    Data(Vec<u8>),
    /// Resize request.
    Resize(ResizeCommand),
    /// Unrecognised discriminant; ignored by the session loop.
    Unknown(u8),
    /// Zero-length message.
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminant_bytes() {
        assert_eq!(MsgType::Data.as_byte(), b'1');
        assert_eq!(MsgType::Resize.as_byte(), b'2');
        assert_eq!(MsgType::from_byte(b'2'), Some(MsgType::Resize));
        assert_eq!(MsgType::from_byte(b'3'), None);
    }

    #[test]
    fn resize_dimensions() {
        assert_eq!(ResizeCommand::new(80, 24).dimensions(), Some((24, 80)));
        assert_eq!(ResizeCommand::new(0, 24).dimensions(), None);
        assert_eq!(ResizeCommand::new(80, -1).dimensions(), None);
        assert_eq!(
            ResizeCommand::new(100_000, 50).dimensions(),
            Some((50, u16::MAX))
        );
    }

    #[test]
    fn resize_missing_fields_default_to_zero() {
        let cmd: ResizeCommand = serde_json::from_str(r#"{"columns":80}"#).unwrap();
        assert_eq!(cmd, ResizeCommand::new(80, 0));
        assert_eq!(cmd.dimensions(), None);
    }
}
