//! Session recording in asciicast v2 format.
//!
//! A header line followed by one `[seconds, "o"|"i", "text"]` event per
//! chunk. Output and input share one file, so the recorder is wrapped in a
//! mutex and each chunk is appended while the lock is held.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error};
use webssh_core::{WebsshError, WebsshResult};

/// A recorder shared by both directions of a session.
pub type SharedRecorder = Arc<Mutex<SessionRecorder>>;

/// Which direction a recorded chunk travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// PTY output sent to the client.
    Output,
    /// Client input written to the PTY.
    Input,
}

impl ChunkKind {
    fn code(self) -> &'static str {
        match self {
            ChunkKind::Output => "o",
            ChunkKind::Input => "i",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "o" => Some(ChunkKind::Output),
            "i" => Some(ChunkKind::Input),
            _ => None,
        }
    }
}

/// asciicast v2 header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u8,
    pub width: u16,
    pub height: u16,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A single timestamped chunk in the recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingEntry {
    /// Seconds since recording start.
    pub elapsed: f64,
    pub kind: ChunkKind,
    pub data: String,
}

/// Session recorder that appends chunks to a cast file.
pub struct SessionRecorder {
    path: PathBuf,
    file: File,
    start_time: Instant,
}

impl SessionRecorder {
    /// Create the cast file and write its header.
    pub async fn create(
        path: PathBuf,
        cols: u16,
        rows: u16,
        title: Option<String>,
    ) -> WebsshResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        if let Ok(shell) = std::env::var("SHELL") {
            env.insert("SHELL".to_string(), shell);
        }

        let header = RecordingHeader {
            version: 2,
            width: cols,
            height: rows,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            env,
            title,
        };
        let mut line = serde_json::to_string(&header)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %path.display(), "recording started");
        Ok(Self {
            path,
            file,
            start_time: Instant::now(),
        })
    }

    /// Wrap in the shared form used by a session.
    pub fn shared(self) -> SharedRecorder {
        Arc::new(Mutex::new(self))
    }

    /// Append one chunk. Errors are logged but do not propagate; recording
    /// must not end the session.
    pub async fn write_data(&mut self, kind: ChunkKind, data: &[u8]) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let event = (elapsed, kind.code(), String::from_utf8_lossy(data));
        match serde_json::to_string(&event) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = self.append_line(&line).await {
                    error!(path = %self.path.display(), error = %e, "failed to write recording");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to serialize recording event");
            }
        }
    }

    async fn append_line(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await
    }
}

/// Load a recording from file (for replay).
pub async fn load_recording(path: &Path) -> WebsshResult<(RecordingHeader, Vec<RecordingEntry>)> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());

    let header_line = lines
        .next()
        .ok_or_else(|| WebsshError::InvalidMessage("recording is empty".into()))?;
    let header: RecordingHeader = serde_json::from_str(header_line)?;

    let mut entries = Vec::new();
    for line in lines {
        match parse_event(line) {
            Some(entry) => entries.push(entry),
            None => {
                error!(line, "skipping malformed recording line");
            }
        }
    }
    Ok((header, entries))
}

/// Write a recording's output chunks to `out`, paced by their timestamps.
///
/// `speed` divides the delays; 2.0 plays twice as fast.
pub async fn replay<W>(path: &Path, out: &mut W, speed: f64) -> WebsshResult<()>
where
    W: AsyncWrite + Unpin,
{
    if !(speed > 0.0 && speed.is_finite()) {
        return Err(WebsshError::Other(format!("invalid replay speed: {speed}")));
    }
    let (_, entries) = load_recording(path).await?;
    let start = tokio::time::Instant::now();
    for entry in entries.iter().filter(|e| e.kind == ChunkKind::Output) {
        let deadline = Duration::try_from_secs_f64((entry.elapsed / speed).max(0.0))
            .ok()
            .and_then(|due| start.checked_add(due))
            .ok_or_else(|| {
                WebsshError::InvalidMessage(format!(
                    "recording timestamp out of range: {}",
                    entry.elapsed
                ))
            })?;
        tokio::time::sleep_until(deadline).await;
        out.write_all(entry.data.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}

fn parse_event(line: &str) -> Option<RecordingEntry> {
    let value: Value = serde_json::from_str(line).ok()?;
    let arr = value.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    Some(RecordingEntry {
        elapsed: arr[0].as_f64()?,
        kind: ChunkKind::from_code(arr[1].as_str()?)?,
        data: arr[2].as_str()?.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_and_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.cast");

        let mut rec = SessionRecorder::create(path.clone(), 80, 24, Some("bash".into()))
            .await
            .unwrap();
        rec.write_data(ChunkKind::Input, b"ls\n").await;
        rec.write_data(ChunkKind::Output, b"file.txt\r\n").await;

        let (header, entries) = load_recording(&path).await.unwrap();
        assert_eq!(header.version, 2);
        assert_eq!((header.width, header.height), (80, 24));
        assert_eq!(header.title.as_deref(), Some("bash"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ChunkKind::Input);
        assert_eq!(entries[0].data, "ls\n");
        assert_eq!(entries[1].kind, ChunkKind::Output);
        assert!(entries[1].elapsed >= entries[0].elapsed);
    }

    #[tokio::test]
    async fn invalid_utf8_is_lossy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let mut rec = SessionRecorder::create(path.clone(), 80, 24, None).await.unwrap();
        rec.write_data(ChunkKind::Output, &[0x66, 0xff, 0x67]).await;

        let (_, entries) = load_recording(&path).await.unwrap();
        assert_eq!(entries[0].data, "f\u{fffd}g");
    }

    #[tokio::test]
    async fn malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let content = concat!(
            r#"{"version":2,"width":80,"height":24,"timestamp":0}"#,
            "\n",
            "not json\n",
            r#"[0.5,"x","unknown kind"]"#,
            "\n",
            r#"[1.0,"o","ok"]"#,
            "\n",
        );
        tokio::fs::write(&path, content).await.unwrap();

        let (_, entries) = load_recording(&path).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data, "ok");
    }

    #[tokio::test]
    async fn replay_writes_output_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let content = concat!(
            r#"{"version":2,"width":80,"height":24,"timestamp":0}"#,
            "\n",
            r#"[0.0,"o","$ "]"#,
            "\n",
            r#"[0.1,"i","ls\r"]"#,
            "\n",
            r#"[0.2,"o","a.txt\r\n"]"#,
            "\n",
        );
        tokio::fs::write(&path, content).await.unwrap();

        let mut out = Vec::new();
        replay(&path, &mut out, 1000.0).await.unwrap();
        assert_eq!(out, b"$ a.txt\r\n");
        assert!(replay(&path, &mut out, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn replay_rejects_out_of_range_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let content = concat!(
            r#"{"version":2,"width":80,"height":24,"timestamp":0}"#,
            "\n",
            r#"[0.0,"o","first"]"#,
            "\n",
            r#"[1e300,"o","x"]"#,
            "\n",
        );
        tokio::fs::write(&path, content).await.unwrap();

        let mut out = Vec::new();
        let result = replay(&path, &mut out, 1.0).await;
        assert!(matches!(result, Err(WebsshError::InvalidMessage(_))));
        assert_eq!(out, b"first");
    }

    #[tokio::test]
    async fn empty_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.cast");
        tokio::fs::write(&path, "").await.unwrap();
        assert!(load_recording(&path).await.is_err());
    }
}
