//! Core server: accepts WebSocket connections and runs one session per client.
//!
//! Owns the configuration, the session limit and the shutdown token. Each
//! accepted connection gets a [`Turn`]; the server drives its input loop,
//! waits for the process, and tears the session down when either finishes.

use crate::config::ServerConfig;
use crate::session::{SessionRecorder, SharedRecorder, Turn};
use crate::transport::{websocket, WsConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webssh_core::{MessageConnection, WebsshError, WebsshResult};

/// How long a killed process gets to exit before the session gives up on it.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for running sessions to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one finished session.
#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: String,
    /// Exit code, if the process was reaped.
    pub exit_code: Option<i32>,
    /// Every input byte the client sent.
    pub input: Vec<u8>,
}

/// The webssh server instance.
pub struct WebsshServer {
    config: ServerConfig,
    /// Free session slots.
    slots: Arc<Semaphore>,
    /// Cancelled on shutdown; every session holds a child token.
    shutdown: CancellationToken,
}

impl WebsshServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            config,
            slots,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown, then wait briefly for sessions to end.
    pub async fn run(self) -> WebsshResult<()> {
        let server = Arc::new(self);

        if let Some(dir) = &server.config.recording_dir {
            tokio::fs::create_dir_all(dir).await?;
            info!(dir = %dir.display(), "recording sessions");
        }

        let mut ws_rx = websocket::start_listener(
            server.config.listen_addr,
            server.config.max_message_size,
        )
        .await?;

        info!(
            addr = %server.config.listen_addr,
            max_sessions = server.config.max_sessions,
            "webssh-server ready"
        );

        loop {
            tokio::select! {
                _ = server.shutdown.cancelled() => {
                    info!("shutting down, closing sessions");
                    break;
                }
                Some(ws_conn) = ws_rx.recv() => {
                    let srv = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = srv.handle_websocket(ws_conn).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        let max = u32::try_from(server.config.max_sessions).unwrap_or(u32::MAX);
        if tokio::time::timeout(DRAIN_TIMEOUT, server.slots.acquire_many(max))
            .await
            .is_err()
        {
            warn!("sessions still running after shutdown timeout");
        }
        Ok(())
    }

    async fn handle_websocket(&self, conn: websocket::WebSocketConnection) -> WebsshResult<()> {
        let remote = conn.remote_addr;
        let conn: Arc<dyn MessageConnection> = Arc::new(WsConnection::from_accepted(
            conn,
            self.config.max_message_size,
        ));

        let Ok(_permit) = self.slots.clone().try_acquire_owned() else {
            warn!(remote = %remote, max = self.config.max_sessions, "session limit reached, rejecting");
            conn.close().await?;
            return Ok(());
        };

        info!(remote = %remote, "handling WebSocket connection");
        let summary = self.run_session(conn).await?;
        info!(
            remote = %remote,
            session_id = %summary.session_id,
            exit_code = ?summary.exit_code,
            input_bytes = summary.input.len(),
            "session finished"
        );
        Ok(())
    }

    /// Run one session on `conn` until the client leaves, the process exits,
    /// or the server shuts down.
    pub async fn run_session(&self, conn: Arc<dyn MessageConnection>) -> WebsshResult<SessionSummary> {
        let session_id = generate_session_id();
        let recorder = self.open_recorder(&session_id).await;

        let turn = match Turn::spawn(session_id.clone(), conn.clone(), &self.config.spawn, recorder) {
            Ok(turn) => turn,
            Err(e) => {
                let _ = conn.close().await;
                return Err(e);
            }
        };

        let cancel = self.shutdown.child_token();
        let mut input = Vec::new();

        let input_loop = async {
            let result = turn.loop_read(&mut input, &cancel).await;
            cancel.cancel();
            result
        };

        let process_watch = async {
            let code = tokio::select! {
                code = turn.wait() => code,
                _ = cancel.cancelled() => {
                    // Killing the process lets it be reaped.
                    let _ = turn.close().await;
                    tokio::time::timeout(REAP_TIMEOUT, turn.wait())
                        .await
                        .unwrap_or_else(|_| Err(WebsshError::Process("process did not exit".into())))
                }
            };
            cancel.cancel();
            // Unblocks the input loop's pending read.
            let _ = turn.close().await;
            code
        };

        let (input_result, exit) = tokio::join!(input_loop, process_watch);

        match input_result {
            Err(WebsshError::Cancelled) | Err(WebsshError::ConnectionClosed) => {
                debug!(session_id = %session_id, "input loop ended")
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "input loop failed"),
            Ok(()) => {}
        }
        let exit_code = match exit {
            Ok(code) => Some(code),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to reap process");
                None
            }
        };
        debug!(session_id = %session_id, input_bytes = input.len(), "session input captured");

        Ok(SessionSummary {
            session_id,
            exit_code,
            input,
        })
    }

    async fn open_recorder(&self, session_id: &str) -> Option<SharedRecorder> {
        let dir = self.config.recording_dir.as_ref()?;
        let path = dir.join(format!("{session_id}.cast"));
        let title = self.config.spawn.command.clone();
        match SessionRecorder::create(path, self.config.spawn.cols, self.config.spawn.rows, title).await {
            Ok(recorder) => Some(recorder.shared()),
            Err(e) => {
                warn!(session_id, error = %e, "failed to start recording, continuing without");
                None
            }
        }
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{CliOverrides, ConfigFile};
    use crate::session::recording::{load_recording, ChunkKind};
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;
    use webssh_core::{encode_frame, MsgType};

    fn config(command: &str, record_dir: Option<String>) -> ServerConfig {
        let cli = CliOverrides {
            bind: Some("127.0.0.1".into()),
            port: Some(0),
            command: Some(command.into()),
            record_dir,
            ..CliOverrides::default()
        };
        ServerConfig::resolve(ConfigFile::default(), cli).unwrap()
    }

    async fn connect() -> (Arc<dyn MessageConnection>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let conn: Arc<dyn MessageConnection> =
            Arc::new(WsConnection::new(server, addr, websocket::DEFAULT_MAX_MESSAGE_SIZE));
        (conn, client)
    }

    async fn read_output_until(client: &mut WebSocketStream<DuplexStream>, needle: &str) -> String {
        let mut out = Vec::new();
        while let Some(Ok(msg)) = client.next().await {
            if let Message::Binary(data) = msg {
                out.extend_from_slice(&data);
                if String::from_utf8_lossy(&out).contains(needle) {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn echo_session_ends_when_client_leaves() {
        let server = WebsshServer::new(config("cat", None));
        let (conn, mut client) = connect().await;
        let session = tokio::spawn(async move { server.run_session(conn).await });

        let frame = encode_frame(MsgType::Data, b"hello\n");
        client.send(Message::Binary(frame.into())).await.unwrap();
        let out = read_output_until(&mut client, "hello").await;
        assert!(out.contains("hello"));

        client.close(None).await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.input, b"hello\n");
        assert_eq!(summary.session_id.len(), 32);
    }

    #[tokio::test]
    async fn session_ends_when_process_exits() {
        let server = WebsshServer::new(config("true", None));
        let (conn, _client) = connect().await;
        let summary = tokio::time::timeout(Duration::from_secs(5), server.run_session(conn))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.exit_code, Some(0));
        assert!(summary.input.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_running_session() {
        let server = Arc::new(WebsshServer::new(config("cat", None)));
        let (conn, _client) = connect().await;
        let session = {
            let server = server.clone();
            tokio::spawn(async move { server.run_session(conn).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown_token().cancel();
        let summary = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(summary.input.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_closes_connection() {
        let server = WebsshServer::new(config("/nonexistent/webssh-test-binary", None));
        let (conn, mut client) = connect().await;
        assert!(server.run_session(conn).await.is_err());
        match client.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recording_written_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let server = WebsshServer::new(config(
            "cat",
            Some(dir.path().to_string_lossy().into_owned()),
        ));
        let (conn, mut client) = connect().await;
        let session = tokio::spawn(async move { server.run_session(conn).await });

        let frame = encode_frame(MsgType::Data, b"rec\n");
        client.send(Message::Binary(frame.into())).await.unwrap();
        read_output_until(&mut client, "rec").await;
        client.close(None).await.unwrap();
        let summary = session.await.unwrap().unwrap();

        let path = dir.path().join(format!("{}.cast", summary.session_id));
        let (header, entries) = load_recording(&path).await.unwrap();
        assert_eq!(header.title.as_deref(), Some("cat"));
        assert!(entries
            .iter()
            .any(|e| e.kind == ChunkKind::Input && e.data == "rec\n"));
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn session_logs_input_size_not_content() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let server = WebsshServer::new(config("cat", None));
        let (conn, mut client) = connect().await;
        let secret = b"hunter2-secret\n";
        let frame = encode_frame(MsgType::Data, secret);
        client.send(Message::Binary(frame.into())).await.unwrap();
        client.close(None).await.unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(5), server.run_session(conn))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.input, secret);

        let logs = String::from_utf8_lossy(&capture.0.lock().unwrap()).into_owned();
        assert!(logs.contains(&format!("input_bytes={}", secret.len())));
        assert!(!logs.contains("hunter2"));
    }

    #[test]
    fn session_ids_are_unique_hex() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
