//! WebSocket listener and client connection using tokio-tungstenite.
//!
//! The listener yields handshaken connections over a channel. Each one is
//! wrapped in a [`WsConnection`], which splits the socket so the session's
//! output task can write while its input loop is blocked reading.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webssh_core::{BoxFuture, MessageConnection, MessageKind, WebsshError, WebsshResult};

/// Default maximum inbound message size (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

/// How long close waits for the Close frame to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Protocol settings that cap inbound messages and frames at `max_message_size`.
pub fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections. Messages larger than
/// `max_message_size` are refused while they are still being received.
pub async fn start_listener(
    bind_addr: SocketAddr,
    max_message_size: usize,
) -> WebsshResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| WebsshError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");
    Ok(serve_listener(tcp_listener, max_message_size))
}

fn serve_listener(
    tcp_listener: TcpListener,
    max_message_size: usize,
) -> mpsc::Receiver<WebSocketConnection> {
    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let config = Some(ws_config(max_message_size));
                        match tokio_tungstenite::accept_async_with_config(stream, config).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    rx
}

/// A WebSocket as a [`MessageConnection`].
pub struct WsConnection<S> {
    remote_addr: SocketAddr,
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    /// Cancelled on close; wakes a blocked reader or writer.
    shutdown: CancellationToken,
    max_message_size: usize,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws_stream: WebSocketStream<S>, remote_addr: SocketAddr, max_message_size: usize) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            remote_addr,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            shutdown: CancellationToken::new(),
            max_message_size,
        }
    }

    fn check_size(&self, len: usize) -> WebsshResult<()> {
        if len > self.max_message_size {
            return Err(WebsshError::InvalidMessage(format!(
                "WS frame too large: {len} bytes (max {})",
                self.max_message_size
            )));
        }
        Ok(())
    }
}

impl WsConnection<TcpStream> {
    pub fn from_accepted(conn: WebSocketConnection, max_message_size: usize) -> Self {
        Self::new(conn.ws_stream, conn.remote_addr, max_message_size)
    }
}

impl<S> MessageConnection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Text and binary messages are both returned; pings and pongs are
    /// skipped. A Close frame or end of stream is an error.
    fn read_message(&self) -> BoxFuture<'_, WebsshResult<(MessageKind, Vec<u8>)>> {
        Box::pin(async move {
            let mut stream = self.stream.lock().await;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Err(WebsshError::ConnectionClosed),
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(Message::Binary(data))) => {
                        self.check_size(data.len())?;
                        return Ok((MessageKind::Binary, data.to_vec()));
                    }
                    Some(Ok(Message::Text(text))) => {
                        self.check_size(text.len())?;
                        return Ok((MessageKind::Text, text.into_bytes()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(remote = %self.remote_addr, ?frame, "peer sent close");
                        return Err(WebsshError::ConnectionClosed);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(TungsteniteError::Capacity(e))) => {
                        return Err(WebsshError::InvalidMessage(format!("WS frame too large: {e}")));
                    }
                    Some(Err(e)) => {
                        return Err(WebsshError::Transport(format!("WS recv failed: {e}")));
                    }
                    None => return Err(WebsshError::ConnectionClosed),
                }
            }
        })
    }

    fn write_message<'a>(
        &'a self,
        kind: MessageKind,
        payload: &'a [u8],
    ) -> BoxFuture<'a, WebsshResult<()>> {
        Box::pin(async move {
            let msg = match kind {
                MessageKind::Binary => Message::Binary(payload.to_vec().into()),
                MessageKind::Text => {
                    Message::Text(String::from_utf8_lossy(payload).into_owned().into())
                }
            };
            let mut sink = self.sink.lock().await;
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Err(WebsshError::ConnectionClosed),
                sent = sink.send(msg) => {
                    sent.map_err(|e| WebsshError::Transport(format!("WS send failed: {e}")))
                }
            }
        })
    }

    /// Wakes pending reads and writes, then sends a Close frame.
    ///
    /// The Close frame is best-effort: the peer may already be gone.
    fn close(&self) -> BoxFuture<'_, WebsshResult<()>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            self.shutdown.cancel();

            let mut sink = self.sink.lock().await;
            let closing = async {
                sink.send(Message::Close(None)).await?;
                sink.close().await
            };
            match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
                Ok(Ok(())) => debug!(remote = %self.remote_addr, "WebSocket closed"),
                Ok(Err(e)) => debug!(remote = %self.remote_addr, error = %e, "WebSocket close frame not sent"),
                Err(_) => debug!(remote = %self.remote_addr, "WebSocket close timed out"),
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair(max: usize) -> (WsConnection<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        (WsConnection::new(server, addr, max), client)
    }

    #[tokio::test]
    async fn reads_text_and_binary_skips_ping() {
        let (conn, mut client) = pair(DEFAULT_MAX_MESSAGE_SIZE).await;
        client.send(Message::Ping(vec![1].into())).await.unwrap();
        client.send(Message::Text("1bHMK".to_string().into())).await.unwrap();
        client.send(Message::Binary(b"2xyz".to_vec().into())).await.unwrap();

        assert_eq!(
            conn.read_message().await.unwrap(),
            (MessageKind::Text, b"1bHMK".to_vec())
        );
        assert_eq!(
            conn.read_message().await.unwrap(),
            (MessageKind::Binary, b"2xyz".to_vec())
        );
    }

    #[tokio::test]
    async fn writes_binary_output() {
        let (conn, mut client) = pair(DEFAULT_MAX_MESSAGE_SIZE).await;
        conn.write_message(MessageKind::Binary, b"\x1b[1mhi").await.unwrap();
        match client.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data.to_vec(), b"\x1b[1mhi".to_vec()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_close_is_read_error() {
        let (conn, mut client) = pair(DEFAULT_MAX_MESSAGE_SIZE).await;
        client.close(None).await.unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(WebsshError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let (conn, mut client) = pair(8).await;
        client.send(Message::Binary(vec![0u8; 9].into())).await.unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(WebsshError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn protocol_limit_refuses_oversized_message() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server =
            WebSocketStream::from_raw_socket(server_io, Role::Server, Some(ws_config(8))).await;
        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        // Only the protocol layer enforces the limit here.
        let conn = WsConnection::new(server, addr, usize::MAX);

        client.send(Message::Binary(vec![0u8; 9].into())).await.unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(WebsshError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn listener_applies_message_limit() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mut rx = serve_listener(tcp, 8);

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let accepted = rx.recv().await.unwrap();
        let conn = WsConnection::from_accepted(accepted, usize::MAX);

        client.send(Message::Binary(b"1bHMK".to_vec().into())).await.unwrap();
        assert_eq!(
            conn.read_message().await.unwrap(),
            (MessageKind::Binary, b"1bHMK".to_vec())
        );

        client.send(Message::Binary(vec![0u8; 64].into())).await.unwrap();
        assert!(matches!(
            conn.read_message().await,
            Err(WebsshError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn close_unblocks_pending_read_and_is_idempotent() {
        let (conn, _client) = pair(DEFAULT_MAX_MESSAGE_SIZE).await;
        let conn = std::sync::Arc::new(conn);
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.read_message().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            reader.await.unwrap(),
            Err(WebsshError::ConnectionClosed)
        ));
        assert!(conn.write_message(MessageKind::Binary, b"late").await.is_err());
    }
}
