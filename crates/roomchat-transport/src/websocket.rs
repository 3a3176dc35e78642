//! WebSocket client transport.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use roomchat_core::{Connection, Transport, TransportError, TransportEvent, TransportEvents};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Default handshake timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

enum Outgoing {
    Frame(String),
    Close,
}

/// Transport that opens `ws://` / `wss://` connections.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    /// Create a transport with the default handshake timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Check that `raw` is a WebSocket URL.
///
/// # Errors
/// Returns [`TransportError::InvalidUrl`] for unparsable URLs or other schemes.
pub fn parse_ws_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(format!("{raw}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::InvalidUrl(format!(
            "{raw}: unsupported scheme '{other}'"
        ))),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    async fn open(&self, url: &str) -> Result<(WebSocketConnection, TransportEvents), TransportError> {
        let url = parse_ws_url(url)?;

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Connect(format!("handshake with {url} timed out")))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(%url, "WebSocket handshake complete");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        // Forward queued frames to the socket
        let writer_open = Arc::clone(&open);
        let writer_events = event_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::error!("WebSocket send error: {e}");
                            writer_open.store(false, Ordering::SeqCst);
                            let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Outgoing::Close => break,
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        // Turn socket traffic into transport events
        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            let code = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(TransportEvent::Message(text));
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            let _ = event_tx.send(TransportEvent::Message(text));
                        }
                        Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => break frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {e}");
                        let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                        break None;
                    }
                    None => break None,
                }
            };
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(TransportEvent::Closed { code });
        });

        let conn = WebSocketConnection {
            out_tx,
            open,
            reader,
            writer,
        };
        Ok((conn, event_rx))
    }
}

/// An open WebSocket connection.
pub struct WebSocketConnection {
    out_tx: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection for WebSocketConnection {
    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.out_tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.out_tx.send(Outgoing::Close);
        }
        self.reader.abort();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.writer.is_finished()
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use tokio::{net::TcpListener, sync::oneshot};
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};

    use super::*;

    #[test]
    fn test_parse_ws_url() {
        assert!(parse_ws_url("ws://127.0.0.1:8000/ws/chat/lobby/").is_ok());
        assert!(parse_ws_url("wss://chat.example/ws/chat/lobby/").is_ok());
        assert!(matches!(
            parse_ws_url("http://chat.example/"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_ws_url("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_url_without_connecting() {
        let transport = WebSocketTransport::new();
        let result = transport.open("ftp://nowhere").await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_open_reports_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransport::new().with_connect_timeout(Duration::from_secs(2));
        let result = transport.open(&format!("ws://{addr}/ws/chat/x/")).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways_and_close_code_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let _ = received_tx.send(first);
            ws.send(Message::Text("pong".to_string())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (mut conn, mut events) = WebSocketTransport::new()
            .open(&format!("ws://{addr}/ws/chat/lobby/"))
            .await
            .unwrap();
        assert!(conn.is_open());
        conn.send("ping".to_string()).unwrap();

        assert_eq!(received_rx.await.unwrap(), Message::Text("ping".to_string()));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Message("pong".to_string()))
        );
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Closed { code: Some(1001) })
        );
        assert!(!conn.is_open());
        assert_eq!(conn.send("late".to_string()), Err(TransportError::Closed));
    }
}
