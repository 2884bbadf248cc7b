//! Transport seam beneath the connection manager.
//!
//! A `Connector` opens one socket and hands back a pair of channels. The
//! WebSocket implementation runs a pump task that owns the socket, forwards
//! text frames inbound, writes outbound frames, and reports exactly one
//! `Inbound::Closed` when the socket ends for any reason.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use tracing::{debug, warn};

use crate::errors::{ConnectError, TransportError};

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(NORMAL_CLOSURE, reason)
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }
}

/// Frames delivered from the socket to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Closed(CloseInfo),
}

/// Frames the manager asks the socket to write.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close(CloseInfo),
}

/// Channel ends for one live transport.
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a transport. Resolves once the socket is open or has failed.
    async fn open(&self, url: &str) -> Result<TransportHandle, ConnectError>;
}

// ────────────────────────────────────────────────────────────────────────────
// WebSocket connector
// ────────────────────────────────────────────────────────────────────────────

pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<TransportHandle, ConnectError> {
        let connect = tokio_tungstenite::connect_async(url);
        let ws = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                return Err(match status {
                    401 | 403 => ConnectError::AuthRejected { status },
                    _ => TransportError::Handshake { status }.into(),
                });
            }
            Ok(Err(tungstenite::Error::Url(e))) => {
                return Err(TransportError::Url(e.to_string()).into());
            }
            Ok(Err(e)) => return Err(TransportError::Io(e.to_string()).into()),
            Err(_) => {
                return Err(TransportError::Io(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))
                .into())
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws, out_rx, in_tx));

        Ok(TransportHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn pump(
    ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    in_tx: mpsc::UnboundedSender<Inbound>,
) {
    let (mut sink, mut stream) = ws.split();

    let close = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if in_tx.send(Inbound::Text(text)).is_err() {
                        // Manager is gone; nothing left to deliver to.
                        let _ = sink.close().await;
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = in_tx.send(Inbound::Text(text));
                    }
                    Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| CloseInfo::new(u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or_else(|| CloseInfo::new(NO_STATUS, ""));
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket read error: {e}");
                    break CloseInfo::abnormal(e.to_string());
                }
                None => break CloseInfo::abnormal("stream ended"),
            },
            cmd = out_rx.recv() => match cmd {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!("WebSocket write error: {e}");
                        break CloseInfo::abnormal(e.to_string());
                    }
                }
                Some(Outbound::Close(info)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(info.code),
                        reason: info.reason.clone().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break info;
                }
                None => {
                    let _ = sink.close().await;
                    break CloseInfo::normal("handle dropped");
                }
            },
        }
    };

    debug!(code = close.code, reason = %close.reason, "WebSocket transport closed");
    let _ = in_tx.send(Inbound::Closed(close));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::{
        extract::{
            ws::{Message as AxumMessage, WebSocketUpgrade},
            Query,
        },
        http::StatusCode,
        response::IntoResponse,
        routing::get,
        Router,
    };

    async fn echo_handler(
        ws: WebSocketUpgrade,
        Query(params): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        let token = params.get("token").cloned().unwrap_or_default();
        ws.on_upgrade(move |mut socket| async move {
            let greeting = serde_json::json!({
                "type": "success",
                "data": { "message": format!("hello {token}") },
                "timestamp": 1
            });
            let _ = socket.send(AxumMessage::Text(greeting.to_string())).await;
            while let Some(Ok(msg)) = socket.recv().await {
                match msg {
                    AxumMessage::Text(text) => {
                        let _ = socket.send(AxumMessage::Text(text)).await;
                    }
                    AxumMessage::Close(_) => break,
                    _ => {}
                }
            }
        })
    }

    async fn reject_handler() -> impl IntoResponse {
        StatusCode::UNAUTHORIZED
    }

    async fn spawn_server() -> std::net::SocketAddr {
        let app = Router::new()
            .route("/ws", get(echo_handler))
            .route("/denied", get(reject_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_ws_connector_round_trips_frames() {
        let addr = spawn_server().await;
        let connector = WsConnector::new(Duration::from_secs(5));
        let mut handle = connector
            .open(&format!("ws://{addr}/ws?token=abc%20def"))
            .await
            .unwrap();

        match handle.inbound.recv().await.unwrap() {
            Inbound::Text(text) => assert!(text.contains("hello abc def")),
            other => panic!("expected greeting, got {other:?}"),
        }

        handle
            .outbound
            .send(Outbound::Text("{\"ping\":1}".to_string()))
            .unwrap();
        assert_eq!(
            handle.inbound.recv().await.unwrap(),
            Inbound::Text("{\"ping\":1}".to_string())
        );

        handle
            .outbound
            .send(Outbound::Close(CloseInfo::normal("bye")))
            .unwrap();
        match handle.inbound.recv().await.unwrap() {
            Inbound::Closed(info) => assert_eq!(info.code, NORMAL_CLOSURE),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ws_connector_maps_401_to_auth_rejected() {
        let addr = spawn_server().await;
        let connector = WsConnector::new(Duration::from_secs(5));
        let result = connector.open(&format!("ws://{addr}/denied?token=x")).await;
        assert!(matches!(
            result,
            Err(ConnectError::AuthRejected { status: 401 })
        ));
    }

    #[tokio::test]
    async fn test_ws_connector_reports_unreachable_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WsConnector::new(Duration::from_secs(5));
        let result = connector.open(&format!("ws://{addr}/ws")).await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
    }
}
