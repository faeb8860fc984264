//! WebSocket front-end (mandatory transport)
//!
//! Negotiates the `clasp.v2` subprotocol; every binary WebSocket message
//! carries exactly one CLASP frame, so no re-framing loop is needed.
//! The text channel is unused.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender, TransportServer};
use clasp_core::WS_SUBPROTOCOL;

const CHANNEL_DEPTH: usize = 128;

pub struct WsSender {
    tx: mpsc::Sender<WsMessage>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSender for WsSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(WsMessage::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn try_send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .try_send(WsMessage::Binary(data.to_vec()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::BufferFull,
                mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        let _ = self.tx.send(WsMessage::Close(None)).await;
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

pub struct WsReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for WsReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Wire the writer and reader pumps for an upgraded stream.
fn spawn_pumps<S>(stream: WebSocketStream<S>) -> (WsSender, WsReceiver)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = stream.split();
    let (out_tx, out_rx) = mpsc::channel::<WsMessage>(CHANNEL_DEPTH);
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_DEPTH);
    let connected = Arc::new(AtomicBool::new(true));

    tokio::spawn(writer_pump(write, out_rx, connected.clone()));
    tokio::spawn(reader_pump(read, event_tx, connected.clone()));

    (
        WsSender {
            tx: out_tx,
            connected,
        },
        WsReceiver { rx: event_rx },
    )
}

async fn writer_pump<S>(
    mut write: SplitSink<WebSocketStream<S>, WsMessage>,
    mut out_rx: mpsc::Receiver<WsMessage>,
    connected: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    while let Some(msg) = out_rx.recv().await {
        let closing = matches!(msg, WsMessage::Close(_));
        if write.send(msg).await.is_err() || closing {
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
}

async fn reader_pump<S>(
    mut read: SplitStream<WebSocketStream<S>>,
    event_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let _ = event_tx.send(TransportEvent::Connected).await;
    while let Some(result) = read.next().await {
        match result {
            Ok(WsMessage::Binary(data)) => {
                if event_tx
                    .send(TransportEvent::Data(Bytes::from(data)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(WsMessage::Text(_)) => {
                debug!("ignoring text message on binary-only channel");
            }
            Ok(WsMessage::Close(frame)) => {
                let reason = frame.map(|f| f.reason.to_string());
                let _ = event_tx.send(TransportEvent::Disconnected { reason }).await;
                break;
            }
            Ok(_) => {} // ping/pong handled by tungstenite
            Err(e) => {
                let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                let _ = event_tx
                    .send(TransportEvent::Disconnected {
                        reason: Some(e.to_string()),
                    })
                    .await;
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
}

/// Listening WebSocket front-end.
pub struct WebSocketServer {
    listener: TcpListener,
    subprotocol: String,
}

impl WebSocketServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        debug!(%addr, "websocket listening");
        Ok(Self {
            listener,
            subprotocol: WS_SUBPROTOCOL.to_string(),
        })
    }
}

#[async_trait]
impl TransportServer for WebSocketServer {
    type Sender = WsSender;
    type Receiver = WsReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let subprotocol = self.subprotocol.clone();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &HsRequest, mut response: HsResponse| {
                let offered = req
                    .headers()
                    .get("Sec-WebSocket-Protocol")
                    .and_then(|h| h.to_str().ok())
                    .map(|h| h.split(',').any(|p| p.trim() == subprotocol))
                    .unwrap_or(false);
                if offered {
                    if let Ok(value) = subprotocol.parse() {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", value);
                    }
                } else {
                    warn!(%peer, "peer did not offer {subprotocol}");
                }
                Ok(response)
            },
        )
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (sender, receiver) = spawn_pumps(ws);
        Ok((sender, receiver, peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Client-side connect, used by bridges and tooling.
pub async fn connect(url: &str) -> Result<(WsSender, WsReceiver)> {
    let request = Request::builder()
        .uri(url)
        .header("Sec-WebSocket-Protocol", WS_SUBPROTOCOL)
        .header("Host", host_of(url).unwrap_or_default())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .body(())
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    let (stream, response): (WebSocketStream<MaybeTlsStream<TcpStream>>, _) =
        tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
    debug!(status = %response.status(), "websocket connected");
    Ok(spawn_pumps(stream))
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    Some(rest.split('/').next()?.to_string())
}
