//! QUIC front-end
//!
//! One bidirectional stream per connection carries the framed byte
//! stream, re-framed with `check_complete` exactly like TCP. TLS
//! material is the caller's problem: pass a ready `quinn::ServerConfig`.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender, TransportServer};
use clasp_core::Frame;

const CHANNEL_DEPTH: usize = 128;
const READ_CHUNK: usize = 16 * 1024;

pub struct QuicSender {
    tx: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSender for QuicSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.tx
            .send(data)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn try_send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

pub struct QuicReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for QuicReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

fn spawn_pumps(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) -> (QuicSender, QuicReceiver) {
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_DEPTH);
    let connected = Arc::new(AtomicBool::new(true));

    let writer_connected = connected.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if send.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = send.finish();
        writer_connected.store(false, Ordering::Relaxed);
    });

    let reader_connected = connected.clone();
    tokio::spawn(async move {
        let _ = event_tx.send(TransportEvent::Connected).await;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];
        'read: loop {
            match recv.read(&mut chunk).await {
                Ok(Some(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    loop {
                        match Frame::check_complete(&buf) {
                            Ok(Some(len)) => {
                                let frame = buf.copy_to_bytes(len);
                                if event_tx.send(TransportEvent::Data(frame)).await.is_err() {
                                    break 'read;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ =
                                    event_tx.send(TransportEvent::Error(e.to_string())).await;
                                let _ = event_tx
                                    .send(TransportEvent::Disconnected {
                                        reason: Some(e.to_string()),
                                    })
                                    .await;
                                break 'read;
                            }
                        }
                    }
                }
                Ok(None) => {
                    let _ = event_tx
                        .send(TransportEvent::Disconnected { reason: None })
                        .await;
                    break;
                }
                Err(e) => {
                    let _ = event_tx
                        .send(TransportEvent::Disconnected {
                            reason: Some(e.to_string()),
                        })
                        .await;
                    break;
                }
            }
        }
        reader_connected.store(false, Ordering::Relaxed);
    });

    (
        QuicSender {
            tx: out_tx,
            connected,
        },
        QuicReceiver { rx: event_rx },
    )
}

pub struct QuicServer {
    endpoint: quinn::Endpoint,
}

impl QuicServer {
    pub fn bind(addr: SocketAddr, config: quinn::ServerConfig) -> Result<Self> {
        let endpoint =
            quinn::Endpoint::server(config, addr).map_err(|e| TransportError::Bind(e.to_string()))?;
        debug!(%addr, "quic listening");
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportServer for QuicServer {
    type Sender = QuicSender;
    type Receiver = QuicReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)> {
        loop {
            let incoming = self
                .endpoint
                .accept()
                .await
                .ok_or(TransportError::NotConnected)?;
            let connection = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    warn!("quic handshake failed: {e}");
                    continue;
                }
            };
            let peer = connection.remote_address();
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let (sender, receiver) = spawn_pumps(send, recv);
                    return Ok((sender, receiver, peer));
                }
                Err(e) => {
                    warn!(%peer, "no bidirectional stream: {e}");
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        self.endpoint.close(0u32.into(), b"shutdown");
        Ok(())
    }
}
