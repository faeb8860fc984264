//! Raw TCP front-end
//!
//! The byte stream has no message boundaries, so the reader drives
//! `Frame::check_complete` over an accumulation buffer and emits one
//! event per complete frame.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender, TransportServer};
use clasp_core::Frame;

const CHANNEL_DEPTH: usize = 128;
const READ_CHUNK: usize = 16 * 1024;

pub struct TcpSender {
    tx: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSender for TcpSender {
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

pub struct TcpReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for TcpReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

fn spawn_pumps(stream: TcpStream) -> (TcpSender, TcpReceiver) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_DEPTH);
    let connected = Arc::new(AtomicBool::new(true));

    let writer_connected = connected.clone();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        writer_connected.store(false, Ordering::Relaxed);
    });

    let reader_connected = connected.clone();
    tokio::spawn(async move {
        let _ = event_tx.send(TransportEvent::Connected).await;
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        'read: loop {
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = event_tx
                        .send(TransportEvent::Disconnected { reason: None })
                        .await;
                    break;
                }
                Ok(_) => loop {
                    match Frame::check_complete(&buf) {
                        Ok(Some(len)) => {
                            let frame = buf.copy_to_bytes(len);
                            if event_tx.send(TransportEvent::Data(frame)).await.is_err() {
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Desynchronized stream; nothing to resync on.
                            let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                            let _ = event_tx
                                .send(TransportEvent::Disconnected {
                                    reason: Some(e.to_string()),
                                })
                                .await;
                            break 'read;
                        }
                    }
                },
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
        TcpSender {
            tx: out_tx,
            connected,
        },
        TcpReceiver { rx: event_rx },
    )
}

pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        debug!(%addr, "tcp listening");
        Ok(Self { listener })
    }
}

#[async_trait]
impl TransportServer for TcpServer {
    type Sender = TcpSender;
    type Receiver = TcpReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        enable_keepalive(&stream);
        let (sender, receiver) = spawn_pumps(stream);
        Ok((sender, receiver, peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Client-side connect.
pub async fn connect(addr: &str) -> Result<(TcpSender, TcpReceiver)> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    enable_keepalive(&stream);
    Ok(spawn_pumps(stream))
}

fn enable_keepalive(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("keepalive not set: {e}");
    }
    let _ = sock.set_nodelay(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clasp_core::codec;
    use clasp_core::{Get, Message};

    #[tokio::test]
    async fn frames_reassemble_across_tcp_chunks() {
        let mut server = TcpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let wire = codec::encode(&Message::Get(Get {
            address: "/x".into(),
        }))
        .unwrap();
        let client_wire = wire.clone();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // Dribble the frame a few bytes at a time, twice over.
            for _ in 0..2 {
                for chunk in client_wire.chunks(3) {
                    stream.write_all(chunk).await.unwrap();
                    stream.flush().await.unwrap();
                }
            }
            stream
        });

        let (_sender, mut receiver, _peer) = server.accept().await.unwrap();
        let mut frames = Vec::new();
        while frames.len() < 2 {
            match receiver.recv().await.unwrap() {
                TransportEvent::Data(frame) => frames.push(frame),
                TransportEvent::Connected => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(frames[0], wire);
        assert_eq!(frames[1], wire);
        drop(client.await.unwrap());
    }
}
