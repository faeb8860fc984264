//! UDP front-end
//!
//! Each datagram carries exactly one frame; datagrams holding a partial
//! or over-long frame are rejected rather than reassembled. The server
//! demuxes peers by source address so UDP clients get ordinary session
//! read loops.

use async_trait::async_trait;
use bytes::Bytes;
use self::peers::PeerMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender, TransportServer};
use clasp_core::Frame;

const CHANNEL_DEPTH: usize = 128;
const MAX_DATAGRAM: usize = 64 * 1024;

/// Thin datagram wrapper used by discovery and the session server.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.socket.set_broadcast(on)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

pub struct UdpSender {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSender for UdpSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.socket
            .send_to(&data, self.peer)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    fn try_send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        // Datagram sockets don't buffer per-peer; best effort is fine.
        match self.socket.try_send_to(&data, self.peer) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(TransportError::BufferFull)
            }
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

pub struct UdpReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for UdpReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Session server over one UDP socket. The first datagram from a new
/// source address surfaces as an accepted connection.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    accept_rx: mpsc::Receiver<(UdpSender, UdpReceiver, SocketAddr)>,
}

impl UdpServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|e| TransportError::Bind(e.to_string()))?,
        );
        debug!(%addr, "udp listening");
        let peers = PeerMap::default();
        let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_DEPTH);

        let demux_socket = socket.clone();
        let demux_peers = peers.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match demux_socket.recv_from(&mut buf).await {
                    Ok(got) => got,
                    Err(e) => {
                        debug!("udp recv failed: {e}");
                        break;
                    }
                };
                let datagram = &buf[..len];
                // One frame per datagram, exactly.
                match Frame::check_complete(datagram) {
                    Ok(Some(frame_len)) if frame_len == len => {}
                    other => {
                        trace!(%from, ?other, "dropping malformed datagram");
                        continue;
                    }
                }
                let payload = Bytes::copy_from_slice(datagram);

                let tx = demux_peers.get(&from);
                let tx = match tx {
                    Some(tx) => tx,
                    None => {
                        let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
                        let connected = Arc::new(AtomicBool::new(true));
                        let sender = UdpSender {
                            socket: demux_socket.clone(),
                            peer: from,
                            connected,
                        };
                        let receiver = UdpReceiver { rx: event_rx };
                        demux_peers.insert(from, event_tx.clone());
                        if accept_tx.send((sender, receiver, from)).await.is_err() {
                            break;
                        }
                        event_tx
                    }
                };
                if tx.send(TransportEvent::Data(payload)).await.is_err() {
                    demux_peers.remove(&from);
                }
            }
        });

        Ok(Self {
            socket,
            peers,
            accept_rx,
        })
    }
}

#[async_trait]
impl TransportServer for UdpServer {
    type Sender = UdpSender;
    type Receiver = UdpReceiver;

    async fn accept(&mut self) -> Result<(Self::Sender, Self::Receiver, SocketAddr)> {
        self.accept_rx
            .recv()
            .await
            .ok_or(TransportError::NotConnected)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn close(&self) -> Result<()> {
        self.peers.clear();
        Ok(())
    }
}

/// Tiny shared map so the demux task and the server handle see the same
/// peer table without pulling a full concurrent-map dependency into the
/// transport crate.
mod peers {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Clone, Default)]
    pub struct PeerMap {
        inner: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<TransportEvent>>>>,
    }

    impl PeerMap {
        pub fn get(&self, addr: &SocketAddr) -> Option<mpsc::Sender<TransportEvent>> {
            self.inner.lock().get(addr).cloned()
        }

        pub fn insert(&self, addr: SocketAddr, tx: mpsc::Sender<TransportEvent>) {
            self.inner.lock().insert(addr, tx);
        }

        pub fn remove(&self, addr: &SocketAddr) {
            self.inner.lock().remove(addr);
        }

        pub fn clear(&self) {
            self.inner.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clasp_core::codec;
    use clasp_core::{Get, Message};

    #[tokio::test]
    async fn datagram_is_one_frame() {
        let mut server = UdpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let wire = codec::encode(&Message::Get(Get {
            address: "/x".into(),
        }))
        .unwrap();
        client.send_to(&wire, addr).await.unwrap();

        let (_sender, mut receiver, _peer) = server.accept().await.unwrap();
        match receiver.recv().await.unwrap() {
            TransportEvent::Data(frame) => assert_eq!(frame, wire),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fragment_datagrams_are_dropped() {
        let mut server = UdpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let wire = codec::encode(&Message::Get(Get {
            address: "/x".into(),
        }))
        .unwrap();
        // A truncated frame must not create a session.
        client.send_to(&wire[..wire.len() - 1], addr).await.unwrap();
        // A well-formed one from the same peer must.
        client.send_to(&wire, addr).await.unwrap();

        let (_sender, mut receiver, _peer) = server.accept().await.unwrap();
        match receiver.recv().await.unwrap() {
            TransportEvent::Data(frame) => assert_eq!(frame, wire),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
