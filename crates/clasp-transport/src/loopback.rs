//! In-process transport
//!
//! Channel-backed sender/receiver halves with the same contract as the
//! network front-ends. Bridges attach to the router through these, and
//! the test suites drive sessions with them.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender};

pub struct LoopbackSender {
    tx: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
}

impl LoopbackSender {
    /// A sender plus the stream of frames pushed through it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                connected: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }
}

#[async_trait]
impl TransportSender for LoopbackSender {
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
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

pub struct LoopbackReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

impl LoopbackReceiver {
    /// A receiver plus the handle that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<TransportEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl TransportReceiver for LoopbackReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}
