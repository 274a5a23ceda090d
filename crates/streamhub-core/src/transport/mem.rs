use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{BufferPool, TransportError};

use super::TransportBackend;

const CHANNEL_CAPACITY: usize = 64;

/// In-process transport: two bounded channels, one per direction.
#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
    buffer_pool: BufferPool,
}

#[derive(Debug)]
struct MemInner {
    /// `None` once the outbound half has been completed.
    tx: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let side = |tx, rx| Self {
            inner: Arc::new(MemInner {
                tx: parking_lot::Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
            }),
            buffer_pool: BufferPool::new(),
        };

        (side(tx_b, rx_a), side(tx_a, rx_b))
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for MemTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let tx = self.inner.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn complete(&self) -> Result<(), TransportError> {
        self.inner.tx.lock().take();
        Ok(())
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }

    fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_in_both_directions() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&b.recv_frame().await.unwrap()[..], b"ping");
        b.send_frame(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(&a.recv_frame().await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn complete_signals_end_of_stream() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Bytes::from_static(b"last")).await.unwrap();
        a.complete().await.unwrap();
        assert_eq!(&b.recv_frame().await.unwrap()[..], b"last");
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
        assert!(matches!(
            a.send_frame(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
