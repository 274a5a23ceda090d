//! Ordered outbound queue with a single writer.
//!
//! Any number of tasks may enqueue encoded messages; exactly one writer loop
//! drains the queue onto the transport, so messages reach the wire whole and in
//! enqueue order.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{RpcError, Transport, TransportError};

/// Producer side of the queue. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct WriteQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

/// Consumer side, owned by the writer loop.
#[derive(Debug)]
pub struct WriteQueueReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

pub fn write_queue() -> (WriteQueue, WriteQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        WriteQueue {
            tx: Mutex::new(Some(tx)),
        },
        WriteQueueReceiver { rx },
    )
}

impl WriteQueue {
    /// Append a message. Fails once the queue has been completed.
    pub fn enqueue(&self, frame: Bytes) -> Result<(), RpcError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(RpcError::Disposed)?;
        tx.send(frame).map_err(|_| RpcError::Disposed)
    }

    /// Stop accepting messages. The writer flushes what is queued, then exits.
    pub fn complete(&self) {
        self.tx.lock().take();
    }

    pub fn is_completed(&self) -> bool {
        self.tx.lock().as_ref().is_none_or(|tx| tx.is_closed())
    }
}

impl WriteQueueReceiver {
    /// Write queued messages to `transport` until the queue completes, then
    /// finish the transport's outbound half.
    ///
    /// Returns early with the first transport error.
    pub async fn drain_into(mut self, transport: &Transport) -> Result<(), TransportError> {
        while let Some(frame) = self.rx.recv().await {
            let len = frame.len();
            transport.send_frame(frame).await?;
            tracing::trace!(len, "write loop: frame written");
        }
        tracing::debug!("write loop: queue completed");
        transport.complete().await
    }
}
