use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::{BufferPool, TransportError};

use super::TransportBackend;

/// Largest message accepted from the peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Transport over any byte stream; each message is prefixed with its length
/// as a little-endian `u32`.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    buffer_pool: BufferPool,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::with_buffer_pool(stream, BufferPool::new())
    }

    pub fn with_buffer_pool<S>(stream: S, buffer_pool: BufferPool) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                buffer_pool,
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for StreamTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&(frame.len() as u32).to_le_bytes()).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;

        // EOF before a length prefix is a clean close; anywhere later it is a fault.
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;
        let frame_len = u32::from_le_bytes(len_buf) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: frame_len,
                max: MAX_FRAME_LEN,
            });
        }

        let mut buf = self.inner.buffer_pool.get();
        buf.resize(frame_len, 0);
        reader.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }

    async fn complete(&self) -> Result<(), TransportError> {
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }

    fn buffer_pool(&self) -> &BufferPool {
        &self.inner.buffer_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn length_prefixed_roundtrip() {
        let (a, b) = StreamTransport::pair();
        a.send_frame(Bytes::from_static(&[0x92, 0x01, 0xc0]))
            .await
            .unwrap();
        a.send_frame(Bytes::new()).await.unwrap();
        assert_eq!(&b.recv_frame().await.unwrap()[..], &[0x92, 0x01, 0xc0]);
        assert!(b.recv_frame().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_reads_as_closed() {
        let (a, b) = StreamTransport::pair();
        a.complete().await.unwrap();
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_body_is_an_io_error() {
        let (client, server) = tokio::io::duplex(64);
        let transport = StreamTransport::new(server);
        let (_, mut raw) = tokio::io::split(client);
        raw.write_all(&10u32.to_le_bytes()).await.unwrap();
        raw.write_all(&[1, 2, 3]).await.unwrap();
        raw.shutdown().await.unwrap();

        match transport.recv_frame().await {
            Err(TransportError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("truncated frame should fail with an I/O error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let transport = StreamTransport::new(server);
        let (_, mut raw) = tokio::io::split(client);
        raw.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        assert!(matches!(
            transport.recv_frame().await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }
}
