//! Transport enum and internal backend trait.
//!
//! A transport moves whole encoded messages between two peers over one
//! long-lived duplex stream. The public API is the [`Transport`] enum; each
//! backend lives in its own module under `transport/` and implements the
//! internal [`TransportBackend`] trait.

use bytes::Bytes;

use crate::{BufferPool, TransportError};

pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError>;
    async fn recv_frame(&self) -> Result<Bytes, TransportError>;
    /// Finish the outbound half; the peer observes end of stream.
    async fn complete(&self) -> Result<(), TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
    fn buffer_pool(&self) -> &BufferPool;
}

#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "stream")]
    Stream(stream::StreamTransport),
}

impl Transport {
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send_frame(frame).await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.send_frame(frame).await,
        }
    }

    /// Receive the next message. Returns [`TransportError::Closed`] at end of stream.
    pub async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv_frame().await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.recv_frame().await,
        }
    }

    pub async fn complete(&self) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.complete().await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.complete().await,
        }
    }

    /// Mark the transport closed. Later sends and receives fail with `Closed`.
    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.is_closed(),
        }
    }

    /// Pool used for encoding outbound and buffering inbound messages.
    pub fn buffer_pool(&self) -> &BufferPool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.buffer_pool(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.buffer_pool(),
        }
    }

    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    #[cfg(feature = "stream")]
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(stream))
    }

    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
