//! Byte-stream transport handle.
//!
//! A [`Transport`] owns the two halves of an ordered reliable byte
//! stream behind async mutexes, so the reader task and the sequencer
//! task can run independently. Plain TCP, TLS-wrapped, WebSocket-wrapped
//! and caller-supplied streams all enter through the same constructors;
//! tuning profiles may swap the underlying stream at protocol quiescent
//! points with [`Transport::replace`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// What kind of stream backs a transport. Purely informational; the
/// framing layer treats all kinds identically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    WebSocket,
    External,
    InMemory,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    reader: AsyncMutex<BoxedReader>,
    writer: AsyncMutex<BoxedWriter>,
    closed: AtomicBool,
    kind: Mutex<TransportKind>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap a connected TCP stream.
    pub fn tcp(stream: TcpStream) -> Transport {
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let (reader, writer) = tokio::io::split(stream);
        Transport::build(
            Box::new(reader),
            Box::new(writer),
            TransportKind::Tcp,
            local,
            peer,
        )
    }

    /// Wrap any full-duplex stream (TLS session, WebSocket adapter,
    /// caller-supplied "external" socket).
    pub fn from_stream<S>(stream: S, kind: TransportKind) -> Transport
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Transport::build(Box::new(reader), Box::new(writer), kind, None, None)
    }

    /// Wrap separate read and write halves.
    pub fn from_split<R, W>(reader: R, writer: W, kind: TransportKind) -> Transport
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::build(Box::new(reader), Box::new(writer), kind, None, None)
    }

    /// An in-process transport pair, each end seeing the other's writes.
    pub fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(65536);
        (
            Transport::from_stream(a, TransportKind::InMemory),
            Transport::from_stream(b, TransportKind::InMemory),
        )
    }

    fn build(
        reader: BoxedReader,
        writer: BoxedWriter,
        kind: TransportKind,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) -> Transport {
        Transport {
            inner: Arc::new(TransportInner {
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
                closed: AtomicBool::new(false),
                kind: Mutex::new(kind),
                local,
                peer,
            }),
        }
    }

    /// Write the whole buffer and flush.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }

    /// Read whatever is available into `buf`. A return of `Ok(0)` means
    /// the peer half-closed the stream.
    pub async fn read_buf(&self, buf: &mut BytesMut) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let mut reader = self.inner.reader.lock().await;
        reader.read_buf(buf).await
    }

    /// Swap the underlying stream. The caller must have quiesced both
    /// directions first (reader paused, sequencer drained).
    pub async fn replace<S>(&self, stream: S, kind: TransportKind)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader_slot = self.inner.reader.lock().await;
        let mut writer_slot = self.inner.writer.lock().await;
        *reader_slot = Box::new(reader);
        *writer_slot = Box::new(writer);
        *self.inner.kind.lock() = kind;
    }

    /// Mark the transport closed. In-flight operations fail on their
    /// next use; no bytes are sent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Gracefully shut down the write half, then mark closed.
    pub async fn shutdown(&self) {
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> TransportKind {
        *self.inner.kind.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "transport closed")
}
