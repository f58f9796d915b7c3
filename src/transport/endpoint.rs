//! Transport Endpoint
//!
//! One endpoint type over the four supported transports. An endpoint is split
//! into a reader and a writer when its session goes active so that the two
//! forwarding directions can run as independent tasks.
//!
//! - `read()` yields at most one buffer-sized chunk, or `None` at end-of-stream.
//! - `write()` sends the whole chunk and waits until the transport accepts it.
//! - `close()` is idempotent.
//!
//! TLS halves share the underlying connection through `tokio::io::split`,
//! which serializes access, so closing one half never races the other.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{tcp, unix, TcpStream, UnixStream};
use tokio_rustls::TlsStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use super::stream::SocketStream;
use super::tls::peer_common_name;
use crate::error::RelayError;

/// WebSocket connection over plain or TLS TCP
pub type WsStream = WebSocketStream<SocketStream>;

/// A connected transport, exclusively owned by one relay session
pub enum Endpoint {
    /// Plain TCP stream
    Tcp(TcpStream),
    /// TLS over TCP, client or server role
    Tls(Box<TlsStream<TcpStream>>),
    /// Unix domain stream socket
    Unix(UnixStream),
    /// WebSocket; binary messages are chunks, other frames are ignored
    WebSocket(Box<WsStream>),
}

impl Endpoint {
    /// Short transport name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Tls(_) => "tls",
            Endpoint::Unix(_) => "unix",
            Endpoint::WebSocket(ws) if ws.get_ref().is_encrypted() => "wss",
            Endpoint::WebSocket(_) => "ws",
        }
    }

    /// Common name of the peer certificate, for TLS transports that received one
    pub fn peer_identity(&self) -> Option<String> {
        match self {
            Endpoint::Tls(tls) => peer_common_name(tls),
            Endpoint::WebSocket(ws) => match ws.get_ref() {
                SocketStream::Tls(tls) => peer_common_name(tls),
                SocketStream::Plain(_) => None,
            },
            _ => None,
        }
    }

    /// Split into independently owned read and write halves
    pub fn split(self, buffer_size: usize) -> (EndpointReader, EndpointWriter) {
        let (reader, writer) = match self {
            Endpoint::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (ReaderInner::Tcp(r), WriterInner::Tcp(w))
            }
            Endpoint::Tls(stream) => {
                let (r, w) = tokio::io::split(*stream);
                (ReaderInner::Tls(r), WriterInner::Tls(w))
            }
            Endpoint::Unix(stream) => {
                let (r, w) = stream.into_split();
                (ReaderInner::Unix(r), WriterInner::Unix(w))
            }
            Endpoint::WebSocket(ws) => {
                let (sink, stream) = (*ws).split();
                (ReaderInner::WebSocket(stream), WriterInner::WebSocket(sink))
            }
        };

        (
            EndpointReader {
                inner: reader,
                buf: vec![0u8; buffer_size.max(1)].into_boxed_slice(),
            },
            EndpointWriter {
                inner: writer,
                closed: false,
            },
        )
    }
}

enum ReaderInner {
    Tcp(tcp::OwnedReadHalf),
    Tls(ReadHalf<TlsStream<TcpStream>>),
    Unix(unix::OwnedReadHalf),
    WebSocket(SplitStream<WsStream>),
}

/// Read half of an endpoint
pub struct EndpointReader {
    inner: ReaderInner,
    buf: Box<[u8]>,
}

impl EndpointReader {
    /// Next chunk from the peer, or `None` once it has stopped sending
    pub async fn read(&mut self) -> Result<Option<Bytes>, RelayError> {
        let n = match &mut self.inner {
            ReaderInner::Tcp(r) => r.read(&mut self.buf).await?,
            ReaderInner::Tls(r) => r.read(&mut self.buf).await?,
            ReaderInner::Unix(r) => r.read(&mut self.buf).await?,
            ReaderInner::WebSocket(stream) => return read_message(stream).await,
        };

        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
        }
    }
}

async fn read_message(stream: &mut SplitStream<WsStream>) -> Result<Option<Bytes>, RelayError> {
    loop {
        match stream.next().await {
            None => return Ok(None),
            Some(Ok(Message::Binary(data))) => {
                if data.is_empty() {
                    continue;
                }
                return Ok(Some(Bytes::from(data)));
            }
            Some(Ok(Message::Close(frame))) => {
                trace!(?frame, "WebSocket close frame received");
                return Ok(None);
            }
            Some(Ok(other)) => {
                trace!(len = other.len(), "Ignoring non-binary WebSocket frame");
            }
            Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

enum WriterInner {
    Tcp(tcp::OwnedWriteHalf),
    Tls(WriteHalf<TlsStream<TcpStream>>),
    Unix(unix::OwnedWriteHalf),
    WebSocket(SplitSink<WsStream, Message>),
}

/// Write half of an endpoint
pub struct EndpointWriter {
    inner: WriterInner,
    closed: bool,
}

impl EndpointWriter {
    /// Send one chunk, waiting for the transport to accept all of it
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), RelayError> {
        if self.closed {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }

        match &mut self.inner {
            WriterInner::Tcp(w) => w.write_all(chunk).await?,
            WriterInner::Tls(w) => {
                w.write_all(chunk).await?;
                w.flush().await?;
            }
            WriterInner::Unix(w) => w.write_all(chunk).await?,
            WriterInner::WebSocket(sink) => sink.send(Message::Binary(chunk.to_vec())).await?,
        }
        Ok(())
    }

    /// Shut the write side down; later calls are no-ops
    pub async fn close(&mut self) -> Result<(), RelayError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match &mut self.inner {
            WriterInner::Tcp(w) => w.shutdown().await?,
            WriterInner::Tls(w) => w.shutdown().await?,
            WriterInner::Unix(w) => w.shutdown().await?,
            WriterInner::WebSocket(sink) => match sink.close().await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unix_read_write_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        let (mut a_reader, mut a_writer) = Endpoint::Unix(a).split(8192);
        let (mut b_reader, mut b_writer) = Endpoint::Unix(b).split(8192);

        a_writer.write(b"hello").await.unwrap();
        let chunk = b_reader.read().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");

        b_writer.write(b"world").await.unwrap();
        let chunk = a_reader.read().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"world");

        a_writer.close().await.unwrap();
        assert!(b_reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_is_bounded_by_buffer_size() {
        let (a, b) = UnixStream::pair().unwrap();
        let (_a_reader, mut a_writer) = Endpoint::Unix(a).split(8192);
        let (mut b_reader, _b_writer) = Endpoint::Unix(b).split(1024);

        a_writer.write(&[7u8; 4096]).await.unwrap();
        let chunk = b_reader.read().await.unwrap().unwrap();
        assert!(chunk.len() <= 1024);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = UnixStream::pair().unwrap();
        let (_reader, mut writer) = Endpoint::Unix(a).split(8192);

        writer.close().await.unwrap();
        assert!(writer.is_closed());
        writer.close().await.unwrap();
        assert!(writer.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_kind_labels() {
        let (a, _b) = UnixStream::pair().unwrap();
        let endpoint = Endpoint::Unix(a);
        assert_eq!(endpoint.kind(), "unix");
        assert!(endpoint.peer_identity().is_none());
    }
}
