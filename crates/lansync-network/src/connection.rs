//! Framed connection carrying envelopes and raw chunk frames

use crate::codec::FrameCodec;
use crate::protocol::{Envelope, Message};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use lansync_types::{Error, PeerId, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// One transfer-channel connection.
///
/// Generic over the byte stream so sessions can run over TCP in production
/// and over in-memory pipes in tests.
#[derive(Debug)]
pub struct Connection<S> {
    framed: Framed<S, FrameCodec>,
    local_id: PeerId,
    remote: String,
    read_timeout: Option<Duration>,
}

impl Connection<TcpStream> {
    /// Open a TCP connection
    pub async fn connect(
        addr: SocketAddr,
        local_id: impl Into<PeerId>,
        connect_timeout: Duration,
        max_frame_size: usize,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout {
                millis: connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| Error::network(format!("Failed to connect to {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::network(format!("Failed to configure socket: {}", e)))?;

        Ok(Self::new(stream, local_id, addr.to_string(), max_frame_size))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream
    pub fn new(
        stream: S,
        local_id: impl Into<PeerId>,
        remote: impl Into<String>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new(max_frame_size)),
            local_id: local_id.into(),
            remote: remote.into(),
            read_timeout: None,
        }
    }

    /// Fail reads that take longer than `timeout`
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Remote endpoint label used in logs
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Seal and send a message
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let envelope = Envelope::seal(self.local_id.clone(), message)?;
        self.send_envelope(&envelope).await
    }

    /// Send a sealed envelope as one control frame
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        debug!("-> {} {}", self.remote, envelope.message_type);
        let body = Bytes::from(envelope.to_bytes()?);
        self.send_raw(body).await
    }

    /// Send one raw frame
    pub async fn send_raw(&mut self, data: Bytes) -> Result<()> {
        self.framed.send(data).await.map_err(into_transport_error)
    }

    /// Next frame body, `None` on a clean close between frames
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>> {
        let next = match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.framed.next())
                .await
                .map_err(|_| Error::Timeout {
                    millis: timeout.as_millis() as u64,
                })?,
            None => self.framed.next().await,
        };

        next.transpose().map_err(into_transport_error)
    }

    /// Next control envelope, `None` on a clean close
    pub async fn recv_envelope(&mut self) -> Result<Option<Envelope>> {
        match self.recv_frame().await? {
            Some(frame) => {
                let envelope = Envelope::from_bytes(&frame)?;
                debug!("<- {} {}", self.remote, envelope.message_type);
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    /// Next decoded message; a close here is an error
    pub async fn expect_message(&mut self) -> Result<Message> {
        match self.recv_envelope().await? {
            Some(envelope) => envelope.open(),
            None => Err(Error::network(format!(
                "Connection to {} closed unexpectedly",
                self.remote
            ))),
        }
    }

    /// Next raw frame; a close here is an error
    pub async fn expect_raw(&mut self) -> Result<Bytes> {
        match self.recv_frame().await? {
            Some(frame) => Ok(frame),
            None => Err(Error::network(format!(
                "Connection to {} closed before chunk data",
                self.remote
            ))),
        }
    }

    /// Flush and shut down the write half
    pub async fn close(mut self) -> Result<()> {
        self.framed.close().await.map_err(into_transport_error)
    }
}

/// Socket errors surface as `Io` through the codec; on a connection they
/// mean the stream is gone.
fn into_transport_error(error: Error) -> Error {
    match error {
        Error::Io { message } => Error::Network { message },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileRequest;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_messages_and_raw_frames_interleave() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut left = Connection::new(a, "left", "pipe", 1024 * 1024);
        let mut right = Connection::new(b, "right", "pipe", 1024 * 1024);

        let request = Message::FileRequest(FileRequest {
            path: "x.bin".to_string(),
        });
        left.send_message(&request).await.unwrap();
        left.send_raw(Bytes::from_static(&[1, 2, 3])).await.unwrap();

        let envelope = right.recv_envelope().await.unwrap().unwrap();
        assert_eq!(envelope.sender, "left");
        assert_eq!(envelope.open().unwrap(), request);
        assert_eq!(right.expect_raw().await.unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[tokio::test]
    async fn test_clean_close_and_unexpected_close() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Connection::new(a, "left", "pipe", 1024);
        let mut right = Connection::new(b, "right", "pipe", 1024);

        left.close().await.unwrap();
        assert!(right.recv_envelope().await.unwrap().is_none());

        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let mut right = Connection::new(b, "right", "pipe", 1024);
        let err = right.expect_message().await.unwrap_err();
        assert!(err.is_connection_fatal());
    }

    #[tokio::test]
    async fn test_garbage_is_a_protocol_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut right = Connection::new(b, "right", "pipe", 1024);
        let err = right.recv_envelope().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (_a, b) = tokio::io::duplex(1024);
        let mut right =
            Connection::new(b, "right", "pipe", 1024).with_read_timeout(Duration::from_millis(20));
        let err = right.recv_frame().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
