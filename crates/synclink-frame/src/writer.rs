use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::codec::{encode_frame, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `AsyncWrite` stream.
///
/// Header and payload go out as one buffer, so a single writer never
/// interleaves frames.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: W, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Frame and send a payload, then flush.
    ///
    /// Returns the number of bytes put on the wire (header included).
    /// Empty and oversized payloads are refused before anything is written.
    pub async fn send(&mut self, payload: &[u8]) -> Result<usize> {
        self.buf.clear();
        encode_frame(payload, self.config.max_payload_size, &mut self.buf)?;

        match self.config.write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.write_buffered())
                .await
                .map_err(|_| FrameError::Timeout {
                    op: "write",
                    timeout,
                })??,
            None => self.write_buffered().await?,
        }

        trace!(len = payload.len(), "frame sent");
        Ok(HEADER_SIZE + payload.len())
    }

    async fn write_buffered(&mut self) -> Result<()> {
        self.inner.write_all(&self.buf).await.map_err(map_write_error)?;
        self.inner.flush().await.map_err(map_write_error)?;
        Ok(())
    }

    /// Flush the underlying stream.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.map_err(map_write_error)
    }

    /// Shut down the write half of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(map_write_error)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn map_write_error(err: std::io::Error) -> FrameError {
    match err.kind() {
        std::io::ErrorKind::WriteZero | std::io::ErrorKind::BrokenPipe => {
            FrameError::ConnectionClosed
        }
        _ => FrameError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;
    use crate::codec::DEFAULT_MAX_PAYLOAD;
    use crate::reader::FrameReader;

    /// Accepts at most one byte per poll.
    #[derive(Default)]
    struct SlowWriter {
        data: Vec<u8>,
        flushes: usize,
    }

    impl AsyncWrite for SlowWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            self.data.push(buf[0]);
            Poll::Ready(Ok(1))
        }

        fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            self.flushes += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Reports a closed peer on every write.
    struct ClosedWriter;

    impl AsyncWrite for ClosedWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_send_writes_header_and_payload() {
        let mut writer = FrameWriter::new(Vec::new());
        let written = writer.send(b"abc").await.unwrap();

        assert_eq!(written, HEADER_SIZE + 3);
        assert_eq!(writer.get_ref().as_slice(), &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_partial_writes_complete_and_flush() {
        let mut writer = FrameWriter::new(SlowWriter::default());
        writer.send(b"hello").await.unwrap();

        let inner = writer.into_inner();
        assert_eq!(inner.data, [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(inner.flushes, 1);
    }

    #[tokio::test]
    async fn test_refuses_empty_and_oversized_before_writing() {
        let mut writer = FrameWriter::with_config(
            Vec::new(),
            FrameConfig {
                max_payload_size: 4,
                ..FrameConfig::default()
            },
        );

        assert!(matches!(writer.send(b"").await, Err(FrameError::EmptyFrame)));
        assert!(matches!(
            writer.send(b"too long").await,
            Err(FrameError::PayloadTooLarge { size: 8, max: 4 })
        ));
        assert!(writer.get_ref().is_empty());
    }

    #[tokio::test]
    async fn test_closed_peer_reports_connection_closed() {
        let mut writer = FrameWriter::new(ClosedWriter);
        assert!(matches!(
            writer.send(b"x").await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_reader_over_duplex() {
        let (client, server) = tokio::io::duplex(8);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let sender = tokio::spawn(async move {
            writer.send(b"{\"type\":\"stop_record\"}").await.unwrap();
            writer.send(&vec![1u8; 1000]).await.unwrap();
        });

        assert_eq!(
            reader.read_frame().await.unwrap().as_ref(),
            b"{\"type\":\"stop_record\"}"
        );
        assert_eq!(reader.read_frame().await.unwrap().len(), 1000);
        sender.await.unwrap();
    }

    #[test]
    fn test_default_config_limit() {
        let writer = FrameWriter::new(Vec::<u8>::new());
        assert_eq!(writer.config().max_payload_size, DEFAULT_MAX_PAYLOAD);
        assert!(writer.config().write_timeout.is_none());
    }
}
