use std::io::ErrorKind;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::codec::{check_length, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Reads complete frames from any `AsyncRead` stream.
///
/// Partial reads are handled internally; callers always get complete frames.
pub struct FrameReader<R> {
    inner: R,
    config: FrameConfig,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: R, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Read the next complete frame payload.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached, whether
    /// at a frame boundary or in the middle of a frame.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        match self.config.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.read_frame_inner())
                .await
                .map_err(|_| FrameError::Timeout {
                    op: "read",
                    timeout,
                })?,
            None => self.read_frame_inner().await,
        }
    }

    async fn read_frame_inner(&mut self) -> Result<Bytes> {
        let mut header = [0u8; HEADER_SIZE];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(map_read_error)?;

        let len = check_length(&header, self.config.max_payload_size)?;

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(map_read_error)?;

        trace!(len, "frame received");
        Ok(Bytes::from(payload))
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Update maximum payload size for subsequent frames.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn map_read_error(err: std::io::Error) -> FrameError {
    if err.kind() == ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    use super::*;
    use crate::codec::{encode_frame, DEFAULT_MAX_PAYLOAD};

    /// Yields one byte per poll, then EOF.
    struct ByteByByteReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for ByteByByteReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.pos < self.data.len() && buf.remaining() > 0 {
                let byte = self.data[self.pos];
                buf.put_slice(&[byte]);
                self.pos += 1;
            }
            Poll::Ready(Ok(()))
        }
    }

    /// Fails every read with the given error kind.
    struct FailingReader(ErrorKind);

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(self.0, "boom")))
        }
    }

    fn wire(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            encode_frame(payload, DEFAULT_MAX_PAYLOAD, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_reads_frames_from_slice() {
        let data = wire(&[&b"alpha"[..], &b"beta"[..]]);
        let mut reader = FrameReader::new(data.as_slice());

        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"alpha");
        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"beta");
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_byte_by_byte_matches_whole_stream() {
        let payloads: [&[u8]; 3] = [b"{\"type\":\"stop_record\"}", b"x", &[7u8; 300]];
        let data = wire(&payloads);

        let mut whole = FrameReader::new(data.as_slice());
        let mut trickle = FrameReader::new(ByteByByteReader {
            data: data.clone(),
            pos: 0,
        });

        for expected in payloads {
            let a = whole.read_frame().await.unwrap();
            let b = trickle.read_frame().await.unwrap();
            assert_eq!(a.as_ref(), expected);
            assert_eq!(a, b);
        }
        assert!(matches!(
            trickle.read_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_connection_closed() {
        let mut data = wire(&[&b"truncated payload"[..]]);
        data.truncate(HEADER_SIZE + 3);

        let mut reader = FrameReader::new(data.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_header_is_connection_closed() {
        let data = [0u8, 0u8];
        let mut reader = FrameReader::new(&data[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let data = [0u8, 0, 0, 0, b'x'];
        let mut reader = FrameReader::new(&data[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_without_reading_payload() {
        let data = 2048u32.to_be_bytes();
        let mut reader = FrameReader::with_config(
            &data[..],
            FrameConfig {
                max_payload_size: 1024,
                ..FrameConfig::default()
            },
        );
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::PayloadTooLarge {
                size: 2048,
                max: 1024
            })
        ));
    }

    #[tokio::test]
    async fn test_set_max_payload_size_applies_to_next_frame() {
        let data = wire(&[&b"0123456789"[..]]);
        let mut reader = FrameReader::new(data.as_slice());
        reader.set_max_payload_size(4);
        assert_eq!(reader.config().max_payload_size, 4);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::PayloadTooLarge { size: 10, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_io_error_is_propagated() {
        let mut reader = FrameReader::new(FailingReader(ErrorKind::ConnectionReset));
        match reader.read_frame().await {
            Err(FrameError::Io(err)) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frames_across_duplex() {
        let (mut client, server) = tokio::io::duplex(16);
        let data = wire(&[&b"over a small pipe"[..], &b"second"[..]]);

        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
        });

        let mut reader = FrameReader::new(server);
        assert_eq!(
            reader.read_frame().await.unwrap().as_ref(),
            b"over a small pipe"
        );
        assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"second");
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::with_config(
            server,
            FrameConfig {
                read_timeout: Some(Duration::from_millis(50)),
                ..FrameConfig::default()
            },
        );
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Timeout { op: "read", .. })
        ));
    }
}
