//! Newline framing over byte streams
//!
//! Packets are delimited by `\n`, so message boundaries survive partial reads.
//! [`FrameReader`] yields one frame at a time and enforces a maximum frame
//! size: an oversized frame is drained up to its terminator and reported as
//! [`ProtocolError::PacketSizeExceeded`], after which reading continues with
//! the next frame.

use crate::{Packet, ProtocolError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum packet size (10 MiB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Reads newline-delimited frames from an async byte stream
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader using [`MAX_PACKET_SIZE`] as the frame limit
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, MAX_PACKET_SIZE)
    }

    pub fn with_max_frame_size(reader: R, max_frame_size: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame_size,
        }
    }

    /// Read the next non-empty frame, without its terminator
    ///
    /// Returns `Ok(None)` on a clean end of stream. A stream that ends in the
    /// middle of a frame is a transport error.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut frame = Vec::new();
        let mut oversized = 0usize;

        loop {
            let available = self
                .inner
                .fill_buf()
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "reading frame"))?;

            if available.is_empty() {
                if frame.is_empty() && oversized == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::NetworkError(
                    "stream closed in the middle of a frame".to_string(),
                ));
            }

            match available.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    if oversized == 0 {
                        frame.extend_from_slice(&available[..end]);
                    } else {
                        oversized += end;
                    }
                    self.inner.consume(end + 1);

                    if oversized > 0 {
                        return Err(ProtocolError::PacketSizeExceeded(
                            oversized,
                            self.max_frame_size,
                        ));
                    }
                    if frame.last() == Some(&b'\r') {
                        frame.pop();
                    }
                    if frame.iter().all(u8::is_ascii_whitespace) {
                        frame.clear();
                        continue;
                    }
                    if frame.len() > self.max_frame_size {
                        return Err(ProtocolError::PacketSizeExceeded(
                            frame.len(),
                            self.max_frame_size,
                        ));
                    }
                    return Ok(Some(frame));
                }
                None => {
                    let len = available.len();
                    if oversized == 0 {
                        frame.extend_from_slice(available);
                        if frame.len() > self.max_frame_size {
                            oversized = frame.len();
                            frame = Vec::new();
                        }
                    } else {
                        oversized += len;
                    }
                    self.inner.consume(len);
                }
            }
        }
    }

    /// Read and decode the next packet
    ///
    /// Format errors are returned as-is; callers that want to skip malformed
    /// frames check [`ProtocolError::category`].
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        match self.next_frame().await? {
            Some(frame) => Packet::from_bytes(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Encode and write one packet, flushing afterwards
///
/// Packets larger than [`MAX_PACKET_SIZE`] are refused before anything is
/// written.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_packet_with_limit(writer, packet, MAX_PACKET_SIZE).await
}

/// [`write_packet`] with a caller-chosen frame limit
///
/// An oversized packet yields [`ProtocolError::PacketSizeExceeded`] and leaves
/// the stream untouched.
pub async fn write_packet_with_limit<W>(
    writer: &mut W,
    packet: &Packet,
    max_frame_size: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    let frame_len = bytes.len() - 1;
    if frame_len > max_frame_size {
        return Err(ProtocolError::PacketSizeExceeded(frame_len, max_frame_size));
    }
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, "writing packet"))?;
    writer
        .flush()
        .await
        .map_err(|e| ProtocolError::from_io_error(e, "flushing packet"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCategory;
    use serde_json::json;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let mock = Builder::new()
            .read(br#"{"id":1,"type":"kdeconnect.ping","#)
            .read(b"\"body\":{}}\n{\"id\":2,")
            .read(b"\"type\":\"kdeconnect.ping\",\"body\":{\"n\":2}}\n")
            .build();
        let mut reader = FrameReader::new(mock);

        let first = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        let second = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(second.body, json!({"n": 2}));
        assert!(reader.next_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_lines_are_skipped() {
        let mock = Builder::new()
            .read(b"\n\r\n{\"id\":1,\"type\":\"a.b\",\"body\":{}}\r\n")
            .build();
        let mut reader = FrameReader::new(mock);

        let packet = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(packet.packet_type, "a.b");
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_poison_stream() {
        let mock = Builder::new()
            .read(b"{garbage\n{\"id\":7,\"type\":\"a.b\",\"body\":{}}\n")
            .build();
        let mut reader = FrameReader::new(mock);

        let err = reader.next_packet().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Format);

        let packet = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(packet.id, 7);
    }

    #[tokio::test]
    async fn test_oversized_frame_reports_total_size() {
        let mock = Builder::new().read(b"0123456789").read(b"abcdef\n").build();
        let mut reader = FrameReader::with_max_frame_size(mock, 8);

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, ProtocolError::PacketSizeExceeded(16, 8)));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_then_valid_frame() {
        let mock = Builder::new()
            .read(b"xxxxxxxxxxxxxxxxxxxxxxxx")
            .read(b"xxxx\n{\"id\":4,\"type\":\"a.b\",\"body\":{}}\n")
            .build();
        let mut reader = FrameReader::with_max_frame_size(mock, 20);

        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Format);

        let packet = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(packet.id, 4);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_transport_error() {
        let mock = Builder::new().read(b"{\"id\":1,").build();
        let mut reader = FrameReader::new(mock);

        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transport);
    }

    #[tokio::test]
    async fn test_write_packet() {
        let packet = Packet::with_id(5, "kdeconnect.ping", json!({}));
        let expected = packet.to_bytes().unwrap();
        let mut mock = Builder::new().write(&expected).build();

        write_packet(&mut mock, &packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_packet_is_not_written() {
        let packet = Packet::with_id(6, "test.big", json!({"filler": "x".repeat(64)}));
        // any write would fail the mock
        let mut mock = Builder::new().build();

        let err = write_packet_with_limit(&mut mock, &packet, 32)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PacketSizeExceeded(_, 32)));
        assert_eq!(err.category(), ErrorCategory::Format);
    }
}
