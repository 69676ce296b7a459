//! Async frame reader and writer
//!
//! [`FrameReader`] pulls whole frames off any [`AsyncRead`] (a TCP read half
//! in production, an in-memory duplex pipe in tests). A read that reaches
//! end-of-stream before a frame is complete is always reported as
//! [`ProtocolError::ConnectionBroken`]; the reader never yields a short frame.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use xrf_link::frame::FrameReader;
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> xrf_link::Result<()> {
//! let stream = TcpStream::connect("192.168.137.139:55204").await?;
//! let (read_half, _write_half) = stream.into_split();
//! let mut reader = FrameReader::new(read_half);
//! loop {
//!     let frame = reader.read_frame().await?;
//!     println!("{} ({} bytes)", frame.type_code, frame.payload.len());
//! }
//! # }
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use super::format::{Frame, FrameHeader, HEADER_SIZE, TRAILER, TRAILER_SIZE};
use crate::{ProtocolError, Result};

/// Reads complete frames from a byte stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte stream
    pub fn new(inner: R) -> Self {
        Self { inner, frames_read: 0 }
    }

    /// Number of frames read so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Consume the reader and return the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read exactly one frame.
    ///
    /// Blocks until 10 header bytes, `length` payload bytes and 4 trailer
    /// bytes have arrived.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        read_exact_or_broken(&mut self.inner, &mut header_bytes, "frame header").await?;
        let header = FrameHeader::parse(&header_bytes)?;

        let mut payload = vec![0u8; header.payload_len];
        read_exact_or_broken(&mut self.inner, &mut payload, "frame payload").await?;

        let mut trailer = [0u8; TRAILER_SIZE];
        read_exact_or_broken(&mut self.inner, &mut trailer, "frame trailer").await?;
        if trailer != TRAILER {
            warn!(
                type_code = %header.type_code,
                trailer = ?trailer,
                "Unexpected frame trailer, delivering frame anyway"
            );
        }

        self.frames_read += 1;
        trace!(type_code = %header.type_code, len = header.payload_len, "Frame read");

        Ok(Frame::new(header.type_code, payload))
    }
}

/// Write one complete frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = frame.encode();
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| ProtocolError::connection_broken_with_source("frame write failed", e))?;
    writer
        .flush()
        .await
        .map_err(|e| ProtocolError::connection_broken_with_source("frame flush failed", e))?;
    trace!(type_code = %frame.type_code, len = frame.payload.len(), "Frame written");
    Ok(())
}

async fn read_exact_or_broken<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            ProtocolError::connection_broken_with_source(
                format!("peer closed while reading {} ({} bytes expected)", what, buf.len()),
                e,
            ),
        ),
        Err(e) => Err(ProtocolError::connection_broken_with_source(
            format!("read of {} failed", what),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PREAMBLE, TypeCode, encode_frame};
    use proptest::prelude::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
            .block_on(future)
    }

    proptest! {
        #[test]
        fn prop_decode_of_encode_is_identity(
            code in any::<u16>(),
            payload in prop::collection::vec(any::<u8>(), 0..4096)
        ) {
            let bytes = encode_frame(TypeCode(code), &payload);
            let frame = block_on(async {
                let mut reader = FrameReader::new(bytes.as_slice());
                reader.read_frame().await
            }).expect("round trip");
            prop_assert_eq!(frame.type_code, TypeCode(code));
            prop_assert_eq!(frame.payload, payload);
        }
    }

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let mut bytes = encode_frame(TypeCode::XML, b"<Status parameter=\"Armed\">Yes</Status>");
        bytes.extend(encode_frame(TypeCode::SPECTRUM_ENERGY, &[0u8; 12]));

        let mut reader = FrameReader::new(bytes.as_slice());
        let first = reader.read_frame().await.unwrap();
        let second = reader.read_frame().await.unwrap();

        assert_eq!(first.type_code, TypeCode::XML);
        assert_eq!(second.type_code, TypeCode::SPECTRUM_ENERGY);
        assert_eq!(second.payload.len(), 12);
        assert_eq!(reader.frames_read(), 2);
    }

    #[tokio::test]
    async fn truncated_payload_is_connection_broken() {
        // Header declares 100 bytes, stream yields 40 and closes.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&PREAMBLE);
        bytes.extend_from_slice(&TypeCode::XML.to_le_bytes());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[b'x'; 40]);

        let mut reader = FrameReader::new(bytes.as_slice());
        match reader.read_frame().await {
            Err(ProtocolError::ConnectionBroken { .. }) => {}
            other => panic!("Expected ConnectionBroken, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_header_is_connection_broken() {
        let bytes = [0x03u8, 0x02, 0x00];
        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionBroken { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn missing_trailer_is_connection_broken() {
        let mut bytes = encode_frame(TypeCode::XML, b"<a/>");
        bytes.truncate(bytes.len() - 2);
        let mut reader = FrameReader::new(bytes.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::ConnectionBroken { .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_trailer_still_delivers_frame() {
        let mut bytes = encode_frame(TypeCode::XML, b"<a/>");
        let len = bytes.len();
        bytes[len - 1] = 0x00;
        let mut reader = FrameReader::new(bytes.as_slice());
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.payload, b"<a/>");
    }

    #[tokio::test]
    async fn write_frame_round_trips_through_duplex() {
        let (mut client, server) = tokio::io::duplex(1024);
        let frame = Frame::xml("<Command>Assay Start</Command>");
        write_frame(&mut client, &frame).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        let read_back = reader.read_frame().await.unwrap();
        assert_eq!(read_back, frame);
        assert!(matches!(reader.read_frame().await, Err(ProtocolError::ConnectionBroken { .. })));
    }
}
