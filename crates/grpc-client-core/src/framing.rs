//! gRPC wire message framing.
//!
//! Each message travels as a 5-byte header (1-byte compression flag plus a
//! 4-byte big-endian length) followed by the payload. A zero-length frame is
//! a valid empty message, distinct from end of stream. No compression codec
//! is implemented; the flag exists for wire compatibility only and outbound
//! frames always carry 0.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CallError, Result};
use crate::transport::TransportError;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 5;

/// Compression flag for an uncompressed payload.
pub const UNCOMPRESSED: u8 = 0;

fn io_err(err: std::io::Error) -> CallError {
    CallError::Transport(TransportError::from(err))
}

/// Outcome of reading the next frame from a byte stream.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete message payload.
    Message(Bytes),
    /// The stream ended cleanly at a frame boundary.
    EndOfStream,
}

/// Appends a framed message to `buf`: header then payload.
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_u8(UNCOMPRESSED);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Writes one framed message to `sink`.
pub async fn write_message<W: AsyncWrite + Unpin>(sink: &mut W, payload: &[u8]) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = UNCOMPRESSED;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    sink.write_all(&header).await.map_err(io_err)?;
    sink.write_all(payload).await.map_err(io_err)?;
    sink.flush().await.map_err(io_err)?;
    Ok(())
}

/// Reads the next framed message from `source`.
///
/// Zero bytes at the header boundary is a clean end of stream. One to four
/// header bytes followed by EOF is a truncation error, as is a payload
/// shorter than the declared length. Frames longer than `max_size` fail with
/// a resource-exhausted shaped error.
pub async fn read_message<R: AsyncRead + Unpin>(
    source: &mut R,
    max_size: usize,
) -> Result<ReadOutcome> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0usize;
    while filled < HEADER_SIZE {
        let n = source.read(&mut header[filled..]).await.map_err(io_err)?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::EndOfStream);
            }
            return Err(CallError::MessageTruncated {
                expected: HEADER_SIZE,
                got: filled,
            });
        }
        filled += n;
    }

    match header[0] {
        UNCOMPRESSED => {}
        1 => {
            return Err(CallError::InvalidFrame {
                reason: "compressed message received but no compression is configured".to_string(),
            })
        }
        flag => {
            return Err(CallError::InvalidFrame {
                reason: format!("unexpected compression flag {flag}"),
            })
        }
    }

    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if length > i32::MAX as usize {
        return Err(CallError::InvalidFrame {
            reason: format!("declared length {length} exceeds the protocol maximum"),
        });
    }
    if length > max_size {
        return Err(CallError::MessageTooLarge {
            size: length,
            max_size,
        });
    }

    let mut payload = BytesMut::zeroed(length);
    let mut got = 0usize;
    while got < length {
        let n = source.read(&mut payload[got..]).await.map_err(io_err)?;
        if n == 0 {
            return Err(CallError::MessageTruncated {
                expected: length,
                got,
            });
        }
        got += n;
    }
    Ok(ReadOutcome::Message(payload.freeze()))
}

/// Asserts that `source` has no further bytes.
///
/// Single-response calls expect exactly one message; trailing data after it
/// is a framing error.
pub async fn expect_end_of_stream<R: AsyncRead + Unpin>(source: &mut R) -> Result<()> {
    let mut probe = [0u8; 1];
    let n = source.read(&mut probe).await.map_err(io_err)?;
    if n != 0 {
        return Err(CallError::InvalidFrame {
            reason: "unexpected data after the single response message".to_string(),
        });
    }
    Ok(())
}
