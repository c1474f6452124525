//! Wire framing
//!
//! Every message on a stream connection is a little-endian `u32` length
//! followed by exactly that many payload bytes. The first frame a
//! subscriber sends is the handshake: an 8-byte payload holding the
//! requested stream id.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{StreamId, StreamingError};

/// Size of the length prefix
pub const FRAME_HEADER_SIZE: usize = 4;

/// Payload size of the handshake frame
pub const HANDSHAKE_SIZE: usize = 8;

/// Default upper bound for a received frame (64 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Write one length-prefixed frame
///
/// # Errors
/// Transport errors, or a payload longer than `u32::MAX`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds u32 length", payload.len()),
        )
    })?;
    let header = len.to_le_bytes();
    let mut frame = Buf::chain(&header[..], payload);
    writer.write_all_buf(&mut frame).await?;
    writer.flush().await
}

/// Read one length-prefixed frame
///
/// Returns `Ok(None)` when the peer closed the connection on a frame
/// boundary.
///
/// # Errors
/// Transport errors, a frame longer than `max_frame_size`, or EOF in the
/// middle of a frame (header included).
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Bytes>, StreamingError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let filled = reader.read(&mut header).await?;
    if filled == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[filled..]).await?;
    let len = u32::from_le_bytes(header) as usize;

    if len > max_frame_size {
        return Err(StreamingError::malformed_frame(format!(
            "frame of {len} bytes exceeds limit of {max_frame_size}"
        )));
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload.freeze()))
}

/// Send the handshake requesting `stream_id`
pub async fn write_handshake<W>(writer: &mut W, stream_id: StreamId) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &stream_id.to_le_bytes()).await
}

/// Receive the handshake and return the requested stream id
///
/// # Errors
/// `MalformedFrame` if the connection closes first or the payload is not
/// exactly [`HANDSHAKE_SIZE`] bytes.
pub async fn read_handshake<R>(reader: &mut R) -> Result<StreamId, StreamingError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, HANDSHAKE_SIZE)
        .await?
        .ok_or_else(|| StreamingError::malformed_frame("connection closed before handshake"))?;

    if frame.len() != HANDSHAKE_SIZE {
        return Err(StreamingError::malformed_frame(format!(
            "handshake payload of {} bytes, expected {}",
            frame.len(),
            HANDSHAKE_SIZE
        )));
    }

    Ok((&frame[..]).get_u64_le())
}
