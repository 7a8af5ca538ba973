//! Envelope codec: 4-byte big-endian length prefix followed by the
//! postcard-serialized message body.
//!
//! A malformed frame leaves the byte stream unsynchronized. There are no
//! resync markers, so every decode failure must end the connection.

use super::{Message, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Default cap on a frame body accepted from the network.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Serialize a message and prepend its body length.
///
/// No size cap is enforced here.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = postcard::to_allocvec(message).map_err(ProtocolError::Encode)?;
    let len = u32::try_from(body.len())
        .map_err(|_| ProtocolError::MalformedFrame(format!("body of {} bytes", body.len())))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode exactly one frame.
///
/// Fails if fewer bytes are available than the header declares, if bytes
/// follow the declared body, or if the body does not deserialize.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::FrameTooShort {
            expected: HEADER_SIZE,
            got: bytes.len(),
        });
    }
    let declared = body_length(&bytes[..HEADER_SIZE]);
    let body = &bytes[HEADER_SIZE..];
    if body.len() < declared {
        return Err(ProtocolError::FrameTooShort {
            expected: HEADER_SIZE + declared,
            got: bytes.len(),
        });
    }
    if body.len() > declared {
        return Err(ProtocolError::MalformedFrame(format!(
            "{} trailing bytes after frame",
            body.len() - declared
        )));
    }
    decode_body(body)
}

/// Decode a frame body without its header. The whole slice must be consumed.
pub fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let (message, rest) = postcard::take_from_bytes::<Message>(body)
        .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    if !rest.is_empty() {
        return Err(ProtocolError::MalformedFrame(format!(
            "body has {} unread bytes",
            rest.len()
        )));
    }
    Ok(message)
}

/// Body length declared by a header.
pub fn body_length(header: &[u8]) -> usize {
    let mut prefix = [0u8; HEADER_SIZE];
    prefix.copy_from_slice(&header[..HEADER_SIZE]);
    u32::from_be_bytes(prefix) as usize
}

/// Split one complete message off the front of `buf`.
///
/// Returns `Ok(None)` while the buffered bytes hold less than a whole
/// frame, leaving them in place for the next read.
pub fn take_message(buf: &mut Vec<u8>, max_frame_size: usize) -> Result<Option<Message>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let len = body_length(buf);
    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            max: max_frame_size,
            got: len,
        });
    }
    if buf.len() < HEADER_SIZE + len {
        return Ok(None);
    }
    let frame: Vec<u8> = buf.drain(..HEADER_SIZE + len).collect();
    decode(&frame).map(Some)
}

/// Read one raw frame (header included) from a stream.
///
/// Returns `Ok(None)` on a clean end of stream before any header byte.
/// A stream that ends inside a frame yields an I/O error of kind
/// `UnexpectedEof`. A declared length above `max_frame_size` is rejected
/// before the body is read.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = body_length(&header);
    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            max: max_frame_size,
            got: len,
        });
    }

    let mut frame = vec![0u8; HEADER_SIZE + len];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_SIZE..]).await?;
    Ok(Some(frame))
}

/// Read and decode one message.
pub async fn read_message<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match read_frame(reader, max_frame_size).await? {
        Some(frame) => decode(&frame).map(Some),
        None => Ok(None),
    }
}

/// Encode and write one message, flushing the stream.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
