//! Message framing
//!
//! Every message is `type:u8 | length:u16 (big-endian) | body`. In the JSON
//! dialect the body is a `{"msg": "..."}` envelope which is unwrapped on
//! read; bodies that fail to unwrap are handed back unchanged.

use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{HEADER_LEN, MAX_BODY_LEN, Message, MessageType, unwrap_json};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message body of {0} bytes exceeds the {max} byte limit", max = MAX_BODY_LEN)]
    BodyTooLarge(usize),
    #[error("failed to build JSON envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("connection closed by peer")]
    Closed,
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Serialize)]
struct Envelope<'a> {
    msg: &'a str,
}

/// Frame a message. In JSON mode the payload is wrapped in the envelope
/// first; non-UTF-8 payloads are converted lossily.
pub fn encode(msg_type: MessageType, payload: &[u8], json: bool) -> Result<Vec<u8>, CodecError> {
    let body = if json {
        let text = String::from_utf8_lossy(payload);
        serde_json::to_vec(&Envelope { msg: &text })?
    } else {
        payload.to_vec()
    };

    if body.len() > MAX_BODY_LEN {
        return Err(CodecError::BodyTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(msg_type.as_u8());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read exactly `n` bytes. EOF before the first byte is `Closed`, EOF
/// part-way through is `ShortRead`.
pub async fn read_exact<R>(reader: &mut R, n: usize) -> Result<Vec<u8>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Err(ReadError::Closed);
            }
            return Err(ReadError::ShortRead {
                expected: n,
                got: filled,
            });
        }
        filled += read;
    }
    Ok(buf)
}

/// Read one framed message.
pub async fn decode<R>(reader: &mut R, json: bool) -> Result<Message, ReadError>
where
    R: AsyncRead + Unpin,
{
    let header = read_exact(reader, HEADER_LEN).await?;
    let msg_type = MessageType::from_u8(header[0]);
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;

    let raw = if len == 0 {
        Vec::new()
    } else {
        match read_exact(reader, len).await {
            Ok(body) => body,
            // The header promised a body, so EOF here is a truncated frame.
            Err(ReadError::Closed) => {
                return Err(ReadError::ShortRead {
                    expected: len,
                    got: 0,
                });
            }
            Err(e) => return Err(e),
        }
    };

    let body = if json {
        unwrap_json(&raw).map(String::into_bytes).unwrap_or(raw)
    } else {
        raw
    };

    Ok(Message { msg_type, body })
}

/// Encode and write one message, flushing so TLS records go out immediately.
pub async fn write_message<W>(
    writer: &mut W,
    msg_type: MessageType,
    payload: &[u8],
    json: bool,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg_type, payload, json)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
