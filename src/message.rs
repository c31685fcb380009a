use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard protocol ceiling: the frame header is a u16, so a payload can never
/// exceed 65535 bytes.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// One chat protocol message, discriminated on the wire by its `command` field.
///
/// The `Text` channel key is omitted from the payload when the sender is not
/// explicitly channel-scoping the message; the server routes by the sender's
/// registry state either way.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Message {
    Register {
        user: String,
    },
    Join {
        channel: String,
    },
    #[serde(rename = "message")]
    Text {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        ts: u64,
    },
}

impl Message {
    /// Builds a chat line stamped with the current Unix time.
    pub fn text(message: impl Into<String>, channel: Option<String>) -> Self {
        Message::Text {
            message: message.into(),
            channel,
            ts: unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A full frame arrived but its payload did not parse as a known message
    /// shape. The raw bytes are kept so callers can log the offending input.
    #[error("malformed payload: {}", String::from_utf8_lossy(.raw))]
    Malformed {
        raw: Vec<u8>,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload is {0} bytes, over the {MAX_PAYLOAD}-byte frame limit")]
    Oversized(usize),
}

/// Serializes a message into a complete frame: a big-endian u16 payload
/// length followed by the JSON payload.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(message).map_err(to_io_error)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::Oversized(payload.len()));
    }

    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads exactly one frame from the stream.
///
/// `Ok(None)` means the peer closed the stream before the next header — a
/// clean disconnect, distinct from a frame whose payload fails to parse.
/// Short reads are retried until the full payload is available.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    match serde_json::from_slice(&payload) {
        Ok(message) => Ok(Some(message)),
        Err(source) => Err(WireError::Malformed {
            raw: payload,
            source,
        }),
    }
}

/// Encodes a message and writes the whole frame, flushing so peers get
/// timely delivery.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
