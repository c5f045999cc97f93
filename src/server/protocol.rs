//! Wire protocol for the log service.
//!
//! Every frame is a 4-byte big-endian length followed by a bincode body.
//! Encoding and decoding are pure functions; the async helpers below only
//! move bytes.

use crate::commitlog::Record;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Object every ACL check is made against.
pub const OBJECT_WILDCARD: &str = "*";
/// Action required to append records.
pub const PRODUCE_ACTION: &str = "produce";
/// Action required to read records.
pub const CONSUME_ACTION: &str = "consume";

/// Client requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Append a value to the log
    Produce { value: Vec<u8> },
    /// Read the record at an offset
    Consume { offset: u64 },
    /// Stream records from an offset onward, optionally only those first
    /// accepted by `origin`. When `log_instance` names a log other than the
    /// one being served, `offset` is stale and the stream starts at 0.
    ConsumeStream {
        offset: u64,
        origin: Option<String>,
        log_instance: Option<String>,
    },
}

/// Error categories carried in [`Response::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    OffsetOutOfRange,
    PermissionDenied,
    Unavailable,
    Internal,
}

/// Server responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Produced { offset: u64 },
    Record(Record),
    Error { code: ErrorCode, message: String },
}

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a message as a length-prefixed frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body.
pub fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, FrameError> {
    Ok(bincode::deserialize(body)?)
}

/// Write one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_prefixes_length() {
        let frame = encode_frame(&Request::Consume { offset: 3 }).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded: Request = decode_body(&frame[4..]).unwrap();
        assert_eq!(decoded, Request::Consume { offset: 3 });
    }

    #[tokio::test]
    async fn test_frames_over_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Request::Produce { value: b"hi".to_vec() })
            .await
            .unwrap();
        write_frame(
            &mut a,
            &Request::ConsumeStream {
                offset: 0,
                origin: Some("node-b".to_string()),
                log_instance: None,
            },
        )
        .await
        .unwrap();
        drop(a);

        let first: Option<Request> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(Request::Produce { value: b"hi".to_vec() }));
        let second: Option<Request> = read_frame(&mut b).await.unwrap();
        assert!(matches!(second, Some(Request::ConsumeStream { offset: 0, .. })));
        let end: Option<Request> = read_frame(&mut b).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();

        let result: Result<Option<Request>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(FrameError::TooLarge(_))));
    }
}
