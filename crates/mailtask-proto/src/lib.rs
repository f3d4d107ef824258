use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: [u8; 4] = *b"MTSK";
pub const ACK: &[u8; 3] = b"OK\n";

/// A task handed to a downstream consumer. Body is the JSON task payload.
pub const KIND_TASK: &str = "task";
/// Health query. Answered with a `KIND_HEALTH_REPORT` frame.
pub const KIND_HEALTH: &str = "health";
pub const KIND_HEALTH_REPORT: &str = "health_report";
/// Liveness check. Answered with a bare `ACK`.
pub const KIND_PING: &str = "ping";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub kind: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub task: Option<TaskHeader>,
}

impl Header {
    pub fn new(kind: &str) -> Self {
        Self { kind: kind.to_string(), source: None, task: None }
    }

    pub fn with_source(
        mut self,
        source: impl Into<String>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_task(
        mut self,
        task: TaskHeader,
    ) -> Self {
        self.task = Some(task);
        self
    }

    pub fn is_kind(
        &self,
        kind: &str,
    ) -> bool {
        self.kind == kind
    }
}

/// Routing metadata carried next to a task body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHeader {
    pub task_id: String,
    pub destination: String,
    pub mailbox: String,
    pub source_id: u32,
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("invalid ack")]
    InvalidAck,
    #[error("header too large: {0} bytes")]
    HeaderTooLarge(u32),
    #[error("body too large: {0} bytes")]
    BodyTooLarge(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("header encode error: {0}")]
    HeaderEncode(String),
    #[error("header decode error: {0}")]
    HeaderDecode(String),
}

pub fn encode_header_json(header: &Header) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(header)
        .map_err(|err| ProtoError::HeaderEncode(err.to_string()))
}

pub fn decode_header_json(bytes: &[u8]) -> Result<Header, ProtoError> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::HeaderDecode(err.to_string()))
}

fn frame_lengths(
    header: &[u8],
    body: &[u8],
) -> Result<(u32, u64), ProtoError> {
    let header_len = u32::try_from(header.len())
        .map_err(|_| ProtoError::HeaderTooLarge(u32::MAX))?;
    let body_len = u64::try_from(body.len())
        .map_err(|_| ProtoError::BodyTooLarge(u64::MAX))?;
    Ok((header_len, body_len))
}

fn check_lengths(
    header_len: u32,
    body_len: u64,
    max_header_len: u32,
    max_body_len: u64,
) -> Result<(), ProtoError> {
    if header_len > max_header_len {
        return Err(ProtoError::HeaderTooLarge(header_len));
    }
    if body_len > max_body_len {
        return Err(ProtoError::BodyTooLarge(body_len));
    }
    Ok(())
}

pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &[u8],
    body: &[u8],
) -> Result<(), ProtoError> {
    let (header_len, body_len) = frame_lengths(header, body)?;

    writer.write_all(&MAGIC).await?;
    writer.write_all(&header_len.to_be_bytes()).await?;
    writer.write_all(&body_len.to_be_bytes()).await?;
    writer.write_all(header).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_header_len: u32,
    max_body_len: u64,
) -> Result<(Vec<u8>, Vec<u8>), ProtoError> {
    let mut magic = [0_u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(ProtoError::InvalidMagic);
    }

    let mut header_len_buf = [0_u8; 4];
    reader.read_exact(&mut header_len_buf).await?;
    let header_len = u32::from_be_bytes(header_len_buf);

    let mut body_len_buf = [0_u8; 8];
    reader.read_exact(&mut body_len_buf).await?;
    let body_len = u64::from_be_bytes(body_len_buf);

    check_lengths(header_len, body_len, max_header_len, max_body_len)?;

    let mut header = vec![0_u8; header_len as usize];
    reader.read_exact(&mut header).await?;

    let mut body = vec![0_u8; body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok((header, body))
}

pub async fn read_ack_async<R: AsyncRead + Unpin>(
    reader: &mut R
) -> Result<(), ProtoError> {
    let mut ack = [0_u8; 3];
    reader.read_exact(&mut ack).await?;
    if ack == *ACK { Ok(()) } else { Err(ProtoError::InvalidAck) }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_task_header() -> Header {
        Header::new(KIND_TASK).with_source("mailtask-test").with_task(
            TaskHeader {
                task_id: "0192f1c2-task".to_string(),
                destination: "pace_notes".to_string(),
                mailbox: "INBOX".to_string(),
                source_id: 42,
                attempt: 1,
            },
        )
    }

    #[tokio::test]
    async fn frame_carries_header_and_body() {
        let header = encode_header_json(&sample_task_header()).unwrap();
        let mut wire = Vec::new();
        write_frame_async(&mut wire, &header, b"{\"subject\":\"hi\"}").await.unwrap();

        let (header_bytes, body) =
            read_frame_async(&mut Cursor::new(wire), 1024, 1024).await.unwrap();
        let decoded = decode_header_json(&header_bytes).unwrap();

        assert!(decoded.is_kind(KIND_TASK));
        assert_eq!(decoded.source.as_deref(), Some("mailtask-test"));
        assert_eq!(decoded.task.unwrap().source_id, 42);
        assert_eq!(body, b"{\"subject\":\"hi\"}");
    }

    #[tokio::test]
    async fn rejects_foreign_magic() {
        let mut wire = b"BNCE".to_vec();
        wire.extend_from_slice(&[0; 12]);

        let err = read_frame_async(&mut Cursor::new(wire), 1024, 1024)
            .await
            .expect_err("foreign magic must fail");
        assert!(matches!(err, ProtoError::InvalidMagic));
    }

    #[tokio::test]
    async fn rejects_oversized_body_before_reading_it() {
        let header = encode_header_json(&Header::new(KIND_PING)).unwrap();
        let mut wire = Vec::new();
        write_frame_async(&mut wire, &header, &[7_u8; 64]).await.unwrap();

        let err = read_frame_async(&mut Cursor::new(wire), 1024, 16)
            .await
            .expect_err("body above limit must fail");
        assert!(matches!(err, ProtoError::BodyTooLarge(64)));
    }

    #[test]
    fn header_without_optional_fields_decodes() {
        let header = decode_header_json(br#"{"kind":"health"}"#).unwrap();
        assert!(header.is_kind(KIND_HEALTH));
        assert!(header.source.is_none());
        assert!(header.task.is_none());
    }

    #[tokio::test]
    async fn ack_mismatch_is_reported() {
        assert!(read_ack_async(&mut Cursor::new(b"OK\n".to_vec())).await.is_ok());
        let err = read_ack_async(&mut Cursor::new(b"NO\n".to_vec()))
            .await
            .expect_err("wrong ack must fail");
        assert!(matches!(err, ProtoError::InvalidAck));
    }

    #[tokio::test]
    async fn async_frame_over_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let header = encode_header_json(&Header::new(KIND_HEALTH)).unwrap();

        write_frame_async(&mut client, &header, b"").await.unwrap();
        let (header_bytes, body) =
            read_frame_async(&mut server, 1024, 1024).await.unwrap();

        assert!(decode_header_json(&header_bytes).unwrap().is_kind(KIND_HEALTH));
        assert!(body.is_empty());

        server.write_all(ACK).await.unwrap();
        read_ack_async(&mut client).await.unwrap();
    }
}
