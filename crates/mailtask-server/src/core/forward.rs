use async_trait::async_trait;
use mailtask_proto::{
    Header, KIND_TASK, ProtoError, TaskHeader, encode_header_json, read_ack_async,
    write_frame_async
};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::debug;

use super::handler::{HandlerError, TaskEnvelope, TaskHandler};

/// Sends each task as one framed message to a TCP consumer and waits for
/// `OK\n`.
///
/// Connections are not reused: a consumer restart never leaves a stale socket
/// behind.
pub struct ForwardHandler {
    name: String,
    addr: String,
    source: String,
    timeout_secs: u64
}

impl ForwardHandler {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        source: impl Into<String>,
        timeout_secs: u64
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            source: source.into(),
            timeout_secs: timeout_secs.max(1)
        }
    }

    async fn send(
        &self,
        task: &TaskEnvelope
    ) -> Result<(), HandlerError> {
        let header = Header::new(KIND_TASK).with_source(&self.source).with_task(
            TaskHeader {
                task_id: task.task_id.to_string(),
                destination: task.destination.to_string(),
                mailbox: task.mailbox.clone(),
                source_id: task.source_id,
                attempt: task.attempt
            }
        );
        let header = encode_header_json(&header).map_err(proto_error)?;
        let body = serde_json::to_vec(task)
            .map_err(|err| HandlerError::Other(anyhow::Error::new(err)))?;

        let mut stream = TcpStream::connect(&self.addr).await.map_err(|err| {
            HandlerError::Unavailable(format!("connect {}: {err}", self.addr))
        })?;
        write_frame_async(&mut stream, &header, &body).await.map_err(proto_error)?;
        read_ack_async(&mut stream).await.map_err(proto_error)?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ForwardHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        task: &TaskEnvelope
    ) -> Result<(), HandlerError> {
        timeout(Duration::from_secs(self.timeout_secs), self.send(task))
            .await
            .map_err(|_| HandlerError::Timeout(self.timeout_secs))??;

        debug!(
            "task forwarded: handler={}, addr={}, task_id={}, uid={}, attempt={}",
            self.name, self.addr, task.task_id, task.source_id, task.attempt
        );
        Ok(())
    }
}

fn proto_error(err: ProtoError) -> HandlerError {
    match err {
        ProtoError::InvalidAck => {
            HandlerError::Rejected("consumer answered without OK".to_string())
        }
        ProtoError::Io(err) => HandlerError::Unavailable(err.to_string()),
        other => HandlerError::Other(anyhow::Error::new(other))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mailtask_proto::{ACK, decode_header_json, read_frame_async};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::core::item::{Destination, RetryableItem, SourceKey, sample_message};

    fn envelope() -> TaskEnvelope {
        let destination = Destination::Named("pace_notes".to_string());
        let item = RetryableItem::new(
            SourceKey::new("INBOX", 42),
            destination.clone(),
            sample_message(destination)
        );
        TaskEnvelope::for_item(&item)
    }

    async fn closed_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn forwards_framed_task_and_accepts_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let consumer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (header, body) =
                read_frame_async(&mut socket, 64 * 1024, 1024 * 1024).await.unwrap();
            socket.write_all(ACK).await.unwrap();
            (decode_header_json(&header).unwrap(), body)
        });

        let handler = ForwardHandler::new("pace_notes", addr, "mailtask-test", 5);
        let task = envelope();
        handler.process(&task).await.unwrap();

        let (header, body) = consumer.await.unwrap();
        assert!(header.is_kind(KIND_TASK));
        assert_eq!(header.source.as_deref(), Some("mailtask-test"));
        let task_header = header.task.unwrap();
        assert_eq!(task_header.source_id, 42);
        assert_eq!(task_header.attempt, 1);
        assert_eq!(task_header.destination, "pace_notes");

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["task_id"], task.task_id.to_string());
    }

    #[tokio::test]
    async fn missing_consumer_is_unavailable() {
        let handler = ForwardHandler::new("pace_notes", closed_addr().await, "t", 5);
        let err = handler.process(&envelope()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn wrong_ack_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_frame_async(&mut socket, 64 * 1024, 1024 * 1024).await;
            socket.write_all(b"NO\n").await.unwrap();
        });

        let handler = ForwardHandler::new("pace_notes", addr, "t", 5);
        let err = handler.process(&envelope()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
    }

    #[tokio::test]
    async fn silent_consumer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let held = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let held_sockets = Arc::clone(&held);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            held_sockets.lock().await.push(socket);
        });

        let handler = ForwardHandler::new("pace_notes", addr, "t", 1);
        let err = handler.process(&envelope()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Timeout(1)));
    }
}
