use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::item::unix_now;

/// Health of the mailbox session as last observed by the transport.
///
/// `healthy` is a hint: the next remote call may still fail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub healthy: bool,
    pub connected: bool,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_connected_at: Option<u64>
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("imap connect failed: {0}")]
    Connect(String),
    #[error("imap {op} timed out after {timeout_secs}s")]
    Timeout { op: &'static str, timeout_secs: u64 },
    #[error("imap {op} rejected by server: {message}")]
    Rejected { op: &'static str, message: String },
    #[error("imap {op} failed: {message}")]
    Protocol { op: &'static str, message: String },
    #[error("imap session unavailable")]
    Disconnected
}

impl TransportError {
    /// A tagged `NO`/`BAD` leaves the session usable; anything else does not.
    pub fn keeps_session(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Rejected { .. } => "REJECTED",
            Self::Protocol { .. } => "PROTOCOL",
            Self::Disconnected => "DISCONNECTED"
        }
    }
}

/// One message fetched with peek semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub raw: Vec<u8>
}

/// Result of one unread fetch for a mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadBatch {
    pub mailbox: String,
    /// Every UID the server reported unseen, before the per-poll cap.
    pub unseen: Vec<u32>,
    pub messages: Vec<RawMessage>,
    /// Selected UIDs whose body could not be downloaded.
    pub fetch_failures: usize
}

/// Access to the remote mailbox.
///
/// Implementations own their session exclusively, never retry internally and
/// report expected network failures through `TransportError` plus `health()`.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Validates the current session or opens a new one.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.health().healthy {
            return Ok(());
        }
        self.connect().await
    }

    async fn select_mailbox(
        &self,
        mailbox: &str
    ) -> Result<(), TransportError>;

    /// Unseen messages of `mailbox`, fetched without setting `\Seen`.
    async fn fetch_unread(
        &self,
        mailbox: &str
    ) -> Result<UnreadBatch, TransportError>;

    /// Sets `\Seen` on one message. Already-seen messages are not an error.
    async fn mark_read(
        &self,
        source_id: u32,
        mailbox: &str
    ) -> Result<(), TransportError>;

    fn health(&self) -> ConnectionState;

    /// Best-effort logout, bounded in time.
    async fn close(&self);
}

/// Shared bookkeeping for `ConnectionState`.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    state: Mutex<ConnectionState>
}

impl ConnectionTracker {
    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.lock().clone()
    }

    /// Fresh login: the only place `error_count` goes back to zero.
    pub fn record_authenticated(&self) {
        let mut state = self.lock();
        state.healthy = true;
        state.connected = true;
        state.error_count = 0;
        state.last_error = None;
        state.last_connected_at = Some(unix_now());
    }

    /// Existing session answered a liveness check.
    pub fn record_alive(&self) {
        let mut state = self.lock();
        state.healthy = true;
        state.connected = true;
    }

    /// A refused command on a kept session counts as an error but leaves
    /// `healthy` as it was.
    pub fn record_failure(
        &self,
        err: &TransportError,
        session_kept: bool
    ) {
        let mut state = self.lock();
        state.healthy = session_kept && state.healthy;
        state.connected = session_kept;
        state.error_count = state.error_count.saturating_add(1);
        state.last_error = Some(err.to_string());
    }

    pub fn record_closed(&self) {
        let mut state = self.lock();
        state.healthy = false;
        state.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_until_fresh_login() {
        let tracker = ConnectionTracker::default();
        for attempt in 1..=3 {
            tracker.record_failure(
                &TransportError::Connect(format!("refused #{attempt}")),
                false
            );
        }

        let state = tracker.snapshot();
        assert!(!state.healthy);
        assert_eq!(state.error_count, 3);
        assert_eq!(
            state.last_error.as_deref(),
            Some("imap connect failed: refused #3")
        );

        tracker.record_alive();
        assert_eq!(tracker.snapshot().error_count, 3);

        tracker.record_authenticated();
        let state = tracker.snapshot();
        assert!(state.healthy);
        assert_eq!(state.error_count, 0);
        assert!(state.last_error.is_none());
        assert!(state.last_connected_at.is_some());
    }

    #[test]
    fn refused_command_keeps_a_healthy_session_healthy() {
        let tracker = ConnectionTracker::default();
        tracker.record_authenticated();

        tracker.record_failure(
            &TransportError::Rejected { op: "select", message: "no such folder".into() },
            true
        );
        let state = tracker.snapshot();
        assert!(state.healthy);
        assert!(state.connected);
        assert_eq!(state.error_count, 1);
        assert_eq!(
            state.last_error.as_deref(),
            Some("imap select rejected by server: no such folder")
        );

        tracker.record_failure(&TransportError::Disconnected, false);
        let state = tracker.snapshot();
        assert!(!state.healthy);
        assert!(!state.connected);
        assert_eq!(state.error_count, 2);
    }

    #[test]
    fn rejected_commands_keep_the_session() {
        let rejected =
            TransportError::Rejected { op: "select", message: "no such folder".into() };
        assert!(rejected.keeps_session());
        assert!(!TransportError::Disconnected.keeps_session());
        assert_eq!(
            TransportError::Timeout { op: "uid fetch", timeout_secs: 30 }.code(),
            "TIMEOUT"
        );
    }
}
