use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identity of a message on the server.
///
/// IMAP UIDs are only unique within one folder, so the folder name is part of
/// the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceKey {
    pub mailbox: String,
    pub uid: u32,
}

impl SourceKey {
    pub fn new(
        mailbox: &str,
        uid: u32
    ) -> Self {
        Self { mailbox: mailbox.to_string(), uid }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        write!(f, "{}#{}", self.mailbox, self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Named(String),
    Unknown
}

impl Destination {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Unknown => None
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl fmt::Display for Destination {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        f.write_str(self.name().unwrap_or("unknown"))
    }
}

/// Structured content of one mail, produced once at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub destination: Destination
}

/// Retry state of an item that left the queue while its message is still
/// unseen on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryProgress {
    pub attempt_count: u32,
    pub last_failure_reason: Option<String>,
    pub next_eligible_at: Option<Instant>
}

/// Unit of work held by the retry queue.
///
/// Retry state is only mutated through the queue; everything else is fixed at
/// creation.
#[derive(Debug, Clone)]
pub struct RetryableItem {
    key: SourceKey,
    destination: Destination,
    payload: Arc<ParsedMessage>,
    received_at_unix: u64,
    attempt_count: u32,
    last_failure_reason: Option<String>,
    next_eligible_at: Option<Instant>
}

impl RetryableItem {
    pub fn new(
        key: SourceKey,
        destination: Destination,
        payload: ParsedMessage
    ) -> Self {
        Self {
            key,
            destination,
            payload: Arc::new(payload),
            received_at_unix: unix_now(),
            attempt_count: 0,
            last_failure_reason: None,
            next_eligible_at: None
        }
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn source_id(&self) -> u32 {
        self.key.uid
    }

    pub fn mailbox(&self) -> &str {
        &self.key.mailbox
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn payload(&self) -> &Arc<ParsedMessage> {
        &self.payload
    }

    pub fn received_at_unix(&self) -> u64 {
        self.received_at_unix
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_failure_reason(&self) -> Option<&str> {
        self.last_failure_reason.as_deref()
    }

    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.next_eligible_at
    }

    pub fn is_eligible(
        &self,
        now: Instant
    ) -> bool {
        self.next_eligible_at.is_none_or(|at| at <= now)
    }

    pub fn progress(&self) -> RetryProgress {
        RetryProgress {
            attempt_count: self.attempt_count,
            last_failure_reason: self.last_failure_reason.clone(),
            next_eligible_at: self.next_eligible_at
        }
    }

    /// Continues from earlier retry state. The attempt count never goes back.
    pub fn resume(
        mut self,
        progress: RetryProgress
    ) -> Self {
        if progress.attempt_count >= self.attempt_count {
            self.attempt_count = progress.attempt_count;
            self.last_failure_reason = progress.last_failure_reason;
            self.next_eligible_at = progress.next_eligible_at;
        }
        self
    }

    pub(super) fn record_failure(
        &mut self,
        reason: String
    ) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_failure_reason = Some(reason);
    }

    pub(super) fn schedule(
        &mut self,
        at: Instant
    ) {
        self.next_eligible_at = Some(at);
    }

    #[cfg(test)]
    pub(crate) fn with_attempts(
        mut self,
        attempt_count: u32
    ) -> Self {
        self.attempt_count = attempt_count;
        self
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) fn sample_message(destination: Destination) -> ParsedMessage {
    ParsedMessage {
        from: "member@example.com".to_string(),
        to: vec!["pacenotes@example.com".to_string()],
        subject: "weekly notes".to_string(),
        body: "please draft".to_string(),
        message_id: None,
        destination
    }
}
