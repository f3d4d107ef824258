use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::handler::{HandlerError, TaskEnvelope, TaskHandler};
use super::parser::{MimeParser, RouteTable};
use super::transport::{
    ConnectionState, ConnectionTracker, MailTransport, RawMessage, TransportError,
    UnreadBatch
};

pub(crate) fn raw_mail(
    to: &str,
    subject: &str
) -> Vec<u8> {
    format!(
        "From: member@example.com\r\nTo: {to}\r\nSubject: {subject}\r\n\r\nbody of {subject}\r\n"
    )
    .into_bytes()
}

pub(crate) fn test_parser() -> MimeParser {
    let mut routes = BTreeMap::new();
    routes.insert("pacenotes@example.com".to_string(), "pace_notes".to_string());
    MimeParser::new(RouteTable::new(&routes))
}

#[derive(Default)]
struct FakeMailbox {
    /// uid -> (raw, seen)
    messages: BTreeMap<u32, (Vec<u8>, bool)>
}

#[derive(Default)]
struct FakeState {
    mailboxes: HashMap<String, FakeMailbox>,
    connect_failures: u32,
    mark_read_failures: u32,
    close_calls: u32
}

/// In-memory mailbox server with scripted failures.
#[derive(Default)]
pub(crate) struct FakeTransport {
    state: Mutex<FakeState>,
    tracker: ConnectionTracker
}

impl FakeTransport {
    /// Starts with an empty `INBOX`; other folders exist once delivered to.
    pub(crate) fn new() -> Self {
        let transport = Self::default();
        transport.lock().mailboxes.insert("INBOX".to_string(), FakeMailbox::default());
        transport
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn deliver(
        &self,
        mailbox: &str,
        uid: u32,
        raw: Vec<u8>
    ) {
        self.lock()
            .mailboxes
            .entry(mailbox.to_string())
            .or_default()
            .messages
            .insert(uid, (raw, false));
    }

    pub(crate) fn fail_next_connects(
        &self,
        count: u32
    ) {
        self.lock().connect_failures = count;
    }

    pub(crate) fn fail_next_mark_reads(
        &self,
        count: u32
    ) {
        self.lock().mark_read_failures = count;
    }

    pub(crate) fn is_seen(
        &self,
        mailbox: &str,
        uid: u32
    ) -> bool {
        self.lock()
            .mailboxes
            .get(mailbox)
            .and_then(|mailbox| mailbox.messages.get(&uid))
            .is_some_and(|(_, seen)| *seen)
    }

    pub(crate) fn close_calls(&self) -> u32 {
        self.lock().close_calls
    }

    fn require_session(&self) -> Result<(), TransportError> {
        if self.tracker.snapshot().connected {
            return Ok(());
        }
        let err = TransportError::Disconnected;
        self.tracker.record_failure(&err, false);
        Err(err)
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let refused = {
            let mut state = self.lock();
            let refused = state.connect_failures > 0;
            state.connect_failures = state.connect_failures.saturating_sub(1);
            refused
        };

        if refused {
            let err = TransportError::Connect("connection refused".to_string());
            self.tracker.record_failure(&err, false);
            return Err(err);
        }
        self.tracker.record_authenticated();
        Ok(())
    }

    async fn select_mailbox(
        &self,
        mailbox: &str
    ) -> Result<(), TransportError> {
        self.require_session()?;
        if self.lock().mailboxes.contains_key(mailbox) {
            return Ok(());
        }
        let err =
            TransportError::Rejected { op: "select", message: format!("no mailbox {mailbox}") };
        self.tracker.record_failure(&err, true);
        Err(err)
    }

    async fn fetch_unread(
        &self,
        mailbox: &str
    ) -> Result<UnreadBatch, TransportError> {
        self.select_mailbox(mailbox).await?;

        let state = self.lock();
        let mut messages: Vec<RawMessage> = state
            .mailboxes
            .get(mailbox)
            .map(|mailbox| {
                mailbox
                    .messages
                    .iter()
                    .filter(|(_, (_, seen))| !seen)
                    .map(|(uid, (raw, _))| RawMessage { uid: *uid, raw: raw.clone() })
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by(|a, b| b.uid.cmp(&a.uid));

        Ok(UnreadBatch {
            mailbox: mailbox.to_string(),
            unseen: messages.iter().map(|message| message.uid).collect(),
            messages,
            fetch_failures: 0
        })
    }

    async fn mark_read(
        &self,
        source_id: u32,
        mailbox: &str
    ) -> Result<(), TransportError> {
        self.require_session()?;

        let mut state = self.lock();
        if state.mark_read_failures > 0 {
            state.mark_read_failures -= 1;
            drop(state);
            let err = TransportError::Protocol {
                op: "uid store",
                message: "connection reset".to_string()
            };
            self.tracker.record_failure(&err, false);
            return Err(err);
        }

        if let Some((_, seen)) = state
            .mailboxes
            .get_mut(mailbox)
            .and_then(|mailbox| mailbox.messages.get_mut(&source_id))
        {
            *seen = true;
        }
        Ok(())
    }

    fn health(&self) -> ConnectionState {
        self.tracker.snapshot()
    }

    async fn close(&self) {
        self.lock().close_calls += 1;
        self.tracker.record_closed();
    }
}

enum Behavior {
    Succeed,
    Fail(AtomicU32),
    Hang,
    Panic
}

/// Handler double that remembers every task it was given.
pub(crate) struct RecordingHandler {
    name: String,
    behavior: Behavior,
    calls: Mutex<Vec<TaskEnvelope>>
}

impl RecordingHandler {
    fn with(
        name: &str,
        behavior: Behavior
    ) -> Self {
        Self { name: name.to_string(), behavior, calls: Mutex::new(Vec::new()) }
    }

    pub(crate) fn ok(name: &str) -> Self {
        Self::with(name, Behavior::Succeed)
    }

    /// Fails the first `times` calls, then succeeds.
    pub(crate) fn failing(
        name: &str,
        times: u32
    ) -> Self {
        Self::with(name, Behavior::Fail(AtomicU32::new(times)))
    }

    pub(crate) fn hanging(name: &str) -> Self {
        Self::with(name, Behavior::Hang)
    }

    pub(crate) fn panicking(name: &str) -> Self {
        Self::with(name, Behavior::Panic)
    }

    pub(crate) fn calls(&self) -> Vec<TaskEnvelope> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        task: &TaskEnvelope
    ) -> Result<(), HandlerError> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(task.clone());

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(remaining) => {
                let left = remaining.load(Ordering::SeqCst);
                if left == 0 {
                    return Ok(());
                }
                remaining.store(left - 1, Ordering::SeqCst);
                Err(HandlerError::Unavailable("consumer down".to_string()))
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic => panic!("handler blew up")
        }
    }
}
