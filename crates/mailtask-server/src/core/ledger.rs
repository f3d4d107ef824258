use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use super::item::{RetryProgress, SourceKey};

/// Why a message that is still unseen on the server must not be ingested
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hold {
    /// Done with the message, but setting `\Seen` failed. Retried every cycle.
    PendingAck,
    /// Retries exhausted and left unseen on purpose.
    Exhausted,
    /// No handler for its destination and left unseen on purpose.
    Unroutable,
    /// Failed to parse too many times and left unseen.
    Quarantined
}

#[derive(Debug, Default)]
struct Entry {
    parse_failures: u32,
    hold: Option<Hold>,
    /// Retry state of a failed item that could not go back into the queue.
    deferred: Option<RetryProgress>
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.parse_failures == 0 && self.hold.is_none() && self.deferred.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub pending_ack: usize,
    pub exhausted: usize,
    pub unroutable: usize,
    pub quarantined: usize,
    /// Messages with at least one parse failure that are not held yet.
    pub parse_failing: usize,
    /// Failed messages waiting for room in the retry partition.
    pub retry_deferred: usize
}

/// Memory of per-message outcomes that outlive a single poll cycle.
///
/// Entries only exist for messages the server still reports as unseen; see
/// `prune`.
#[derive(Debug, Default)]
pub struct IngestLedger {
    entries: Mutex<HashMap<SourceKey, Entry>>
}

impl IngestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SourceKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn held(
        &self,
        key: &SourceKey
    ) -> Option<Hold> {
        self.lock().get(key).and_then(|entry| entry.hold)
    }

    /// Returns the failure count including this one.
    pub fn record_parse_failure(
        &self,
        key: &SourceKey
    ) -> u32 {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.parse_failures = entry.parse_failures.saturating_add(1);
        entry.parse_failures
    }

    pub fn clear_parse_failures(
        &self,
        key: &SourceKey
    ) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.parse_failures = 0;
            if entry.is_empty() {
                entries.remove(key);
            }
        }
    }

    /// Remembers retry state for a failed item the queue refused to take back.
    /// A lower attempt count never replaces a higher one.
    pub fn defer(
        &self,
        key: SourceKey,
        progress: RetryProgress
    ) {
        let mut entries = self.lock();
        let entry = entries.entry(key).or_default();
        let behind = entry
            .deferred
            .as_ref()
            .is_some_and(|known| known.attempt_count > progress.attempt_count);
        if !behind {
            entry.deferred = Some(progress);
        }
    }

    pub fn deferred(
        &self,
        key: &SourceKey
    ) -> Option<RetryProgress> {
        self.lock().get(key).and_then(|entry| entry.deferred.clone())
    }

    /// Called once the item is back in the queue, which now owns its state.
    pub fn clear_deferred(
        &self,
        key: &SourceKey
    ) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.deferred = None;
            if entry.is_empty() {
                entries.remove(key);
            }
        }
    }

    pub fn hold(
        &self,
        key: SourceKey,
        hold: Hold
    ) {
        self.lock().entry(key).or_default().hold = Some(hold);
    }

    pub fn release(
        &self,
        key: &SourceKey
    ) {
        self.lock().remove(key);
    }

    pub fn pending_acks(&self) -> Vec<SourceKey> {
        let mut keys: Vec<SourceKey> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.hold == Some(Hold::PendingAck))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by(|a, b| a.mailbox.cmp(&b.mailbox).then(a.uid.cmp(&b.uid)));
        keys
    }

    /// Drops entries of `mailbox` whose UID the server no longer lists as
    /// unseen.
    pub fn prune(
        &self,
        mailbox: &str,
        unseen: &[u32]
    ) -> usize {
        let unseen: HashSet<u32> = unseen.iter().copied().collect();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| key.mailbox != mailbox || unseen.contains(&key.uid));
        before - entries.len()
    }

    pub fn counts(&self) -> LedgerCounts {
        let entries = self.lock();
        let mut counts = LedgerCounts::default();
        for entry in entries.values() {
            match entry.hold {
                Some(Hold::PendingAck) => counts.pending_ack += 1,
                Some(Hold::Exhausted) => counts.exhausted += 1,
                Some(Hold::Unroutable) => counts.unroutable += 1,
                Some(Hold::Quarantined) => counts.quarantined += 1,
                None => {
                    if entry.parse_failures > 0 {
                        counts.parse_failing += 1;
                    }
                    if entry.deferred.is_some() {
                        counts.retry_deferred += 1;
                    }
                }
            }
        }
        counts
    }
}
