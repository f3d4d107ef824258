use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::item::{RetryableItem, SourceKey};

/// Backoff and give-up policy for handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(5), max_attempts: 3 }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^attempt_count`, saturating instead of overflowing.
    pub fn delay_for(
        &self,
        attempt_count: u32
    ) -> Duration {
        let factor = 1_u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn is_exhausted(
        &self,
        attempt_count: u32
    ) -> bool {
        attempt_count >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Bound on never-attempted items.
    pub capacity: usize,
    /// Bound on items waiting for another attempt.
    pub retry_capacity: usize
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self { capacity: 100, retry_capacity: 100 }
    }
}

/// Point-in-time view, taken under the queue lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub size: usize,
    pub fresh_size: usize,
    pub capacity: usize,
    pub retry_size: usize,
    pub retry_capacity: usize,
    pub processing: bool
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Duplicate,
    Full
}

/// An item the queue refused, handed back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub item: RetryableItem,
    pub reason: RejectReason
}

#[derive(Debug)]
pub enum RequeueOutcome {
    Scheduled {
        key: SourceKey,
        attempt_count: u32,
        delay: Duration,
        next_eligible_at: Instant
    },
    /// `max_attempts` reached; the item was not re-inserted.
    Exhausted(RetryableItem),
    /// Retry partition full or key already held; the item was not re-inserted.
    Rejected(Rejected)
}

#[derive(Debug, Default)]
struct QueueState {
    fresh: VecDeque<RetryableItem>,
    retry: VecDeque<RetryableItem>,
    held: HashSet<SourceKey>,
    processing: bool
}

/// Bounded holding area with a fresh and a retry partition.
///
/// A single mutex guards both partitions, the dedup set and the drain flag so
/// they always move together.
#[derive(Debug)]
pub struct RetryQueue {
    limits: QueueLimits,
    policy: RetryPolicy,
    state: Mutex<QueueState>
}

impl RetryQueue {
    pub fn new(
        limits: QueueLimits,
        policy: RetryPolicy
    ) -> Self {
        Self { limits, policy, state: Mutex::new(QueueState::default()) }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_add(
        &self,
        item: RetryableItem
    ) -> bool {
        self.offer(item).is_ok()
    }

    /// Like `try_add`, but returns the refused item together with the reason.
    pub fn offer(
        &self,
        item: RetryableItem
    ) -> Result<(), Rejected> {
        let mut state = self.lock();

        if state.held.contains(item.key()) {
            return Err(Rejected { item, reason: RejectReason::Duplicate });
        }

        let to_retry = item.attempt_count() > 0;
        let full = if to_retry {
            state.retry.len() >= self.limits.retry_capacity
        } else {
            state.fresh.len() >= self.limits.capacity
        };
        if full {
            return Err(Rejected { item, reason: RejectReason::Full });
        }

        state.held.insert(item.key().clone());
        if to_retry {
            state.retry.push_back(item);
        } else {
            state.fresh.push_back(item);
        }
        Ok(())
    }

    pub fn add_many<I>(
        &self,
        items: I
    ) -> usize
    where
        I: IntoIterator<Item = RetryableItem>,
    {
        let mut added = 0;
        for item in items {
            if self.try_add(item) {
                added += 1;
            }
        }
        added
    }

    pub fn contains(
        &self,
        key: &SourceKey
    ) -> bool {
        self.lock().held.contains(key)
    }

    /// Removes the next dispatchable item.
    ///
    /// Retry items whose backoff has elapsed go first, then fresh items, each
    /// in arrival order.
    pub fn next(&self) -> Option<RetryableItem> {
        let now = Instant::now();
        let mut state = self.lock();

        let eligible_retry =
            state.retry.iter().position(|item| item.is_eligible(now));
        let item = match eligible_retry {
            Some(pos) => state.retry.remove(pos),
            None => state.fresh.pop_front()
        }?;

        state.held.remove(item.key());
        Some(item)
    }

    pub fn requeue_for_retry(
        &self,
        item: RetryableItem,
        reason: impl Into<String>
    ) -> RequeueOutcome {
        self.requeue_at(item, reason.into(), Instant::now())
    }

    fn requeue_at(
        &self,
        mut item: RetryableItem,
        reason: String,
        now: Instant
    ) -> RequeueOutcome {
        item.record_failure(reason);
        let attempt_count = item.attempt_count();

        if self.policy.is_exhausted(attempt_count) {
            return RequeueOutcome::Exhausted(item);
        }

        let delay = self.policy.delay_for(attempt_count);
        let next_eligible_at = now + delay;
        item.schedule(next_eligible_at);
        let key = item.key().clone();

        match self.offer(item) {
            Ok(()) => {
                debug!(
                    "retry scheduled: key={}, attempt_count={}, delay_secs={}",
                    key,
                    attempt_count,
                    delay.as_secs()
                );
                RequeueOutcome::Scheduled {
                    key,
                    attempt_count,
                    delay,
                    next_eligible_at
                }
            }
            Err(rejected) => RequeueOutcome::Rejected(rejected)
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            size: state.fresh.len() + state.retry.len(),
            fresh_size: state.fresh.len(),
            capacity: self.limits.capacity,
            retry_size: state.retry.len(),
            retry_capacity: self.limits.retry_capacity,
            processing: state.processing
        }
    }

    /// Returns false when a drain cycle is already active.
    pub fn mark_processing(&self) -> bool {
        let mut state = self.lock();
        if state.processing {
            return false;
        }
        state.processing = true;
        true
    }

    pub fn clear_processing(&self) {
        self.lock().processing = false;
    }

    pub fn try_begin_drain(&self) -> Option<DrainGuard<'_>> {
        self.mark_processing().then_some(DrainGuard { queue: self })
    }
}

/// Clears the processing flag when dropped, including on unwind.
#[must_use = "the drain ends as soon as the guard is dropped"]
pub struct DrainGuard<'a> {
    queue: &'a RetryQueue
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue.clear_processing();
    }
}
