use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::handler::{HandlerRegistry, TaskEnvelope};
use super::health::{HealthReport, LifecycleState, assemble};
use super::item::{Destination, ParsedMessage, RetryableItem, SourceKey};
use super::ledger::{Hold, IngestLedger};
use super::metrics::{IngestMetrics, add, bump};
use super::parser::{MessageParser, ParseError};
use super::queue::{RejectReason, Rejected, RequeueOutcome, RetryQueue};
use super::transport::{MailTransport, TransportError};

/// A mailbox to poll and the destination its unrouted mail falls back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxRoute {
    pub name: String,
    pub destination: Option<String>
}

impl MailboxRoute {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), destination: None }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub mailboxes: Vec<MailboxRoute>,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    pub error_backoff: Duration,
    /// Maximum handler dispatches per cycle.
    pub drain_budget: usize,
    pub stop_timeout: Duration,
    pub max_parse_failures: u32,
    pub mark_seen_on_exhausted: bool,
    pub mark_seen_unroutable: bool
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            mailboxes: vec![MailboxRoute::new("INBOX")],
            poll_interval: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            drain_budget: 50,
            stop_timeout: Duration::from_secs(5),
            max_parse_failures: 5,
            mark_seen_on_exhausted: true,
            mark_seen_unroutable: true
        }
    }
}

/// Emitted once for every item that ran out of retries.
#[derive(Debug, Clone, Serialize)]
pub struct ExhaustedTask {
    pub key: SourceKey,
    pub destination: Destination,
    pub attempt_count: u32,
    pub last_failure_reason: Option<String>,
    pub received_at_unix: u64,
    pub message: Arc<ParsedMessage>
}

impl From<&RetryableItem> for ExhaustedTask {
    fn from(item: &RetryableItem) -> Self {
        Self {
            key: item.key().clone(),
            destination: item.destination().clone(),
            attempt_count: item.attempt_count(),
            last_failure_reason: item.last_failure_reason().map(str::to_string),
            received_at_unix: item.received_at_unix(),
            message: Arc::clone(item.payload())
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: LifecycleState },
    #[error("ingest startup failed: {0}")]
    Startup(#[source] TransportError)
}

/// Collaborators the orchestrator drives. Built by the caller, never global.
pub struct Pipeline {
    pub transport: Arc<dyn MailTransport>,
    pub parser: Arc<dyn MessageParser>,
    pub handlers: HandlerRegistry,
    pub queue: RetryQueue,
    pub exhausted_sink: Option<mpsc::Sender<ExhaustedTask>>
}

struct Inner {
    transport: Arc<dyn MailTransport>,
    parser: Arc<dyn MessageParser>,
    handlers: HandlerRegistry,
    queue: RetryQueue,
    ledger: IngestLedger,
    metrics: IngestMetrics,
    settings: IngestSettings,
    exhausted_sink: Option<mpsc::Sender<ExhaustedTask>>
}

struct Lifecycle {
    state: LifecycleState,
    started_at: Option<Instant>
}

struct LoopControl {
    token: CancellationToken,
    task: JoinHandle<()>
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Completed,
    Disconnected,
    Cancelled
}

/// Runs the poll, parse, enqueue and dispatch loop for one transport.
pub struct Orchestrator {
    inner: Arc<Inner>,
    lifecycle: Mutex<Lifecycle>,
    control: tokio::sync::Mutex<Option<LoopControl>>,
    shutdown: CancellationToken
}

impl Orchestrator {
    /// `shutdown` is the process-wide token; the loop runs on a child of it.
    pub fn new(
        pipeline: Pipeline,
        settings: IngestSettings,
        shutdown: CancellationToken
    ) -> Self {
        let inner = Inner {
            transport: pipeline.transport,
            parser: pipeline.parser,
            handlers: pipeline.handlers,
            queue: pipeline.queue,
            ledger: IngestLedger::new(),
            metrics: IngestMetrics::default(),
            settings,
            exhausted_sink: pipeline.exhausted_sink
        };

        Self {
            inner: Arc::new(inner),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Stopped,
                started_at: None
            }),
            control: tokio::sync::Mutex::new(None),
            shutdown
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(
        &self,
        state: LifecycleState
    ) {
        let mut lifecycle = self.lifecycle();
        lifecycle.state = state;
        lifecycle.started_at = match state {
            LifecycleState::Running => Some(Instant::now()),
            LifecycleState::Stopped => None,
            _ => lifecycle.started_at
        };
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle().state
    }

    /// Connects and spawns the poll loop. Only valid from `Stopped`.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let mut control = self.control.lock().await;

        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != LifecycleState::Stopped {
                return Err(OrchestratorError::InvalidState {
                    op: "start",
                    state: lifecycle.state
                });
            }
            lifecycle.state = LifecycleState::Starting;
        }

        if let Err(err) = self.inner.transport.connect().await {
            self.set_state(LifecycleState::Stopped);
            error!("ERROR_CODE=INGEST_STARTUP_FAILED ingest startup failed: error={err}");
            return Err(OrchestratorError::Startup(err));
        }

        let token = self.shutdown.child_token();
        let task = tokio::spawn(run_poll_loop(Arc::clone(&self.inner), token.clone()));
        *control = Some(LoopControl { token, task });
        self.set_state(LifecycleState::Running);

        let settings = &self.inner.settings;
        info!(
            "ingest started: mailboxes={}, handlers={}, poll_interval={}, drain_budget={}, max_attempts={}",
            settings
                .mailboxes
                .iter()
                .map(|mailbox| mailbox.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
            self.inner.handlers.destinations().join(","),
            humantime::format_duration(settings.poll_interval),
            settings.drain_budget,
            self.inner.queue.policy().max_attempts
        );
        Ok(())
    }

    /// Cancels the loop, waits up to `stop_timeout`, then closes the
    /// transport. A no-op when already stopped or stopping.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;

        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                LifecycleState::Stopped | LifecycleState::Stopping => return,
                LifecycleState::Starting | LifecycleState::Running => {
                    lifecycle.state = LifecycleState::Stopping;
                }
            }
        }

        if let Some(LoopControl { token, mut task }) = control.take() {
            token.cancel();
            let stop_timeout = self.inner.settings.stop_timeout;
            match timeout(stop_timeout, &mut task).await {
                Ok(Ok(())) => debug!("ingest loop joined"),
                Ok(Err(err)) => warn!("ingest loop ended abnormally: error={err}"),
                Err(_) => {
                    task.abort();
                    warn!(
                        "ERROR_CODE=INGEST_FORCED_CANCEL ingest loop did not stop in time, aborted: timeout={}",
                        humantime::format_duration(stop_timeout)
                    );
                }
            }
        }

        self.inner.transport.close().await;
        self.set_state(LifecycleState::Stopped);
        info!("ingest stopped");
    }

    pub fn get_health(&self) -> HealthReport {
        let (state, uptime) = {
            let lifecycle = self.lifecycle();
            (
                lifecycle.state,
                lifecycle.started_at.map(|at| at.elapsed()).unwrap_or_default()
            )
        };

        assemble(
            state,
            self.inner.transport.health(),
            self.inner.queue.snapshot(),
            self.inner.ledger.counts(),
            self.inner.metrics.snapshot(),
            uptime
        )
    }
}

async fn run_poll_loop(
    inner: Arc<Inner>,
    token: CancellationToken
) {
    debug!("ingest loop running");

    loop {
        if token.is_cancelled() {
            break;
        }

        let cycle = AssertUnwindSafe(inner.run_cycle(&token)).catch_unwind().await;
        let pause = match cycle {
            Ok(Ok(CycleOutcome::Completed)) => inner.settings.poll_interval,
            Ok(Ok(CycleOutcome::Disconnected)) => inner.settings.reconnect_backoff,
            Ok(Ok(CycleOutcome::Cancelled)) => break,
            Ok(Err(err)) => {
                bump(inner.metrics.loop_errors());
                error!("ERROR_CODE=INGEST_CYCLE_FAILED ingest cycle failed: error={err:#}");
                inner.settings.error_backoff
            }
            Err(panic) => {
                bump(inner.metrics.loop_errors());
                error!(
                    "ERROR_CODE=INGEST_CYCLE_PANICKED ingest cycle panicked: panic={}",
                    panic_message(panic.as_ref())
                );
                inner.settings.error_backoff
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(pause) => {}
        }
    }

    debug!("ingest loop exiting");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl Inner {
    async fn run_cycle(
        &self,
        token: &CancellationToken
    ) -> Result<CycleOutcome> {
        bump(self.metrics.cycles());

        if !self.transport.health().healthy {
            if let Err(err) = self.transport.connect().await {
                warn!(
                    "ERROR_CODE=INGEST_RECONNECT_FAILED imap reconnect failed, backing off: backoff={}, error={err}",
                    humantime::format_duration(self.settings.reconnect_backoff)
                );
                return Ok(CycleOutcome::Disconnected);
            }
            info!("imap reconnected");
        }

        self.flush_pending_acks().await;

        for route in &self.settings.mailboxes {
            if token.is_cancelled() {
                return Ok(CycleOutcome::Cancelled);
            }
            if let Err(err) = self.ingest_mailbox(route).await {
                warn!(
                    "ERROR_CODE=INGEST_FETCH_FAILED mailbox fetch failed: mailbox={}, error={err}",
                    route.name
                );
                if !err.keeps_session() {
                    break;
                }
            }
        }

        self.drain(token).await
    }

    async fn flush_pending_acks(&self) {
        for key in self.ledger.pending_acks() {
            match self.transport.mark_read(key.uid, &key.mailbox).await {
                Ok(()) => {
                    info!("pending ack delivered: key={key}");
                    self.ledger.release(&key);
                }
                Err(err) => {
                    bump(self.metrics.mark_read_failures());
                    warn!(
                        "ERROR_CODE=INGEST_ACK_FAILED pending ack still failing: key={key}, error={err}"
                    );
                    if !err.keeps_session() {
                        return;
                    }
                }
            }
        }
    }

    async fn ingest_mailbox(
        &self,
        route: &MailboxRoute
    ) -> Result<(), TransportError> {
        let batch = self.transport.fetch_unread(&route.name).await?;

        add(self.metrics.fetched(), batch.messages.len() as u64);
        add(self.metrics.fetch_failures(), batch.fetch_failures as u64);
        let pruned = self.ledger.prune(&route.name, &batch.unseen);

        let mut enqueued = 0usize;
        let mut skipped = 0usize;
        for raw in batch.messages {
            let key = SourceKey::new(&route.name, raw.uid);

            if let Some(hold) = self.ledger.held(&key) {
                trace!("message held, skipping: key={key}, hold={hold:?}");
                skipped += 1;
                continue;
            }
            if self.queue.contains(&key) {
                bump(self.metrics.duplicates());
                skipped += 1;
                continue;
            }

            let mut message = match self.parser.parse(&raw.raw, raw.uid) {
                Ok(message) => message,
                Err(err) => {
                    self.handle_parse_failure(key, err).await;
                    continue;
                }
            };
            self.ledger.clear_parse_failures(&key);

            if message.destination.is_unknown() {
                if let Some(fallback) = &route.destination {
                    message.destination = Destination::Named(fallback.clone());
                }
            }
            let destination = message.destination.clone();

            let mut item = RetryableItem::new(key.clone(), destination, message);
            if let Some(progress) = self.ledger.deferred(&key) {
                item = item.resume(progress);
            }

            match self.queue.offer(item) {
                Ok(()) => {
                    self.ledger.clear_deferred(&key);
                    bump(self.metrics.enqueued());
                    enqueued += 1;
                }
                Err(Rejected { reason: RejectReason::Duplicate, .. }) => {
                    bump(self.metrics.duplicates());
                    skipped += 1;
                }
                Err(Rejected { item, reason: RejectReason::Full }) => {
                    bump(self.metrics.backpressure_drops());
                    let snapshot = self.queue.snapshot();
                    warn!(
                        "ERROR_CODE=INGEST_QUEUE_FULL queue full, message left unseen: key={}, attempt_count={}, capacity={}, retry_capacity={}",
                        item.key(),
                        item.attempt_count(),
                        snapshot.capacity,
                        snapshot.retry_capacity
                    );
                }
            }
        }

        debug!(
            "mailbox polled: mailbox={}, unseen={}, enqueued={}, skipped={}, fetch_failures={}, ledger_pruned={}",
            route.name,
            batch.unseen.len(),
            enqueued,
            skipped,
            batch.fetch_failures,
            pruned
        );
        Ok(())
    }

    async fn handle_parse_failure(
        &self,
        key: SourceKey,
        err: ParseError
    ) {
        bump(self.metrics.parse_failures());
        let failures = self.ledger.record_parse_failure(&key);
        let max_failures = self.settings.max_parse_failures.max(1);

        if failures < max_failures {
            warn!(
                "ERROR_CODE=INGEST_PARSE_FAILED message parse failed, left unseen: key={}, parser_code={}, failures={}/{}, error={}",
                key,
                err.code(),
                failures,
                max_failures,
                err
            );
            return;
        }

        bump(self.metrics.quarantined());
        error!(
            "ERROR_CODE=INGEST_PARSE_QUARANTINED message quarantined after repeated parse failures: key={}, parser_code={}, failures={}, error={}",
            key,
            err.code(),
            failures,
            err
        );
        self.settle(key, Hold::Quarantined, true).await;
    }

    async fn drain(
        &self,
        token: &CancellationToken
    ) -> Result<CycleOutcome> {
        let Some(_drain) = self.queue.try_begin_drain() else {
            bail!("queue drain already active");
        };

        let budget = self.settings.drain_budget.max(1);
        let mut dispatched = 0usize;
        while dispatched < budget {
            if token.is_cancelled() {
                return Ok(CycleOutcome::Cancelled);
            }
            let Some(item) = self.queue.next() else {
                break;
            };
            dispatched += 1;
            self.dispatch(item).await;
        }

        if dispatched == budget {
            debug!("drain budget spent: budget={budget}");
        }
        Ok(CycleOutcome::Completed)
    }

    async fn dispatch(
        &self,
        item: RetryableItem
    ) {
        let Some(handler) = self.handlers.get(item.destination()) else {
            self.drop_unroutable(item).await;
            return;
        };

        let task = TaskEnvelope::for_item(&item);
        match handler.process(&task).await {
            Ok(()) => {
                bump(self.metrics.dispatched());
                info!(
                    "task dispatched: key={}, destination={}, handler={}, task_id={}, attempt={}",
                    item.key(),
                    item.destination(),
                    handler.name(),
                    task.task_id,
                    task.attempt
                );
                self.acknowledge(item).await;
            }
            Err(err) => {
                bump(self.metrics.handler_failures());
                warn!(
                    "ERROR_CODE=INGEST_HANDLER_FAILED handler failed: key={}, handler={}, handler_code={}, attempt={}, error={err:#}",
                    item.key(),
                    handler.name(),
                    err.code(),
                    task.attempt
                );
                self.retry_or_exhaust(item, format!("{}: {err}", err.code())).await;
            }
        }
    }

    async fn acknowledge(
        &self,
        item: RetryableItem
    ) {
        if let Err(err) = self.transport.mark_read(item.source_id(), item.mailbox()).await
        {
            bump(self.metrics.mark_read_failures());
            warn!(
                "ERROR_CODE=INGEST_ACK_FAILED processed message not marked seen, will retry ack: key={}, error={err}",
                item.key()
            );
            self.ledger.hold(item.key().clone(), Hold::PendingAck);
        }
    }

    async fn retry_or_exhaust(
        &self,
        item: RetryableItem,
        reason: String
    ) {
        match self.queue.requeue_for_retry(item, reason) {
            RequeueOutcome::Scheduled { key, attempt_count, delay, .. } => {
                bump(self.metrics.retries_scheduled());
                info!(
                    "retry scheduled: key={}, attempt_count={}, delay={}",
                    key,
                    attempt_count,
                    humantime::format_duration(delay)
                );
            }
            RequeueOutcome::Exhausted(item) => {
                bump(self.metrics.exhausted());
                error!(
                    "ERROR_CODE=INGEST_RETRIES_EXHAUSTED task failed permanently: key={}, destination={}, attempt_count={}, last_error={}",
                    item.key(),
                    item.destination(),
                    item.attempt_count(),
                    item.last_failure_reason().unwrap_or("-")
                );
                self.publish_exhausted(&item);
                self.settle(
                    item.key().clone(),
                    Hold::Exhausted,
                    self.settings.mark_seen_on_exhausted
                )
                .await;
            }
            RequeueOutcome::Rejected(Rejected { item, reason }) => {
                bump(self.metrics.retry_rejected());
                warn!(
                    "ERROR_CODE=INGEST_RETRY_REJECTED retry not queued, message left unseen: key={}, reason={:?}, attempt_count={}",
                    item.key(),
                    reason,
                    item.attempt_count()
                );
                self.ledger.defer(item.key().clone(), item.progress());
            }
        }
    }

    fn publish_exhausted(
        &self,
        item: &RetryableItem
    ) {
        let Some(sink) = &self.exhausted_sink else {
            return;
        };
        match sink.try_send(ExhaustedTask::from(item)) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => warn!(
                "ERROR_CODE=INGEST_EXHAUSTED_SINK_FULL exhausted task not published: key={}",
                task.key
            ),
            Err(TrySendError::Closed(task)) => {
                debug!("exhausted sink closed: key={}", task.key)
            }
        }
    }

    async fn drop_unroutable(
        &self,
        item: RetryableItem
    ) {
        bump(self.metrics.unroutable());
        warn!(
            "ERROR_CODE=INGEST_UNROUTABLE no handler for destination, task dropped: key={}, destination={}, from={}",
            item.key(),
            item.destination(),
            item.payload().from
        );
        self.settle(
            item.key().clone(),
            Hold::Unroutable,
            self.settings.mark_seen_unroutable
        )
        .await;
    }

    /// Finishes with a message the pipeline will not dispatch again.
    async fn settle(
        &self,
        key: SourceKey,
        hold: Hold,
        mark_seen: bool
    ) {
        if !mark_seen {
            self.ledger.hold(key, hold);
            return;
        }

        match self.transport.mark_read(key.uid, &key.mailbox).await {
            Ok(()) => self.ledger.release(&key),
            Err(err) => {
                bump(self.metrics.mark_read_failures());
                warn!(
                    "ERROR_CODE=INGEST_ACK_FAILED message not marked seen, will retry ack: key={key}, hold={hold:?}, error={err}"
                );
                self.ledger.hold(key, Hold::PendingAck);
            }
        }
    }
}
