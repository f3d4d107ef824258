use std::fmt::Debug;
use std::future::Future;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_imap::error::Error as ImapError;
use async_imap::types::Uid;
use async_imap::{Client, Session};
use async_native_tls::TlsConnector;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use time::{Month, OffsetDateTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, trace, warn};

use super::transport::{
    ConnectionState, ConnectionTracker, MailTransport, RawMessage, TransportError,
    UnreadBatch
};
use crate::config::ImapConfig;

const IMAP_FETCH_QUERY_BODY_UID: &str = "(UID BODY.PEEK[])";
const IMAP_STORE_SEEN: &str = "+FLAGS (\\Seen)";

trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

type ImapSession = Session<Box<dyn ImapStream>>;

struct LiveSession {
    session: ImapSession,
    selected: Option<String>
}

/// `MailTransport` over one IMAP session.
///
/// The session lives behind an async mutex so remote calls are serialized and
/// a dead session can be swapped out without the caller noticing.
pub struct ImapTransport {
    config: ImapConfig,
    session: Mutex<Option<LiveSession>>,
    tracker: ConnectionTracker
}

impl ImapTransport {
    pub fn new(config: ImapConfig) -> Self {
        Self { config, session: Mutex::new(None), tracker: ConnectionTracker::default() }
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.config.op_timeout_secs.max(1))
    }

    async fn bounded<T, F>(
        &self,
        op: &'static str,
        fut: F
    ) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, ImapError>>,
    {
        match tokio::time::timeout(self.op_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify_imap_error(op, err)),
            Err(_) => Err(TransportError::Timeout {
                op,
                timeout_secs: self.config.op_timeout_secs
            })
        }
    }

    /// Records `err` and drops the session unless the server merely refused
    /// the command.
    fn fail(
        &self,
        slot: &mut Option<LiveSession>,
        err: TransportError
    ) -> TransportError {
        let kept = err.keeps_session() && slot.is_some();
        if !kept {
            *slot = None;
        }
        self.tracker.record_failure(&err, kept);
        warn!(
            "ERROR_CODE=IMAP_{} imap call failed: host={}, session_kept={}, error={}",
            err.code(),
            self.config.host,
            kept,
            err
        );
        err
    }

    async fn select_in(
        &self,
        live: &mut LiveSession,
        mailbox: &str
    ) -> Result<(), TransportError> {
        // A failed SELECT leaves no mailbox selected.
        live.selected = None;
        self.bounded("select", live.session.select(mailbox)).await?;
        live.selected = Some(mailbox.to_string());
        Ok(())
    }

    async fn fetch_batch(
        &self,
        live: &mut LiveSession,
        mailbox: &str
    ) -> Result<UnreadBatch, TransportError> {
        self.select_in(live, mailbox).await?;

        let query = build_uid_search_query(self.config.max_history);
        let mut unseen: Vec<Uid> = self
            .bounded("uid search", live.session.uid_search(&query))
            .await?
            .into_iter()
            .collect();
        // Newest first so a capped poll still sees recent mail.
        unseen.sort_unstable_by(|a, b| b.cmp(a));

        let max_messages = self.config.max_messages_per_poll.max(1);
        let selected: Vec<Uid> = unseen.iter().copied().take(max_messages).collect();

        debug!(
            "imap unseen selected: mailbox={}, unseen_total={}, selected={}, max_messages_per_poll={}, search_query={}",
            mailbox,
            unseen.len(),
            selected.len(),
            max_messages,
            query
        );

        let mut batch = UnreadBatch {
            mailbox: mailbox.to_string(),
            unseen,
            messages: Vec::with_capacity(selected.len()),
            fetch_failures: 0
        };
        if selected.is_empty() {
            return Ok(batch);
        }

        let uid_set = selected.iter().map(Uid::to_string).collect::<Vec<_>>().join(",");
        let fetched = self
            .bounded("uid fetch", async {
                let mut fetches =
                    live.session.uid_fetch(&uid_set, IMAP_FETCH_QUERY_BODY_UID).await?;
                let mut fetched = Vec::new();
                while let Some(fetch) = fetches.try_next().await? {
                    match (fetch.uid, fetch.body()) {
                        (Some(uid), Some(body)) => {
                            fetched.push(RawMessage { uid, raw: body.to_vec() })
                        }
                        (uid, _) => {
                            warn!("imap fetch item without uid or body: uid={uid:?}")
                        }
                    }
                }
                Ok::<_, ImapError>(fetched)
            })
            .await?;

        if fetched.is_empty() {
            // Some servers report UIDs in SEARCH but stream nothing for a
            // batched FETCH.
            warn!(
                "imap batch fetch returned no messages, retrying per-uid fetch: mailbox={}, selected={}",
                mailbox,
                selected.len()
            );
            for &uid in &selected {
                match self.fetch_single_message_body(live, uid).await {
                    Ok(Some(raw)) => batch.messages.push(RawMessage { uid, raw }),
                    Ok(None) => {
                        batch.fetch_failures += 1;
                        warn!("imap per-uid fetch returned no body: uid={uid}");
                    }
                    Err(err) if err.keeps_session() => {
                        batch.fetch_failures += 1;
                        warn!("imap per-uid fetch refused: uid={uid}, error={err}");
                    }
                    Err(err) => return Err(err)
                }
            }
        } else {
            batch.fetch_failures = selected.len().saturating_sub(fetched.len());
            batch.messages = fetched;
        }

        Ok(batch)
    }

    async fn fetch_single_message_body(
        &self,
        live: &mut LiveSession,
        uid: Uid
    ) -> Result<Option<Vec<u8>>, TransportError> {
        self.bounded("uid fetch single", async {
            let mut fetches = live
                .session
                .uid_fetch(uid.to_string(), IMAP_FETCH_QUERY_BODY_UID)
                .await?;
            while let Some(fetch) = fetches.try_next().await? {
                if let Some(bytes) = fetch.body() {
                    debug!(
                        "imap message fetched (per-uid): uid={}, bytes={}",
                        fetch.uid.unwrap_or(uid),
                        bytes.len()
                    );
                    return Ok(Some(bytes.to_vec()));
                }
            }
            Ok(None)
        })
        .await
    }

    async fn store_seen(
        &self,
        live: &mut LiveSession,
        source_id: u32,
        mailbox: &str
    ) -> Result<(), TransportError> {
        if live.selected.as_deref() != Some(mailbox) {
            self.select_in(live, mailbox).await?;
        }

        self.bounded("uid store", async {
            let mut updates =
                live.session.uid_store(source_id.to_string(), IMAP_STORE_SEEN).await?;
            while updates.try_next().await?.is_some() {}
            Ok::<_, ImapError>(())
        })
        .await
    }

    fn disconnected(&self) -> TransportError {
        let err = TransportError::Disconnected;
        self.tracker.record_failure(&err, false);
        err
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self.session.lock().await;

        if let Some(live) = slot.as_mut() {
            match self.bounded("noop", live.session.noop()).await {
                Ok(()) => {
                    self.tracker.record_alive();
                    trace!("imap session alive: host={}", self.config.host);
                    return Ok(());
                }
                Err(err) => {
                    // Stale session. Only the login below counts toward error_count.
                    *slot = None;
                    debug!(
                        "imap session stale, logging in again: host={}, error={}",
                        self.config.host, err
                    );
                }
            }
        }

        match open_imap_session(&self.config).await {
            Ok(session) => {
                *slot = Some(LiveSession { session, selected: None });
                self.tracker.record_authenticated();
                info!(
                    "imap connected: host={}, port={}, tls={}, user={}",
                    self.config.host, self.config.port, self.config.tls, self.config.user
                );
                Ok(())
            }
            Err(err) => {
                *slot = None;
                let err = TransportError::Connect(format!("{err:#}"));
                self.tracker.record_failure(&err, false);
                warn!(
                    "ERROR_CODE=IMAP_CONNECT_FAILED imap connect failed: host={}, port={}, error={}",
                    self.config.host, self.config.port, err
                );
                Err(err)
            }
        }
    }

    async fn select_mailbox(
        &self,
        mailbox: &str
    ) -> Result<(), TransportError> {
        self.ensure_connected().await?;

        let mut slot = self.session.lock().await;
        let Some(live) = slot.as_mut() else {
            return Err(self.disconnected());
        };
        let result = self.select_in(live, mailbox).await;
        result.map_err(|err| self.fail(&mut slot, err))
    }

    async fn fetch_unread(
        &self,
        mailbox: &str
    ) -> Result<UnreadBatch, TransportError> {
        self.ensure_connected().await?;

        let mut slot = self.session.lock().await;
        let Some(live) = slot.as_mut() else {
            return Err(self.disconnected());
        };
        let result = self.fetch_batch(live, mailbox).await;
        result.map_err(|err| self.fail(&mut slot, err))
    }

    async fn mark_read(
        &self,
        source_id: u32,
        mailbox: &str
    ) -> Result<(), TransportError> {
        self.ensure_connected().await?;

        let mut slot = self.session.lock().await;
        let Some(live) = slot.as_mut() else {
            return Err(self.disconnected());
        };
        let result = self.store_seen(live, source_id, mailbox).await;
        match result {
            Ok(()) => {
                debug!("imap marked seen: mailbox={mailbox}, uid={source_id}");
                Ok(())
            }
            Err(err) => Err(self.fail(&mut slot, err))
        }
    }

    fn health(&self) -> ConnectionState {
        self.tracker.snapshot()
    }

    async fn close(&self) {
        let mut slot = self.session.lock().await;
        if let Some(mut live) = slot.take() {
            let logout_timeout =
                Duration::from_secs(self.config.logout_timeout_secs.clamp(1, 3));
            match tokio::time::timeout(logout_timeout, live.session.logout()).await {
                Ok(Ok(())) => debug!("imap logout complete: host={}", self.config.host),
                Ok(Err(err)) => debug!("imap logout failed: error={err}"),
                Err(_) => debug!(
                    "imap logout timed out: timeout_secs={}",
                    logout_timeout.as_secs()
                )
            }
        }
        self.tracker.record_closed();
    }
}

fn classify_imap_error(
    op: &'static str,
    err: ImapError
) -> TransportError {
    match err {
        ImapError::No(message) | ImapError::Bad(message) => {
            TransportError::Rejected { op, message }
        }
        other => TransportError::Protocol { op, message: other.to_string() }
    }
}

fn build_uid_search_query(max_history: Option<StdDuration>) -> String {
    match max_history {
        Some(duration) => {
            let since = format_imap_since_date(duration);
            format!("UNSEEN SINCE {since}")
        }
        None => "UNSEEN".to_string()
    }
}

fn format_imap_since_date(duration: StdDuration) -> String {
    let seconds = duration.as_secs().min(i64::MAX as u64) as i64;
    let cutoff = OffsetDateTime::now_utc()
        .checked_sub(time::Duration::seconds(seconds))
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    format!("{:02}-{}-{}", cutoff.day(), month_short(cutoff.month()), cutoff.year())
}

fn month_short(month: Month) -> &'static str {
    match month {
        Month::January => "Jan",
        Month::February => "Feb",
        Month::March => "Mar",
        Month::April => "Apr",
        Month::May => "May",
        Month::June => "Jun",
        Month::July => "Jul",
        Month::August => "Aug",
        Month::September => "Sep",
        Month::October => "Oct",
        Month::November => "Nov",
        Month::December => "Dec"
    }
}

async fn open_imap_session(config: &ImapConfig) -> Result<ImapSession> {
    let host = config.host.as_str();
    let port = config.port;
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));

    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| {
            format!(
                "imap tcp connect timeout: host={host}, port={port}, timeout_secs={}",
                config.connect_timeout_secs
            )
        })?
        .with_context(|| format!("imap tcp connect failed: host={host}, port={port}"))?;

    let stream: Box<dyn ImapStream> = if config.tls {
        let tls = TlsConnector::new();
        let tls_stream = tokio::time::timeout(connect_timeout, tls.connect(host, tcp))
            .await
            .with_context(|| {
                format!(
                    "imap tls handshake timeout: host={host}, port={port}, timeout_secs={}",
                    config.connect_timeout_secs
                )
            })?
            .with_context(|| {
                format!("imap tls handshake failed: host={host}, port={port}")
            })?;
        Box::new(tls_stream)
    } else {
        Box::new(tcp)
    };

    let mut client = Client::new(stream);
    let resp = tokio::time::timeout(connect_timeout, client.read_response())
        .await
        .with_context(|| {
            format!(
                "imap greeting timeout: host={host}, port={port}, timeout_secs={}",
                config.connect_timeout_secs
            )
        })?
        .context("failed to read imap greeting")?
        .context("unexpected end of stream while waiting imap greeting")?;

    trace!("imap greeting: {resp:?}");

    let user = config.user.as_str();
    tokio::time::timeout(connect_timeout, client.login(user, &config.pass))
        .await
        .with_context(|| {
            format!(
                "imap login timeout: host={host}, user={user}, timeout_secs={}",
                config.connect_timeout_secs
            )
        })?
        .map_err(|(err, _client)| err)
        .with_context(|| format!("imap login failed: host={host}, user={user}"))
}
