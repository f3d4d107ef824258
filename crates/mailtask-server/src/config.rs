use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::core::{IngestSettings, MailboxRoute, QueueLimits, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_health_listen")]
    pub health_listen: String,
    /// Name stamped on frames sent to downstream consumers.
    #[serde(default = "default_source")]
    pub source: String,
    pub imap: ImapConfig,
    #[serde(default)]
    pub mailboxes: Vec<MailboxConfig>,
    /// Recipient address -> destination name.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerConfig>,
    /// Exhausted tasks are written here as JSON when set.
    #[serde(default)]
    pub dead_letter_dir: Option<PathBuf>
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_config_path)
            .context(
                "config path not found (MAILTASK_CONFIG_PATH or mailtask.yaml/mailtask.yml)",
            )?;

        let raw = std::fs::read(&config_path).with_context(|| {
            format!("failed to read config file {}", config_path.display())
        })?;
        Self::from_yaml_slice(&raw).with_context(|| {
            format!("invalid config {}", config_path.display())
        })
    }

    pub fn from_yaml_slice(raw: &[u8]) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_slice(raw).context("failed to parse YAML config")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.health_listen = trim_owned(self.health_listen.clone());
        self.source = trim_owned(self.source.clone());

        if self.health_listen.is_empty() {
            self.health_listen = default_health_listen();
        }
        if self.source.is_empty() {
            self.source = default_source();
        }

        self.imap.normalize();

        for mailbox in &mut self.mailboxes {
            mailbox.name = trim_owned(mailbox.name.clone());
            mailbox.destination = normalize_opt(mailbox.destination.clone());
        }
        self.mailboxes.retain(|mailbox| !mailbox.name.is_empty());
        if self.mailboxes.is_empty() {
            self.mailboxes.push(MailboxConfig {
                name: default_mailbox(),
                destination: None
            });
        }

        self.routes = std::mem::take(&mut self.routes)
            .into_iter()
            .map(|(address, destination)| {
                (address.trim().to_ascii_lowercase(), trim_owned(destination))
            })
            .filter(|(address, destination)| {
                !address.is_empty() && !destination.is_empty()
            })
            .collect();

        self.queue.capacity = self.queue.capacity.max(1);
        self.queue.retry_capacity = self.queue.retry_capacity.max(1);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
        self.poll.drain_budget = self.poll.drain_budget.max(1);
        self.poll.max_parse_failures = self.poll.max_parse_failures.max(1);
    }

    fn validate(&self) -> Result<()> {
        self.imap.validate()?;

        if self.handlers.is_empty() {
            bail!("config has no `handlers`; nothing could consume tasks");
        }

        let mut seen = BTreeSet::new();
        for mailbox in &self.mailboxes {
            if !seen.insert(mailbox.name.as_str()) {
                bail!("mailbox `{}` listed twice", mailbox.name);
            }
        }

        let referenced = self
            .routes
            .values()
            .map(String::as_str)
            .chain(self.mailboxes.iter().filter_map(|m| m.destination.as_deref()));
        for destination in referenced {
            if !self.handlers.contains_key(destination) {
                bail!("destination `{destination}` has no entry in `handlers`");
            }
        }

        for (name, handler) in &self.handlers {
            handler.validate(name)?;
        }

        Ok(())
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            capacity: self.queue.capacity,
            retry_capacity: self.queue.retry_capacity
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry.base_delay,
            max_attempts: self.retry.max_attempts
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            mailboxes: self
                .mailboxes
                .iter()
                .map(|mailbox| MailboxRoute {
                    name: mailbox.name.clone(),
                    destination: mailbox.destination.clone()
                })
                .collect(),
            poll_interval: self.poll.interval,
            reconnect_backoff: self.poll.reconnect_backoff,
            error_backoff: self.poll.error_backoff,
            drain_budget: self.poll.drain_budget,
            stop_timeout: self.poll.stop_timeout,
            max_parse_failures: self.poll.max_parse_failures,
            mark_seen_on_exhausted: self.poll.mark_seen_on_exhausted,
            mark_seen_unroutable: self.poll.mark_seen_unroutable
        }
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: mailtask-server [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: mailtask-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    pub user: String,
    pub pass: String,
    #[serde(default = "default_imap_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_imap_op_timeout_secs")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_imap_logout_timeout_secs")]
    pub logout_timeout_secs: u64,
    #[serde(default = "default_imap_max_messages_per_poll")]
    pub max_messages_per_poll: usize,
    #[serde(
        default,
        deserialize_with = "mailtask_helpers::de::deserialize_optional_duration"
    )]
    pub max_history: Option<Duration>
}

impl ImapConfig {
    fn normalize(&mut self) {
        self.host = trim_owned(self.host.clone());
        self.user = trim_owned(self.user.clone());

        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.op_timeout_secs = self.op_timeout_secs.max(1);
        // Logout may hang on a dead socket; keep the cap between 1s and 3s.
        self.logout_timeout_secs = self.logout_timeout_secs.clamp(1, 3);
        self.max_messages_per_poll = self.max_messages_per_poll.max(1);
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("config missing `imap.host`");
        }
        if self.user.is_empty() {
            bail!("config missing `imap.user`");
        }
        if self.pass.trim().is_empty() {
            bail!("config missing `imap.pass`");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailboxConfig {
    pub name: String,
    /// Used when no recipient address matches a route.
    #[serde(default)]
    pub destination: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub retry_capacity: usize
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            retry_capacity: default_queue_capacity()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(
        default = "default_retry_base_delay",
        deserialize_with = "mailtask_helpers::de::deserialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: default_retry_base_delay(),
            max_attempts: default_retry_max_attempts()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "mailtask_helpers::de::deserialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_backoff",
        deserialize_with = "mailtask_helpers::de::deserialize_duration"
    )]
    pub reconnect_backoff: Duration,
    #[serde(
        default = "default_backoff",
        deserialize_with = "mailtask_helpers::de::deserialize_duration"
    )]
    pub error_backoff: Duration,
    #[serde(default = "default_drain_budget")]
    pub drain_budget: usize,
    #[serde(
        default = "default_stop_timeout",
        deserialize_with = "mailtask_helpers::de::deserialize_duration"
    )]
    pub stop_timeout: Duration,
    #[serde(default = "default_max_parse_failures")]
    pub max_parse_failures: u32,
    #[serde(default = "default_true")]
    pub mark_seen_on_exhausted: bool,
    #[serde(default = "default_true")]
    pub mark_seen_unroutable: bool
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            reconnect_backoff: default_backoff(),
            error_backoff: default_backoff(),
            drain_budget: default_drain_budget(),
            stop_timeout: default_stop_timeout(),
            max_parse_failures: default_max_parse_failures(),
            mark_seen_on_exhausted: true,
            mark_seen_unroutable: true
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Frame each task to a TCP consumer and wait for its ACK.
    Forward {
        addr: String,
        #[serde(default = "default_forward_timeout_secs")]
        timeout_secs: u64
    },
    /// Drop each task as a JSON file into a directory.
    Spool { dir: PathBuf }
}

impl HandlerConfig {
    fn validate(
        &self,
        name: &str
    ) -> Result<()> {
        match self {
            Self::Forward { addr, .. } if addr.trim().is_empty() => {
                bail!("handler `{name}` missing `addr`")
            }
            Self::Spool { dir } if dir.as_os_str().is_empty() => {
                bail!("handler `{name}` missing `dir`")
            }
            _ => Ok(())
        }
    }
}

fn load_config_candidates(dir: &Path) -> Option<PathBuf> {
    ["mailtask.yaml", "mailtask.yml"]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("MAILTASK_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(found) =
        non_empty_env("HOME").and_then(|home| load_config_candidates(Path::new(&home)))
    {
        return Some(found);
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    load_config_candidates(&cwd)
}

fn default_health_listen() -> String {
    "127.0.0.1:2148".to_string()
}

fn default_source() -> String {
    "mailtask".to_string()
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_true() -> bool {
    true
}

fn default_imap_port() -> u16 {
    993
}

fn default_imap_connect_timeout_secs() -> u64 {
    10
}

fn default_imap_op_timeout_secs() -> u64 {
    30
}

fn default_imap_logout_timeout_secs() -> u64 {
    2
}

fn default_imap_max_messages_per_poll() -> usize {
    200
}

fn default_queue_capacity() -> usize {
    100
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_drain_budget() -> usize {
    50
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_parse_failures() -> u32 {
    5
}

fn default_forward_timeout_secs() -> u64 {
    30
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}
