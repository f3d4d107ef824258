#[cfg(target_os = "linux")]
use std::env;

use tracing_subscriber::EnvFilter;
#[cfg(target_os = "linux")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(target_os = "linux")]
use tracing_subscriber::util::SubscriberInitExt;

/// Logging setup shared by the server and the tools.
#[derive(Debug, Clone, Copy)]
pub struct LogSettings<'a> {
    /// Filter used when neither `env_key` nor `RUST_LOG` is set.
    pub default_filter: &'a str,
    pub env_key: &'a str,
    pub service_name: &'a str,
    /// Skip journald even under systemd, e.g. for one-shot CLI tools.
    pub stderr_only: bool,
}

impl<'a> LogSettings<'a> {
    pub fn service(
        service_name: &'a str,
        env_key: &'a str,
        default_filter: &'a str,
    ) -> Self {
        Self { default_filter, env_key, service_name, stderr_only: false }
    }

    pub fn stderr_only(mut self) -> Self {
        self.stderr_only = true;
        self
    }
}

pub fn init_logging(settings: LogSettings<'_>) {
    let env_filter =
        build_env_filter(settings.default_filter, settings.env_key);

    #[cfg(target_os = "linux")]
    {
        if !settings.stderr_only && is_running_under_systemd() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(layer.with_syslog_identifier(
                            settings.service_name.to_string(),
                        ))
                        .init();
                    return;
                }
                Err(err) => {
                    eprintln!(
                        "{}: journald init failed, falling back to stderr formatter: {err}",
                        settings.service_name
                    );
                }
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_env_filter(
    default_filter: &str,
    env_key: &str,
) -> EnvFilter {
    EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter))
}

#[cfg(target_os = "linux")]
#[inline]
fn is_running_under_systemd() -> bool {
    env::var_os("JOURNAL_STREAM").is_some()
        || env::var_os("INVOCATION_ID").is_some()
}

#[cfg(test)]
mod tests {
    use super::{LogSettings, build_env_filter};

    #[test]
    fn falls_back_to_default_filter_when_env_is_unset() {
        let filter = build_env_filter(
            "mailtask_server=debug",
            "MAILTASK_LOG_TEST_UNSET_KEY",
        );
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(filter.to_string(), "mailtask_server=debug");
        }
    }

    #[test]
    fn stderr_only_builder_flag() {
        let settings =
            LogSettings::service("probe", "PROBE_LOG", "warn").stderr_only();
        assert!(settings.stderr_only);
        assert_eq!(settings.service_name, "probe");
    }
}
