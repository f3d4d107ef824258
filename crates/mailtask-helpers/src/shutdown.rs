use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
    /// The token was cancelled from inside the process.
    Internal,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Terminate => write!(f, "SIGTERM"),
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Cancels `token` on SIGTERM/SIGINT and reports which one arrived.
///
/// Returns `ShutdownSignal::Internal` when something else cancelled the token
/// first.
pub async fn listen_shutdown(token: CancellationToken) -> ShutdownSignal {
    let signal = tokio::select! {
        _ = token.cancelled() => return ShutdownSignal::Internal,
        signal = wait_for_signal() => signal,
    };

    warn!("shutdown signal received: {signal}");
    token.cancel();
    signal
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownSignal {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to install SIGTERM handler: error={err}");
            return wait_for_ctrl_c().await;
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("failed to install SIGINT handler: error={err}");
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Terminate,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownSignal {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> ShutdownSignal {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: error={err}");
        std::future::pending::<()>().await;
    }
    ShutdownSignal::Interrupt
}

#[cfg(test)]
mod tests {
    use tokio::time::{Duration, timeout};
    use tokio_util::sync::CancellationToken;

    use super::{ShutdownSignal, listen_shutdown};

    #[tokio::test]
    async fn returns_internal_when_token_is_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let listener = tokio::spawn(listen_shutdown(token.clone()));

        token.cancel();
        let signal = timeout(Duration::from_secs(2), listener)
            .await
            .expect("listener should exit after cancel")
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Internal);
    }
}
