use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::ledger::LedgerCounts;
use super::metrics::MetricsSnapshot;
use super::queue::QueueSnapshot;
use super::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping
}

impl fmt::Display for LifecycleState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>
    ) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping"
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub messages_per_minute: f64,
    pub dispatch_per_minute: f64,
    /// Retries scheduled per dispatch attempt.
    pub retry_ratio: f64
}

/// Point-in-time view of the ingestion pipeline.
///
/// Each section is consistent on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: LifecycleState,
    pub ready: bool,
    pub connection: ConnectionState,
    pub queue: QueueSnapshot,
    pub ledger: LedgerCounts,
    pub metrics: MetricsSnapshot,
    pub uptime_secs: u64,
    pub throughput: Throughput
}

pub fn assemble(
    state: LifecycleState,
    connection: ConnectionState,
    queue: QueueSnapshot,
    ledger: LedgerCounts,
    metrics: MetricsSnapshot,
    uptime: Duration
) -> HealthReport {
    let minutes = uptime.as_secs_f64().max(1.0) / 60.0;
    let attempts = metrics.dispatch_attempts().max(1) as f64;

    HealthReport {
        ready: state == LifecycleState::Running && connection.healthy,
        throughput: Throughput {
            messages_per_minute: metrics.fetched as f64 / minutes,
            dispatch_per_minute: metrics.dispatched as f64 / minutes,
            retry_ratio: metrics.retries_scheduled as f64 / attempts
        },
        uptime_secs: uptime.as_secs(),
        state,
        connection,
        queue,
        ledger,
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> QueueSnapshot {
        QueueSnapshot {
            size: 0,
            fresh_size: 0,
            capacity: 100,
            retry_size: 0,
            retry_capacity: 100,
            processing: false
        }
    }

    #[test]
    fn ready_requires_running_and_healthy_connection() {
        let healthy = ConnectionState { healthy: true, connected: true, ..Default::default() };

        let report = assemble(
            LifecycleState::Running,
            healthy.clone(),
            queue(),
            LedgerCounts::default(),
            MetricsSnapshot::default(),
            Duration::from_secs(30)
        );
        assert!(report.ready);

        let report = assemble(
            LifecycleState::Stopping,
            healthy,
            queue(),
            LedgerCounts::default(),
            MetricsSnapshot::default(),
            Duration::from_secs(30)
        );
        assert!(!report.ready);

        let report = assemble(
            LifecycleState::Running,
            ConnectionState::default(),
            queue(),
            LedgerCounts::default(),
            MetricsSnapshot::default(),
            Duration::from_secs(30)
        );
        assert!(!report.ready);
    }

    #[test]
    fn throughput_is_derived_from_counters() {
        let metrics = MetricsSnapshot {
            fetched: 20,
            dispatched: 8,
            handler_failures: 2,
            retries_scheduled: 2,
            ..Default::default()
        };

        let report = assemble(
            LifecycleState::Running,
            ConnectionState::default(),
            queue(),
            LedgerCounts::default(),
            metrics,
            Duration::from_secs(120)
        );

        assert_eq!(report.uptime_secs, 120);
        assert!((report.throughput.messages_per_minute - 10.0).abs() < f64::EPSILON);
        assert!((report.throughput.dispatch_per_minute - 4.0).abs() < f64::EPSILON);
        assert!((report.throughput.retry_ratio - 0.2).abs() < 1e-9);
    }

    #[test]
    fn retry_ratio_without_dispatches_is_zero() {
        let report = assemble(
            LifecycleState::Stopped,
            ConnectionState::default(),
            queue(),
            LedgerCounts::default(),
            MetricsSnapshot::default(),
            Duration::ZERO
        );
        assert_eq!(report.throughput.retry_ratio, 0.0);
        assert_eq!(report.state.to_string(), "stopped");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["ready"], false);
    }
}
