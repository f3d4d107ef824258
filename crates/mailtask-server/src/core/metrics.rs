use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! ingest_counters {
    ($($name:ident),+ $(,)?) => {
        /// Monotonic counters updated by the poll loop.
        #[derive(Debug, Default)]
        pub struct IngestMetrics {
            $($name: AtomicU64,)+
        }

        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct MetricsSnapshot {
            $(pub $name: u64,)+
        }

        impl IngestMetrics {
            $(
                pub fn $name(&self) -> &AtomicU64 {
                    &self.$name
                }
            )+

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

ingest_counters!(
    cycles,
    fetched,
    fetch_failures,
    enqueued,
    duplicates,
    backpressure_drops,
    parse_failures,
    quarantined,
    dispatched,
    handler_failures,
    retries_scheduled,
    retry_rejected,
    exhausted,
    unroutable,
    mark_read_failures,
    loop_errors,
);

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(
    counter: &AtomicU64,
    value: u64
) {
    counter.fetch_add(value, Ordering::Relaxed);
}

impl MetricsSnapshot {
    /// Every handler invocation, successful or not.
    pub fn dispatch_attempts(&self) -> u64 {
        self.dispatched + self.handler_failures
    }
}
