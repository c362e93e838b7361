use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-dispatcher delivery counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    send_failures: AtomicU64,
    dead_lettered: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchStatsSnapshot {
    pub delivered: u64,
    /// Failed send attempts, retried or not
    pub send_failures: u64,
    /// Envelopes given up on after `max_send_attempts`
    pub dead_lettered: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = DispatchStats::default();
        stats.record_delivered();
        stats.record_delivered();
        stats.record_send_failure();
        stats.record_dead_lettered();
        assert_eq!(
            stats.snapshot(),
            DispatchStatsSnapshot {
                delivered: 2,
                send_failures: 1,
                dead_lettered: 1,
            }
        );
    }
}
