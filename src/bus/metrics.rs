//! Per (message kind, subscriber kind) delivery timing.
//!
//! Publishers accumulate into the live window with atomic adds and a
//! compare-and-swap max; no publisher ever waits on another. A snapshot swaps
//! the live window for a fresh one and reads the detached window at leisure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;

type MetricKey = (&'static str, &'static str);

#[derive(Debug, Default)]
struct MetricCell {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

impl MetricCell {
    fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);

        let mut current = self.max_nanos.load(Ordering::Relaxed);
        while nanos > current {
            match self.max_nanos.compare_exchange_weak(
                current,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

#[derive(Debug)]
struct MetricsWindow {
    opened: Instant,
    cells: DashMap<MetricKey, Arc<MetricCell>>,
}

impl MetricsWindow {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            cells: DashMap::new(),
        }
    }

    fn cell(&self, key: MetricKey) -> Arc<MetricCell> {
        if let Some(cell) = self.cells.get(&key) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.cells.entry(key).or_default().value())
    }
}

/// One row of a metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricEntry {
    pub message_kind: &'static str,
    pub subscriber_kind: &'static str,
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl MetricEntry {
    /// Mean elapsed time per invocation.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Consistent view of one metrics window.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Length of the window the entries cover.
    pub window: Duration,
    /// Number of distinct (message, subscriber) pairs seen in the window.
    pub distinct: usize,
    /// Top entries by total elapsed time, descending.
    pub entries: Vec<MetricEntry>,
}

/// Lock-free delivery metrics for the typed channel.
#[derive(Debug)]
pub struct RelayMetrics {
    live: ArcSwap<MetricsWindow>,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            live: ArcSwap::from_pointee(MetricsWindow::new()),
        }
    }

    /// Record one handler invocation.
    pub fn record(&self, message_kind: &'static str, subscriber_kind: &'static str, elapsed: Duration) {
        let window = self.live.load();
        window.cell((message_kind, subscriber_kind)).record(elapsed);
    }

    /// Swap in a fresh window and return the top `top_n` entries of the old one.
    ///
    /// A publisher that loaded the old window just before the swap may still
    /// land one sample in it after the read; that sample is lost.
    pub fn snapshot_and_reset(&self, top_n: usize) -> MetricsSnapshot {
        let detached = self.live.swap(Arc::new(MetricsWindow::new()));

        let mut entries: Vec<MetricEntry> = detached
            .cells
            .iter()
            .map(|entry| {
                let (message_kind, subscriber_kind) = *entry.key();
                let cell = entry.value();
                MetricEntry {
                    message_kind,
                    subscriber_kind,
                    count: cell.count.load(Ordering::Relaxed),
                    total: Duration::from_nanos(cell.total_nanos.load(Ordering::Relaxed)),
                    max: Duration::from_nanos(cell.max_nanos.load(Ordering::Relaxed)),
                }
            })
            .collect();

        let distinct = entries.len();
        entries.sort_by(|a, b| b.total.cmp(&a.total));
        entries.truncate(top_n);

        MetricsSnapshot {
            window: detached.opened.elapsed(),
            distinct,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_count_total_and_max() {
        let metrics = RelayMetrics::new();
        metrics.record("RawPacket", "Recorder", Duration::from_micros(10));
        metrics.record("RawPacket", "Recorder", Duration::from_micros(30));

        let snapshot = metrics.snapshot_and_reset(10);
        assert_eq!(snapshot.entries.len(), 1);
        let entry = &snapshot.entries[0];
        assert_eq!(entry.count, 2);
        assert_eq!(entry.total, Duration::from_micros(40));
        assert_eq!(entry.max, Duration::from_micros(30));
        assert_eq!(entry.mean(), Duration::from_micros(20));
    }

    #[test]
    fn test_snapshot_resets_window() {
        let metrics = RelayMetrics::new();
        metrics.record("RawPacket", "Recorder", Duration::from_micros(10));
        let _ = metrics.snapshot_and_reset(10);

        let snapshot = metrics.snapshot_and_reset(10);
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.distinct, 0);
    }

    #[test]
    fn test_snapshot_orders_by_total_and_truncates() {
        let metrics = RelayMetrics::new();
        metrics.record("A", "S", Duration::from_millis(1));
        metrics.record("B", "S", Duration::from_millis(5));
        metrics.record("C", "S", Duration::from_millis(3));

        let snapshot = metrics.snapshot_and_reset(2);
        assert_eq!(snapshot.distinct, 3);
        let kinds: Vec<_> = snapshot.entries.iter().map(|e| e.message_kind).collect();
        assert_eq!(kinds, vec!["B", "C"]);
    }

    #[test]
    fn test_concurrent_max_is_exact() {
        let metrics = Arc::new(RelayMetrics::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|n| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        metrics.record("M", "S", Duration::from_nanos(n * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot_and_reset(1);
        assert_eq!(snapshot.entries[0].count, 8000);
        assert_eq!(snapshot.entries[0].max, Duration::from_nanos(8999));
    }
}
