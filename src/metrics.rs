use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::block::BlockStats;
use crate::index::DirectoryStats;

/// Counters updated by the processor threads and read by any caller.
#[derive(Debug, Default)]
pub struct Metrics {
    submitted: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    callbacks: AtomicU64,
    migrations: AtomicU64,

    keys: AtomicU64,
    block_count: AtomicU64,
    free_blocks: AtomicU64,
    directory_capacity: AtomicU64,
    split: AtomicBool,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Transactions accepted onto the intake queue
    pub submitted: u64,
    /// Transactions run against storage, successful or not
    pub applied: u64,
    /// Transactions that completed unsuccessfully, including those failed at
    /// shutdown
    pub failed: u64,
    /// Submissions refused because the store was shutting down
    pub rejected: u64,
    pub callbacks: u64,
    /// Directory rows moved between generations
    pub migrations: u64,

    pub keys: u64,
    pub block_count: u64,
    pub free_blocks: u64,
    pub directory_capacity: u64,
    pub split: bool,
}

impl Metrics {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self, succeeded: bool) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A queued transaction failed without being applied.
    pub(crate) fn record_aborted(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_callback(&self) {
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_storage(&self, blocks: BlockStats, directory: DirectoryStats) {
        self.keys.store(directory.len(), Ordering::Relaxed);
        self.block_count.store(blocks.block_count, Ordering::Relaxed);
        self.free_blocks.store(blocks.free_blocks, Ordering::Relaxed);
        self.directory_capacity
            .store(directory.new_capacity as u64, Ordering::Relaxed);
        self.split.store(directory.split, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            callbacks: self.callbacks.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            keys: self.keys.load(Ordering::Relaxed),
            block_count: self.block_count.load(Ordering::Relaxed),
            free_blocks: self.free_blocks.load(Ordering::Relaxed),
            directory_capacity: self.directory_capacity.load(Ordering::Relaxed),
            split: self.split.load(Ordering::Relaxed),
        }
    }
}

/// Logs every counter as one event.
pub fn log_metrics(snapshot: &MetricsSnapshot) {
    tracing::info!(
        submitted = snapshot.submitted,
        applied = snapshot.applied,
        failed = snapshot.failed,
        rejected = snapshot.rejected,
        callbacks = snapshot.callbacks,
        migrations = snapshot.migrations,
        keys = snapshot.keys,
        block_count = snapshot.block_count,
        free_blocks = snapshot.free_blocks,
        directory_capacity = snapshot.directory_capacity,
        split = snapshot.split,
        "Store metrics"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::default();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_applied(true);
        metrics.record_applied(false);
        metrics.record_aborted();
        metrics.record_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.applied, 2);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.rejected, 1);
    }

    #[test]
    fn test_storage_gauges() {
        let metrics = Metrics::default();
        metrics.record_storage(
            BlockStats {
                block_size: 128,
                block_count: 10,
                free_blocks: 3,
            },
            DirectoryStats {
                split: true,
                new_size: 4,
                new_capacity: 32,
                old_size: 5,
                old_capacity: 16,
            },
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.keys, 9);
        assert_eq!(snapshot.block_count, 10);
        assert_eq!(snapshot.free_blocks, 3);
        assert_eq!(snapshot.directory_capacity, 32);
        assert!(snapshot.split);

        // Logging never fails, with or without a subscriber.
        log_metrics(&snapshot);
    }
}
