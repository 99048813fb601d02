//! Shared progress counters
//!
//! Counters are plain atomics mutated from every concurrent transfer and
//! read by the control plane. Finished bytes count bytes *written*, not
//! bytes requested, so pause/resume never double-counts.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of a [`TransferProgress`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Total bytes the phase will process
    pub total_bytes: u64,
    /// Bytes processed so far
    pub finished_bytes: u64,
    /// Total files the phase will process
    pub total_files: u64,
    /// Files fully processed
    pub finished_files: u64,
}

impl ProgressSnapshot {
    /// Completion ratio in `[0, 1]`
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.finished_bytes as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// Byte and file counters shared across concurrent transfers
#[derive(Debug, Default)]
pub struct TransferProgress {
    total_bytes: AtomicU64,
    finished_bytes: AtomicU64,
    total_files: AtomicU64,
    finished_files: AtomicU64,
}

impl TransferProgress {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset and set the phase totals
    pub fn start_phase(&self, total_bytes: u64, total_files: u64) {
        self.total_bytes.store(total_bytes, Ordering::Relaxed);
        self.total_files.store(total_files, Ordering::Relaxed);
        self.finished_bytes.store(0, Ordering::Relaxed);
        self.finished_files.store(0, Ordering::Relaxed);
    }

    /// Seed finished bytes (already-on-disk resume estimate)
    pub fn seed_finished_bytes(&self, bytes: u64) {
        self.finished_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Add processed bytes
    pub fn add_bytes(&self, bytes: u64) {
        self.finished_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Roll back bytes counted for a file that later failed
    pub fn sub_bytes(&self, bytes: u64) {
        let mut current = self.finished_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.finished_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Mark one file finished
    pub fn finish_file(&self) {
        self.finished_files.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters at once
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            finished_bytes: self.finished_bytes.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            finished_files: self.finished_files.load(Ordering::Relaxed),
        }
    }
}
