//! Admission control: a worker semaphore behind an atomic queue ceiling

use pii_common::ScanError;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds in-flight plus queued scans
pub struct Admission {
    workers: usize,
    ceiling: usize,
    semaphore: Arc<Semaphore>,
    /// Requests holding or waiting for a worker
    pending: AtomicUsize,
}

/// Worker slot; released on drop
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    _pending: PendingGuard,
}

struct PendingGuard(Arc<Admission>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time admission view
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    /// Worker slots
    pub workers: usize,
    /// Scans currently running
    pub in_flight: usize,
    /// Scans running or queued
    pub pending: usize,
    /// Maximum running plus queued
    pub ceiling: usize,
}

impl Admission {
    /// Create with `workers` slots and room for `queue_depth` waiters
    pub fn new(workers: usize, queue_depth: usize) -> Arc<Self> {
        let workers = workers.max(1);
        Arc::new(Self {
            workers,
            ceiling: workers + queue_depth,
            semaphore: Arc::new(Semaphore::new(workers)),
            pending: AtomicUsize::new(0),
        })
    }

    /// Wait for a worker slot until `deadline`.
    ///
    /// Fails immediately when the queue is full and with `CapacityExceeded`
    /// when the deadline passes first.
    pub async fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
    ) -> Result<AdmissionPermit, ScanError> {
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(self.clone());
        if previous >= self.ceiling {
            return Err(ScanError::CapacityExceeded);
        }

        let acquire = self.semaphore.clone().acquire_owned();
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), acquire).await {
            Ok(Ok(permit)) => Ok(AdmissionPermit {
                _permit: permit,
                _pending: guard,
            }),
            _ => Err(ScanError::CapacityExceeded),
        }
    }

    /// Current occupancy
    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            workers: self.workers,
            in_flight: self.workers - self.semaphore.available_permits(),
            pending: self.pending.load(Ordering::Acquire),
            ceiling: self.ceiling,
        }
    }
}
