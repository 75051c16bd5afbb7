//! Save Context Module
//!
//! Per-save state threaded through every image writer: the transaction id of
//! the snapshot, a cooperative cancellation flag, and progress counters used
//! for periodic reporting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Error raised when a save observes the cancellation flag. Callers must be
/// able to tell this apart from an I/O failure.
#[derive(Error, Debug, Clone)]
#[error("save of namespace cancelled: {reason}")]
pub struct SaveCancelled {
    pub reason: String,
}

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    reason: Mutex<String>,
    processed: AtomicU64,
}

/// State carried through one `save_namespace` operation. Cloning shares the
/// cancellation flag and counters, so each parallel writer can hold its own
/// handle.
#[derive(Debug, Clone, Default)]
pub struct SaveContext {
    shared: Arc<Shared>,
    tx_id: i64,
    total_nodes: u64,
}

impl SaveContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction id at which the snapshot was taken. Written into the image
    /// prefix and used to seed the journal's start id on reload.
    pub fn tx_id(&self) -> i64 {
        self.tx_id
    }

    pub fn set_tx_id(&mut self, tx_id: i64) {
        self.tx_id = tx_id;
    }

    /// Total inode count of the snapshot, fixed before writers start.
    pub fn set_total_nodes(&mut self, total: u64) {
        self.total_nodes = total;
    }

    /// Request cancellation. Writers observe the flag at their next check.
    pub fn cancel(&self, reason: &str) {
        *self.shared.reason.lock().expect("reason lock") = reason.to_string();
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with a typed cancellation error if a cancel was requested.
    pub fn check_cancelled(&self) -> Result<(), SaveCancelled> {
        if self.is_cancelled() {
            return Err(SaveCancelled {
                reason: self.shared.reason.lock().expect("reason lock").clone(),
            });
        }
        Ok(())
    }

    /// Count `n` more processed inodes and return the percentage complete.
    pub fn add_processed(&self, n: u64) -> u64 {
        let done = self.shared.processed.fetch_add(n, Ordering::Relaxed) + n;
        if self.total_nodes == 0 {
            100
        } else {
            done * 100 / self.total_nodes
        }
    }

    /// Reset counters and the flag between operations.
    pub fn clear(&mut self) {
        self.shared.cancelled.store(false, Ordering::SeqCst);
        self.shared.processed.store(0, Ordering::Relaxed);
        self.total_nodes = 0;
    }
}
