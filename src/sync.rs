//! Mirror sync: coalescing push queue and periodic refresh.
//!
//! DESIGN
//! ======
//! Pushes go through a single pending slot plus an in-flight flag. A write
//! while a push is running overwrites the slot; when the push finishes the
//! drainer sends whatever is in the slot, so only the newest snapshot ever
//! follows an in-flight push. `in_flight` is cleared under the same lock
//! that finds the slot empty, so a snapshot can never be left behind.
//!
//! The refresh task pulls the mirror on a fixed interval, the first pull
//! happening immediately at start.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::product::Product;
use crate::store::ProductStore;

// =============================================================================
// STATUS
// =============================================================================

/// Transient, user-facing state of the mirror sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing(String),
    Success(String),
    Error(String),
}

// =============================================================================
// SYNC QUEUE
// =============================================================================

#[derive(Default)]
struct Slot {
    pending: Option<Vec<Product>>,
    in_flight: bool,
}

/// Single-slot coalescing register for mirror pushes.
#[derive(Default)]
pub struct SyncQueue {
    slot: Mutex<Slot>,
}

impl SyncQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `snapshot` as the next push, replacing any older pending one.
    ///
    /// Returns `true` when no drainer is running and the caller must start
    /// one.
    pub fn enqueue(&self, snapshot: Vec<Product>) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.pending = Some(snapshot);
        if slot.in_flight {
            false
        } else {
            slot.in_flight = true;
            true
        }
    }

    /// Take the next snapshot to push. `None` ends the drain and marks the
    /// queue idle.
    pub fn next(&self) -> Option<Vec<Product>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let next = slot.pending.take();
        if next.is_none() {
            slot.in_flight = false;
        }
        next
    }

    /// Drop the pending snapshot and mark the queue idle. Used when a
    /// drainer could not be started.
    pub fn abandon(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.pending = None;
        slot.in_flight = false;
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        !slot.in_flight && slot.pending.is_none()
    }
}

// =============================================================================
// REFRESH TASK
// =============================================================================

/// Spawn the periodic mirror refresh. Returns a handle for shutdown.
pub fn spawn_refresh_task(store: ProductStore, every: Duration) -> JoinHandle<()> {
    info!(refresh_secs = every.as_secs(), "mirror refresh configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            store.refresh().await;
        }
    })
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
