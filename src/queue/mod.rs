//! Durable operation queue.
//!
//! Pending mutations are written through to storage before anything else
//! happens to them, so a crash at any point leaves them on disk. Entries that
//! exhaust their retries move to a separate dropped collection where they
//! stay visible for diagnostics.

mod entry;

pub use entry::{record_id_of, DroppedEntry, EntityType, Operation, QueueEntry};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::Storage;

const PENDING: &str = "queue:pending";
const DROPPED: &str = "queue:dropped";

/// Snapshot of the queue for sync-status indicators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueHealth {
  /// Entries that have not failed yet
  pub pending: usize,
  /// Entries with at least one failed attempt
  pub struggling: usize,
  /// Most recent `enqueued_at` among pending entries
  pub last_enqueued_at: Option<DateTime<Utc>>,
  /// Entries dropped after exhausting their retries
  pub dropped: usize,
  /// Error of the most recently dropped entry
  pub last_drop_error: Option<String>,
}

impl QueueHealth {
  pub fn is_idle(&self) -> bool {
    self.pending == 0 && self.struggling == 0
  }
}

/// Persistent FIFO of pending mutations.
pub struct OperationQueue<S: Storage> {
  storage: Arc<S>,
}

impl<S: Storage> OperationQueue<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  /// Durably write a new entry. Returns only after the write has completed.
  pub fn append(&self, entry: &QueueEntry) -> Result<()> {
    if self.storage.get::<QueueEntry>(PENDING, &entry.id)?.is_some() {
      return Err(eyre!("Queue entry {} already exists", entry.id));
    }
    self.storage.put(PENDING, &entry.id, entry)
  }

  /// All pending entries in enqueue order.
  pub fn list_pending(&self) -> Result<Vec<QueueEntry>> {
    self.storage.list_all(PENDING)
  }

  /// Remove an entry after the remote confirmed it.
  pub fn remove(&self, entry_id: &str) -> Result<bool> {
    self.storage.delete(PENDING, entry_id)
  }

  /// Persist retry bookkeeping for an entry that is still pending.
  pub fn update(&self, entry: &QueueEntry) -> Result<()> {
    if self.storage.get::<QueueEntry>(PENDING, &entry.id)?.is_none() {
      return Err(eyre!("Queue entry {} is not pending", entry.id));
    }
    self.storage.put(PENDING, &entry.id, entry)
  }

  /// Move an entry out of the pending set and into the dropped collection.
  pub fn drop_entry(&self, entry: &QueueEntry) -> Result<DroppedEntry> {
    let dropped = DroppedEntry {
      entry: entry.clone(),
      dropped_at: Utc::now(),
    };

    // Record first: a crash in between leaves the entry pending, never lost
    self.storage.put(DROPPED, &entry.id, &dropped)?;
    self.storage.delete(PENDING, &entry.id)?;

    Ok(dropped)
  }

  /// Dropped entries, oldest first.
  pub fn dropped(&self) -> Result<Vec<DroppedEntry>> {
    self.storage.list_all(DROPPED)
  }

  /// Ids of the records of a type that still have a pending mutation.
  pub fn pending_record_ids(&self, entity_type: EntityType) -> Result<HashSet<String>> {
    Ok(
      self
        .list_pending()?
        .into_iter()
        .filter(|e| e.entity_type == entity_type)
        .filter_map(|e| e.record_id())
        .collect(),
    )
  }

  pub fn health(&self) -> Result<QueueHealth> {
    let pending = self.list_pending()?;
    let dropped = self.dropped()?;

    let struggling = pending.iter().filter(|e| e.is_struggling()).count();

    Ok(QueueHealth {
      pending: pending.len() - struggling,
      struggling,
      last_enqueued_at: pending.iter().map(|e| e.enqueued_at).max(),
      dropped: dropped.len(),
      last_drop_error: dropped
        .iter()
        .max_by_key(|d| d.dropped_at)
        .and_then(|d| d.entry.last_error.clone()),
    })
  }
}

impl<S: Storage> Clone for OperationQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
