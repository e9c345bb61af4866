//! Drains the operation queue against the remote service.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Trigger;
use crate::cache::Storage;
use crate::config::SyncPolicy;
use crate::queue::{Operation, OperationQueue, QueueEntry};
use crate::remote::{RemoteError, RemoteService};

/// Tally of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  /// Failed but kept for a later pass
  pub retried: usize,
  /// Failed for the last time and moved to the dropped collection
  pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  /// Another drain was already running; nothing was done
  Busy,
}

/// Clears the single-flight flag when the drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Single-flight queue drainer.
pub struct SyncWorker<S: Storage, R: RemoteService> {
  queue: OperationQueue<S>,
  remote: R,
  policy: SyncPolicy,
  draining: AtomicBool,
}

impl<S: Storage, R: RemoteService> SyncWorker<S, R> {
  pub fn new(queue: OperationQueue<S>, remote: R, policy: SyncPolicy) -> Self {
    Self {
      queue,
      remote,
      policy,
      draining: AtomicBool::new(false),
    }
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  pub fn policy(&self) -> &SyncPolicy {
    &self.policy
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  /// Run one pass over the entries pending right now.
  ///
  /// Entries appended while the pass runs wait for the next one. A failing
  /// entry is never retried within the same pass. Storage errors abort the
  /// pass and are returned.
  pub async fn drain(&self) -> Result<DrainOutcome> {
    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      debug!("Drain already in progress, skipping");
      return Ok(DrainOutcome::Busy);
    };

    let snapshot = self.queue.list_pending()?;
    let mut report = DrainReport::default();
    if snapshot.is_empty() {
      return Ok(DrainOutcome::Completed(report));
    }

    info!(entries = snapshot.len(), "Draining operation queue");

    for mut entry in snapshot {
      report.attempted += 1;

      match self.dispatch(&entry).await {
        Ok(()) => {
          self.queue.remove(&entry.id)?;
          report.succeeded += 1;
          debug!(
            entry = %entry.id,
            op = %entry.operation,
            entity = %entry.entity_type,
            "Remote confirmed"
          );
        }
        Err(err) => {
          entry.retry_count += 1;
          entry.last_error = Some(err.to_string());

          if entry.retry_count > self.policy.max_retries {
            self.queue.drop_entry(&entry)?;
            report.dropped += 1;
            error!(
              entry = %entry.id,
              op = %entry.operation,
              entity = %entry.entity_type,
              attempts = entry.retry_count,
              error = %err,
              "Dropping entry after exhausting retries"
            );
          } else {
            self.queue.update(&entry)?;
            report.retried += 1;
            warn!(
              entry = %entry.id,
              op = %entry.operation,
              entity = %entry.entity_type,
              attempt = entry.retry_count,
              error = %err,
              "Remote call failed, will retry"
            );
          }
        }
      }
    }

    info!(
      succeeded = report.succeeded,
      retried = report.retried,
      dropped = report.dropped,
      "Drain finished"
    );

    Ok(DrainOutcome::Completed(report))
  }

  /// Issue the remote call for an entry, bounded by the request timeout.
  async fn dispatch(&self, entry: &QueueEntry) -> Result<(), RemoteError> {
    tokio::time::timeout(self.policy.request_timeout, self.call_remote(entry))
      .await
      .unwrap_or(Err(RemoteError::Timeout(self.policy.request_timeout)))
  }

  async fn call_remote(&self, entry: &QueueEntry) -> Result<(), RemoteError> {
    match entry.operation {
      Operation::Create => {
        self.remote.create(entry.entity_type, &entry.payload).await?;
      }
      Operation::Update => {
        let id = required_id(entry)?;
        self
          .remote
          .update(entry.entity_type, &id, &entry.payload)
          .await?;
      }
      Operation::Delete => {
        let id = required_id(entry)?;
        self.remote.delete(entry.entity_type, &id).await?;
      }
    }
    Ok(())
  }

  /// Consume triggers until a shutdown arrives or every sender is gone.
  ///
  /// Triggers that pile up while a drain runs collapse into one follow-up
  /// drain. A shutdown lets the current drain finish first.
  pub async fn run(self: Arc<Self>, mut triggers: mpsc::Receiver<Trigger>) {
    info!("Sync worker started");

    while let Some(trigger) = triggers.recv().await {
      if trigger == Trigger::Shutdown {
        break;
      }

      let mut shutdown = false;
      while let Ok(extra) = triggers.try_recv() {
        shutdown |= extra == Trigger::Shutdown;
      }

      debug!(?trigger, "Drain triggered");
      match self.drain().await {
        Ok(DrainOutcome::Completed(_)) | Ok(DrainOutcome::Busy) => {}
        Err(e) => error!(error = %e, "Drain aborted by storage failure"),
      }

      if shutdown {
        break;
      }
    }

    info!("Sync worker stopped");
  }
}

fn required_id(entry: &QueueEntry) -> Result<String, RemoteError> {
  entry.record_id().ok_or_else(|| {
    RemoteError::Invalid(format!(
      "{} {} payload has no record id",
      entry.operation, entry.entity_type
    ))
  })
}
