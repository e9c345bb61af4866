//! Queue replay: the single-flight worker and the gate that schedules it.
//!
//! The gate posts [`Trigger`]s onto a channel; the worker loop consumes them
//! and runs one drain per batch of triggers. What causes a drain and how a
//! drain runs stay independent of each other.

mod gate;
mod worker;

pub use gate::ConnectivityGate;
pub use worker::{DrainOutcome, DrainReport, SyncWorker};

/// Reasons to run a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  /// A mutation was just queued
  Submitted,
  /// Connectivity went from offline to online
  BecameOnline,
  /// Periodic safety net
  Interval,
  /// Stop the worker loop after the current drain
  Shutdown,
}
