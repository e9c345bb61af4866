//! Contract for the remote system of record.
//!
//! The sync worker only ever talks to the remote through [`RemoteService`].
//! All calls must be safe to retry: creates carry a client-generated id
//! that the remote dedupes on.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::{MemoryRemote, RemoteCall};

use serde_json::Value;
use std::future::Future;
use thiserror::Error;

use crate::queue::EntityType;

/// Errors returned by a remote call. All of them are recoverable from the
/// engine's point of view and feed the retry bookkeeping.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
  #[error("remote unreachable (offline)")]
  Offline,

  #[error("remote call timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("transport error: {0}")]
  Transport(String),

  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },

  #[error("invalid request: {0}")]
  Invalid(String),
}

/// Remote data service consumed per entity type.
pub trait RemoteService: Send + Sync + 'static {
  /// Insert a record. The payload carries the client-generated id.
  fn create(
    &self,
    entity_type: EntityType,
    payload: &Value,
  ) -> impl Future<Output = Result<Value, RemoteError>> + Send;

  fn update(
    &self,
    entity_type: EntityType,
    id: &str,
    payload: &Value,
  ) -> impl Future<Output = Result<Value, RemoteError>> + Send;

  fn delete(
    &self,
    entity_type: EntityType,
    id: &str,
  ) -> impl Future<Output = Result<(), RemoteError>> + Send;

  /// All records of a type, used for read-through refresh.
  fn fetch_all(
    &self,
    entity_type: EntityType,
  ) -> impl Future<Output = Result<Vec<Value>, RemoteError>> + Send;
}
