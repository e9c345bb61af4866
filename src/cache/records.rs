//! Local record store serving optimistic reads.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::storage::Storage;
use crate::queue::EntityType;

const RECORDS_PREFIX: &str = "records:";

/// Last known value of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
  pub entity_type: EntityType,
  pub id: String,
  /// Opaque entity data
  pub data: Value,
  /// When this device last wrote the record
  pub updated_at_local: DateTime<Utc>,
}

impl CachedRecord {
  pub fn new(entity_type: EntityType, id: impl Into<String>, data: Value) -> Self {
    Self {
      entity_type,
      id: id.into(),
      data,
      updated_at_local: Utc::now(),
    }
  }
}

/// Per-entity-type collections of cached records.
///
/// Has no knowledge of the operation queue; it only reflects the local view.
pub struct RecordStore<S: Storage> {
  storage: Arc<S>,
}

impl<S: Storage> RecordStore<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  fn collection(entity_type: EntityType) -> String {
    format!("{}{}", RECORDS_PREFIX, entity_type.as_str())
  }

  /// Upsert by record id.
  pub fn put(&self, record: &CachedRecord) -> Result<()> {
    self
      .storage
      .put(&Self::collection(record.entity_type), &record.id, record)
  }

  pub fn delete(&self, entity_type: EntityType, id: &str) -> Result<bool> {
    self.storage.delete(&Self::collection(entity_type), id)
  }

  pub fn get_all(&self, entity_type: EntityType) -> Result<Vec<CachedRecord>> {
    self.storage.list_all(&Self::collection(entity_type))
  }

  pub fn get_by_id(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedRecord>> {
    self.storage.get(&Self::collection(entity_type), id)
  }

  /// Drop every cached record of every type.
  pub fn clear_all(&self) -> Result<()> {
    self.storage.clear(RECORDS_PREFIX)
  }
}

impl<S: Storage> Clone for RecordStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
