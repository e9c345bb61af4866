use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of mutation carried by a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    };
    f.write_str(name)
  }
}

impl FromStr for Operation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "create" | "c" => Ok(Self::Create),
      "update" | "u" => Ok(Self::Update),
      "delete" | "d" => Ok(Self::Delete),
      other => Err(format!("unknown operation '{}'", other)),
    }
  }
}

/// The collections known to the engine. Each has its own table on the
/// remote service and its own collection in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
  Task,
  MealLog,
  InventoryItem,
  Habit,
}

impl EntityType {
  pub const ALL: [EntityType; 4] = [
    EntityType::Task,
    EntityType::MealLog,
    EntityType::InventoryItem,
    EntityType::Habit,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Task => "task",
      Self::MealLog => "meal_log",
      Self::InventoryItem => "inventory_item",
      Self::Habit => "habit",
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_lowercase().replace('-', "_");
    Self::ALL
      .into_iter()
      .find(|t| t.as_str() == normalized)
      .ok_or_else(|| format!("unknown entity type '{}'", s))
  }
}

/// A single pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
  /// Identifier of the queue entry itself, not of the record
  pub id: String,
  pub operation: Operation,
  pub entity_type: EntityType,
  /// Record data for create/update, at least `{"id": ...}` for delete
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replay attempts so far
  pub retry_count: u32,
  pub last_error: Option<String>,
}

impl QueueEntry {
  pub fn new(operation: Operation, entity_type: EntityType, payload: Value) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      operation,
      entity_type,
      payload,
      enqueued_at: Utc::now(),
      retry_count: 0,
      last_error: None,
    }
  }

  /// The id of the record this entry targets, read from `payload.id`.
  pub fn record_id(&self) -> Option<String> {
    record_id_of(&self.payload)
  }

  pub fn is_struggling(&self) -> bool {
    self.retry_count > 0
  }
}

/// Extract a record id from a payload. String and numeric ids are accepted.
pub fn record_id_of(payload: &Value) -> Option<String> {
  match payload.get("id")? {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// A queue entry that exhausted its retries, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedEntry {
  pub entry: QueueEntry,
  pub dropped_at: DateTime<Utc>,
}
