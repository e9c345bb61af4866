//! In-memory remote service.
//!
//! Behaves like a well-formed remote (creates dedupe on the client id) and
//! lets callers inject latency, unreachability and per-record rejections.
//! Clones share state.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{RemoteError, RemoteService};
use crate::queue::{record_id_of, EntityType, Operation};

/// A call observed by the in-memory remote, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
  pub operation: Operation,
  pub entity_type: EntityType,
  pub id: String,
}

#[derive(Default)]
struct Inner {
  records: Mutex<HashMap<(EntityType, String), Value>>,
  calls: Mutex<Vec<RemoteCall>>,
  rejected: Mutex<HashSet<String>>,
  unreachable: AtomicBool,
  latency: Mutex<Duration>,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
  inner: Arc<Inner>,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulate losing connectivity. Calls fail with [`RemoteError::Offline`].
  pub fn set_reachable(&self, reachable: bool) {
    self.inner.unreachable.store(!reachable, Ordering::SeqCst);
  }

  /// Delay every call by `latency` before it is applied.
  pub fn set_latency(&self, latency: Duration) {
    if let Ok(mut current) = self.inner.latency.lock() {
      *current = latency;
    }
  }

  /// Reject every call that targets `record_id`.
  pub fn reject(&self, record_id: &str) {
    if let Ok(mut rejected) = self.inner.rejected.lock() {
      rejected.insert(record_id.to_string());
    }
  }

  pub fn accept(&self, record_id: &str) {
    if let Ok(mut rejected) = self.inner.rejected.lock() {
      rejected.remove(record_id);
    }
  }

  /// Seed a record as if another device had written it.
  pub fn insert(&self, entity_type: EntityType, id: &str, data: Value) {
    if let Ok(mut records) = self.inner.records.lock() {
      records.insert((entity_type, id.to_string()), data);
    }
  }

  pub fn get(&self, entity_type: EntityType, id: &str) -> Option<Value> {
    let records = self.inner.records.lock().ok()?;
    records.get(&(entity_type, id.to_string())).cloned()
  }

  pub fn record_count(&self, entity_type: EntityType) -> usize {
    self
      .inner
      .records
      .lock()
      .map(|records| records.keys().filter(|(t, _)| *t == entity_type).count())
      .unwrap_or_default()
  }

  /// Every call received so far, including rejected ones.
  pub fn calls(&self) -> Vec<RemoteCall> {
    self
      .inner
      .calls
      .lock()
      .map(|calls| calls.clone())
      .unwrap_or_default()
  }

  /// Highest number of calls that were in flight at the same time.
  pub fn max_concurrent_calls(&self) -> usize {
    self.inner.max_in_flight.load(Ordering::SeqCst)
  }

  /// Shared entry path for every call: bookkeeping, latency, failure injection.
  async fn begin(
    &self,
    operation: Operation,
    entity_type: EntityType,
    id: &str,
  ) -> Result<(), RemoteError> {
    if self.inner.unreachable.load(Ordering::SeqCst) {
      return Err(RemoteError::Offline);
    }

    if let Ok(mut calls) = self.inner.calls.lock() {
      calls.push(RemoteCall {
        operation,
        entity_type,
        id: id.to_string(),
      });
    }

    let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

    self.delay().await;

    self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

    let rejected = self
      .inner
      .rejected
      .lock()
      .map(|r| r.contains(id))
      .unwrap_or(false);
    if rejected {
      return Err(RemoteError::Rejected {
        status: 422,
        message: format!("{} {} rejected", entity_type, id),
      });
    }

    Ok(())
  }

  async fn delay(&self) {
    let latency = self
      .inner
      .latency
      .lock()
      .map(|l| *l)
      .unwrap_or_default();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
  }

  fn lock_records(
    &self,
  ) -> Result<std::sync::MutexGuard<'_, HashMap<(EntityType, String), Value>>, RemoteError> {
    self
      .inner
      .records
      .lock()
      .map_err(|e| RemoteError::Transport(e.to_string()))
  }
}

impl RemoteService for MemoryRemote {
  async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<Value, RemoteError> {
    let id = record_id_of(payload)
      .ok_or_else(|| RemoteError::Invalid("create payload has no id".to_string()))?;
    self.begin(Operation::Create, entity_type, &id).await?;

    // Dedupe on the client id so a replayed create is a no-op
    let mut records = self.lock_records()?;
    let stored = records
      .entry((entity_type, id))
      .or_insert_with(|| payload.clone());
    Ok(stored.clone())
  }

  async fn update(
    &self,
    entity_type: EntityType,
    id: &str,
    payload: &Value,
  ) -> Result<Value, RemoteError> {
    self.begin(Operation::Update, entity_type, id).await?;

    let mut records = self.lock_records()?;
    let Some(existing) = records.get_mut(&(entity_type, id.to_string())) else {
      return Err(RemoteError::Rejected {
        status: 404,
        message: format!("{} {} not found", entity_type, id),
      });
    };

    match (existing.as_object_mut(), payload.as_object()) {
      (Some(target), Some(fields)) => {
        for (k, v) in fields {
          target.insert(k.clone(), v.clone());
        }
      }
      _ => *existing = payload.clone(),
    }
    Ok(existing.clone())
  }

  async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), RemoteError> {
    self.begin(Operation::Delete, entity_type, id).await?;

    // Deleting something already gone counts as done
    self.lock_records()?.remove(&(entity_type, id.to_string()));
    Ok(())
  }

  async fn fetch_all(&self, entity_type: EntityType) -> Result<Vec<Value>, RemoteError> {
    if self.inner.unreachable.load(Ordering::SeqCst) {
      return Err(RemoteError::Offline);
    }

    // The listing reflects the remote as of the request, not the response
    let rows = {
      let records = self.lock_records()?;
      let mut rows: Vec<(&String, &Value)> = records
        .iter()
        .filter(|((t, _), _)| *t == entity_type)
        .map(|((_, id), v)| (id, v))
        .collect();
      rows.sort_by(|a, b| a.0.cmp(b.0));
      let owned: Vec<Value> = rows.into_iter().map(|(_, v)| v.clone()).collect();
      owned
    };
    self.delay().await;

    Ok(rows)
  }
}
