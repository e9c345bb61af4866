//! The engine facade: the only surface the UI layer talks to.
//!
//! An [`Engine`] is constructed once at startup and handed to whatever needs
//! it. Clones share the same store, queue and worker. Two engines must never
//! be opened on the same store within one process.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheResult, CachedRecord, RecordStore, Storage};
use crate::config::SyncPolicy;
use crate::queue::{
  record_id_of, DroppedEntry, EntityType, Operation, OperationQueue, QueueEntry, QueueHealth,
};
use crate::remote::{RemoteError, RemoteService};
use crate::sync::{ConnectivityGate, DrainOutcome, SyncWorker, Trigger};

struct Inner<S: Storage, R: RemoteService> {
  records: RecordStore<S>,
  queue: OperationQueue<S>,
  worker: Arc<SyncWorker<S, R>>,
  gate: ConnectivityGate,
  /// Receiving end of the trigger channel until the worker loop takes it
  triggers: Mutex<Option<mpsc::Receiver<Trigger>>>,
  /// Serializes local writes from submit and refresh
  writes: Mutex<()>,
}

pub struct Engine<S: Storage, R: RemoteService> {
  inner: Arc<Inner<S, R>>,
}

impl<S: Storage, R: RemoteService> Clone for Engine<S, R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Running worker loop and ticker, returned by [`Engine::start`].
pub struct SyncHandle {
  stop: mpsc::Sender<Trigger>,
  worker: JoinHandle<()>,
  ticker: JoinHandle<()>,
}

impl SyncHandle {
  /// Stop issuing triggers and wait for the worker loop to finish its
  /// current drain.
  pub async fn shutdown(self) -> Result<()> {
    self.ticker.abort();
    // The loop may already be gone; then there is nothing to stop
    let _ = self.stop.send(Trigger::Shutdown).await;
    self
      .worker
      .await
      .map_err(|e| eyre!("Sync worker task failed: {}", e))
  }
}

impl<S: Storage + 'static, R: RemoteService> Engine<S, R> {
  pub fn new(storage: S, remote: R, policy: SyncPolicy, initially_online: bool) -> Self {
    let storage = Arc::new(storage);
    let records = RecordStore::new(Arc::clone(&storage));
    let queue = OperationQueue::new(storage);
    let worker = Arc::new(SyncWorker::new(queue.clone(), remote, policy));
    let (gate, triggers) = ConnectivityGate::new(initially_online);

    Self {
      inner: Arc::new(Inner {
        records,
        queue,
        worker,
        gate,
        triggers: Mutex::new(Some(triggers)),
        writes: Mutex::new(()),
      }),
    }
  }

  /// Spawn the worker loop and the interval ticker.
  ///
  /// Triggers posted before this call are not lost; they are consumed as
  /// soon as the loop starts.
  pub fn start(&self) -> Result<SyncHandle> {
    let triggers = self
      .inner
      .triggers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .take()
      .ok_or_else(|| eyre!("Sync worker already started"))?;

    let policy = *self.inner.worker.policy();
    let worker = tokio::spawn(Arc::clone(&self.inner.worker).run(triggers));
    let ticker = self.inner.gate.spawn_ticker(policy.poll_interval);

    // Catch up on anything left over from a previous run
    self.inner.gate.notify_submitted();

    info!(
      poll_interval = ?policy.poll_interval,
      max_retries = policy.max_retries,
      "Sync started"
    );

    Ok(SyncHandle {
      stop: self.inner.gate.sender(),
      worker,
      ticker,
    })
  }

  /// Submit a local mutation.
  ///
  /// Returns once the mutation is durably queued and applied to the local
  /// cache. A `Create` without an `id` gets a client-generated one;
  /// `Update` and `Delete` must name the record they target.
  pub fn submit(
    &self,
    operation: Operation,
    entity_type: EntityType,
    payload: Value,
  ) -> Result<QueueEntry> {
    let (record_id, payload) = prepare_payload(operation, payload)?;
    let entry = QueueEntry::new(operation, entity_type, payload);

    {
      let _writes = self.lock_writes()?;

      // Queue first: the cache must never show a change that was not queued
      self.inner.queue.append(&entry)?;
      if let Err(e) = self.apply_optimistic(&entry, &record_id) {
        error!(entry = %entry.id, error = %e, "Mutation queued but cache update failed");
        self.inner.gate.notify_submitted();
        return Err(e.wrap_err(format!(
          "Mutation queued as entry {} but the local cache was not updated",
          entry.id
        )));
      }
    }

    debug!(
      entry = %entry.id,
      op = %operation,
      entity = %entity_type,
      record = %record_id,
      "Mutation queued"
    );

    self.inner.gate.notify_submitted();

    Ok(entry)
  }

  fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
    self
      .inner
      .writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn apply_optimistic(&self, entry: &QueueEntry, record_id: &str) -> Result<()> {
    let records = &self.inner.records;

    match entry.operation {
      Operation::Create => records.put(&CachedRecord::new(
        entry.entity_type,
        record_id,
        entry.payload.clone(),
      )),
      Operation::Update => {
        let data = match records.get_by_id(entry.entity_type, record_id)? {
          Some(existing) => merge_fields(existing.data, &entry.payload),
          None => entry.payload.clone(),
        };
        records.put(&CachedRecord::new(entry.entity_type, record_id, data))
      }
      Operation::Delete => records.delete(entry.entity_type, record_id).map(|_| ()),
    }
  }

  /// Read cached records: one by id, or all of a type. Never touches the network.
  pub fn read(&self, entity_type: EntityType, id: Option<&str>) -> Result<Vec<CachedRecord>> {
    match id {
      Some(id) => Ok(self.read_one(entity_type, id)?.into_iter().collect()),
      None => self.inner.records.get_all(entity_type),
    }
  }

  pub fn read_one(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedRecord>> {
    self.inner.records.get_by_id(entity_type, id)
  }

  pub fn queue_health(&self) -> Result<QueueHealth> {
    self.inner.queue.health()
  }

  /// Entries still waiting for the remote, in enqueue order.
  pub fn pending_entries(&self) -> Result<Vec<QueueEntry>> {
    self.inner.queue.list_pending()
  }

  /// Entries dropped after exhausting their retries.
  pub fn dropped_entries(&self) -> Result<Vec<DroppedEntry>> {
    self.inner.queue.dropped()
  }

  /// Drop every cached record. The queue is left alone.
  pub fn clear_cache(&self) -> Result<()> {
    self.inner.records.clear_all()?;
    info!("Local record cache cleared");
    Ok(())
  }

  pub fn set_online(&self, online: bool) {
    self.inner.gate.set_online(online);
  }

  pub fn is_online(&self) -> bool {
    self.inner.gate.is_online()
  }

  /// Run one drain right away, bypassing the gate.
  pub async fn drain_now(&self) -> Result<DrainOutcome> {
    self.inner.worker.drain().await
  }

  /// Pull all records of a type from the remote into the cache.
  ///
  /// Records with a pending local mutation keep their local state. When the
  /// remote cannot be reached, the cached records are returned as offline.
  pub async fn refresh(&self, entity_type: EntityType) -> Result<CacheResult<Vec<CachedRecord>>> {
    let worker = &self.inner.worker;
    let timeout = worker.policy().request_timeout;

    let fetched = tokio::time::timeout(timeout, worker.remote().fetch_all(entity_type))
      .await
      .unwrap_or(Err(RemoteError::Timeout(timeout)));

    let rows = match fetched {
      Ok(rows) => rows,
      Err(e) => {
        warn!(entity = %entity_type, error = %e, "Refresh failed, serving cache");
        let cached = self.inner.records.get_all(entity_type)?;
        let cached_at = cached.iter().map(|r| r.updated_at_local).max();
        return Ok(CacheResult::offline(cached, cached_at));
      }
    };

    let mut stored = 0;
    {
      // No submit may slip in between reading the pending set and the writes
      let _writes = self.lock_writes()?;
      let pending = self.inner.queue.pending_record_ids(entity_type)?;

      for row in rows {
        let Some(id) = record_id_of(&row) else {
          warn!(entity = %entity_type, "Skipping remote record without id");
          continue;
        };
        if pending.contains(&id) {
          continue;
        }
        self
          .inner
          .records
          .put(&CachedRecord::new(entity_type, id, row))?;
        stored += 1;
      }
    }

    debug!(entity = %entity_type, stored, "Refreshed from remote");

    Ok(CacheResult::from_network(
      self.inner.records.get_all(entity_type)?,
    ))
  }
}

/// Validate a payload and make sure it carries a record id.
fn prepare_payload(operation: Operation, mut payload: Value) -> Result<(String, Value)> {
  if !payload.is_object() {
    return Err(eyre!("{} payload must be a JSON object", operation));
  }

  match record_id_of(&payload) {
    Some(id) => Ok((id, payload)),
    None if operation == Operation::Create => {
      let id = Uuid::new_v4().to_string();
      payload["id"] = Value::String(id.clone());
      Ok((id, payload))
    }
    None => Err(eyre!("{} payload must carry an id", operation)),
  }
}

/// Shallow merge: top-level fields of `patch` overwrite those of `base`.
fn merge_fields(mut base: Value, patch: &Value) -> Value {
  match (base.as_object_mut(), patch.as_object()) {
    (Some(target), Some(fields)) => {
      for (k, v) in fields {
        target.insert(k.clone(), v.clone());
      }
      base
    }
    _ => patch.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, FailingStorage, MemoryStorage, SqliteStorage};
  use crate::remote::MemoryRemote;
  use crate::sync::DrainReport;
  use serde_json::json;
  use std::time::Duration;

  fn engine(remote: &MemoryRemote) -> Engine<MemoryStorage, MemoryRemote> {
    Engine::new(
      MemoryStorage::new(),
      remote.clone(),
      SyncPolicy::default(),
      false,
    )
  }

  fn completed(outcome: DrainOutcome) -> DrainReport {
    match outcome {
      DrainOutcome::Completed(report) => report,
      DrainOutcome::Busy => panic!("drain unexpectedly busy"),
    }
  }

  #[tokio::test]
  async fn test_optimistic_read_without_network() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);

    engine
      .submit(
        Operation::Create,
        EntityType::Task,
        json!({"id": "t1", "title": "X"}),
      )
      .unwrap();

    let record = engine.read_one(EntityType::Task, "t1").unwrap().unwrap();
    assert_eq!(record.data["title"], "X");
    assert_eq!(engine.read(EntityType::Task, Some("t1")).unwrap().len(), 1);
    assert!(remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_create_without_id_gets_client_id() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);

    let entry = engine
      .submit(Operation::Create, EntityType::MealLog, json!({"calories": 420}))
      .unwrap();

    let id = entry.record_id().unwrap();
    assert!(Uuid::parse_str(&id).is_ok());
    assert!(engine.read_one(EntityType::MealLog, &id).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_update_and_delete_require_id() {
    let engine = engine(&MemoryRemote::new());

    assert!(engine
      .submit(Operation::Update, EntityType::Task, json!({"title": "Y"}))
      .is_err());
    assert!(engine
      .submit(Operation::Delete, EntityType::Task, json!({}))
      .is_err());
    assert!(engine
      .submit(Operation::Create, EntityType::Task, json!("not an object"))
      .is_err());
    assert_eq!(engine.queue_health().unwrap(), QueueHealth::default());
  }

  #[tokio::test]
  async fn test_update_merges_into_cached_record() {
    let engine = engine(&MemoryRemote::new());
    engine
      .submit(
        Operation::Create,
        EntityType::InventoryItem,
        json!({"id": "i1", "name": "rice", "qty": 1}),
      )
      .unwrap();
    engine
      .submit(
        Operation::Update,
        EntityType::InventoryItem,
        json!({"id": "i1", "qty": 5}),
      )
      .unwrap();

    let record = engine
      .read_one(EntityType::InventoryItem, "i1")
      .unwrap()
      .unwrap();
    assert_eq!(record.data, json!({"id": "i1", "name": "rice", "qty": 5}));
  }

  #[tokio::test]
  async fn test_delete_is_optimistic_but_stays_queued() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    engine
      .submit(Operation::Create, EntityType::Habit, json!({"id": "h1"}))
      .unwrap();
    engine
      .submit(Operation::Delete, EntityType::Habit, json!({"id": "h1"}))
      .unwrap();

    assert!(engine.read_one(EntityType::Habit, "h1").unwrap().is_none());
    assert_eq!(engine.pending_entries().unwrap().len(), 2);

    completed(engine.drain_now().await.unwrap());
    assert!(engine.pending_entries().unwrap().is_empty());
    assert!(remote.get(EntityType::Habit, "h1").is_none());
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let remote = MemoryRemote::new();

    let submitted = {
      let engine = Engine::new(
        SqliteStorage::open_at(&path).unwrap(),
        remote.clone(),
        SyncPolicy::default(),
        false,
      );
      engine
        .submit(Operation::Create, EntityType::Task, json!({"id": "t1"}))
        .unwrap()
    };

    let engine = Engine::new(
      SqliteStorage::open_at(&path).unwrap(),
      remote.clone(),
      SyncPolicy::default(),
      true,
    );
    assert_eq!(engine.pending_entries().unwrap(), vec![submitted]);
    assert!(engine.read_one(EntityType::Task, "t1").unwrap().is_some());

    let report = completed(engine.drain_now().await.unwrap());
    assert_eq!(report.succeeded, 1);
    assert_eq!(remote.calls().len(), 1);
    assert!(engine.pending_entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_same_record_dispatched_in_submit_order() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    engine
      .submit(Operation::Create, EntityType::Task, json!({"id": "t1", "n": 1}))
      .unwrap();
    engine
      .submit(Operation::Update, EntityType::Task, json!({"id": "t1", "n": 2}))
      .unwrap();

    completed(engine.drain_now().await.unwrap());

    let ops: Vec<Operation> = remote.calls().into_iter().map(|c| c.operation).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Update]);
    assert_eq!(remote.get(EntityType::Task, "t1").unwrap()["n"], 2);
  }

  #[tokio::test]
  async fn test_permanent_failure_is_dropped_and_reported() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    remote.reject("t2");
    for id in ["t1", "t2", "t3"] {
      engine
        .submit(Operation::Create, EntityType::Task, json!({"id": id}))
        .unwrap();
    }

    let report = completed(engine.drain_now().await.unwrap());
    assert_eq!(report.succeeded, 2);

    let health = engine.queue_health().unwrap();
    assert_eq!(health.pending, 0);
    assert_eq!(health.struggling, 1);

    for _ in 0..5 {
      engine.drain_now().await.unwrap();
    }

    let health = engine.queue_health().unwrap();
    assert_eq!(health.struggling, 0);
    assert_eq!(health.dropped, 1);
    assert!(health.last_drop_error.unwrap().contains("rejected"));
    assert!(engine.pending_entries().unwrap().is_empty());
    assert_eq!(engine.dropped_entries().unwrap()[0].entry.record_id().as_deref(), Some("t2"));
    assert!(remote.get(EntityType::Task, "t3").is_some());
  }

  #[tokio::test]
  async fn test_replayed_create_is_not_duplicated() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let entry = engine
      .submit(Operation::Create, EntityType::Task, json!({"id": "t1"}))
      .unwrap();

    // Response lost: the remote applied the create but the entry stays queued
    remote.create(EntityType::Task, &entry.payload).await.unwrap();
    completed(engine.drain_now().await.unwrap());

    assert_eq!(remote.record_count(EntityType::Task), 1);
    assert!(engine.pending_entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_refresh_keeps_pending_local_state() {
    let remote = MemoryRemote::new();
    remote.insert(EntityType::Task, "t1", json!({"id": "t1", "title": "remote"}));
    remote.insert(EntityType::Task, "t2", json!({"id": "t2", "title": "remote"}));
    let engine = engine(&remote);
    engine
      .submit(
        Operation::Update,
        EntityType::Task,
        json!({"id": "t1", "title": "local"}),
      )
      .unwrap();

    let result = engine.refresh(EntityType::Task).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 2);
    let t1 = engine.read_one(EntityType::Task, "t1").unwrap().unwrap();
    assert_eq!(t1.data["title"], "local");
    let t2 = engine.read_one(EntityType::Task, "t2").unwrap().unwrap();
    assert_eq!(t2.data["title"], "remote");
  }

  #[tokio::test]
  async fn test_refresh_offline_serves_cache() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    engine
      .submit(Operation::Create, EntityType::Task, json!({"id": "t1"}))
      .unwrap();
    remote.set_reachable(false);

    let result = engine.refresh(EntityType::Task).await.unwrap();

    assert!(result.is_offline());
    assert_eq!(result.data.len(), 1);
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_queue_write_failure_is_loud() {
    let remote = MemoryRemote::new();
    let engine = Engine::new(
      FailingStorage::new("queue:pending"),
      remote.clone(),
      SyncPolicy::default(),
      true,
    );

    let result = engine.submit(
      Operation::Create,
      EntityType::Task,
      json!({"id": "t1", "title": "X"}),
    );

    assert!(result.is_err());
    assert!(engine.read(EntityType::Task, Some("t1")).unwrap().is_empty());
    assert_eq!(engine.queue_health().unwrap(), QueueHealth::default());
    assert!(remote.calls().is_empty());
  }

  #[tokio::test]
  async fn test_cache_write_failure_names_queued_entry() {
    let remote = MemoryRemote::new();
    let engine = Engine::new(
      FailingStorage::new("records:"),
      remote.clone(),
      SyncPolicy::default(),
      false,
    );

    let err = engine
      .submit(Operation::Create, EntityType::Task, json!({"title": "X"}))
      .unwrap_err();

    let pending = engine.pending_entries().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(err.to_string().contains(&pending[0].id));

    // Still replayed like any other entry
    completed(engine.drain_now().await.unwrap());
    assert_eq!(remote.record_count(EntityType::Task), 1);
  }

  #[tokio::test]
  async fn test_unstarted_engine_holds_at_most_one_trigger() {
    let remote = MemoryRemote::new();
    let engine = Engine::new(
      MemoryStorage::new(),
      remote.clone(),
      SyncPolicy::default(),
      true,
    );

    for i in 0..1000 {
      engine
        .submit(Operation::Create, EntityType::Task, json!({"id": format!("t{}", i)}))
        .unwrap();
      engine.drain_now().await.unwrap();
    }

    let mut rx = engine.inner.triggers.lock().unwrap().take().unwrap();
    let mut queued = 0;
    while rx.try_recv().is_ok() {
      queued += 1;
    }
    assert_eq!(queued, 1);
    assert_eq!(remote.record_count(EntityType::Task), 1000);
  }

  #[tokio::test]
  async fn test_submit_during_refresh_keeps_local_value() {
    let remote = MemoryRemote::new();
    remote.insert(EntityType::Task, "t1", json!({"id": "t1", "title": "remote"}));
    remote.set_latency(Duration::from_millis(50));
    let engine = engine(&remote);

    let refresh = tokio::spawn({
      let engine = engine.clone();
      async move { engine.refresh(EntityType::Task).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine
      .submit(
        Operation::Update,
        EntityType::Task,
        json!({"id": "t1", "title": "local"}),
      )
      .unwrap();

    let result = refresh.await.unwrap().unwrap();

    assert_eq!(result.source, CacheSource::Network);
    let t1 = engine.read_one(EntityType::Task, "t1").unwrap().unwrap();
    assert_eq!(t1.data["title"], "local");
  }

  #[tokio::test]
  async fn test_clear_cache_leaves_queue() {
    let engine = engine(&MemoryRemote::new());
    engine
      .submit(Operation::Create, EntityType::Task, json!({"id": "t1"}))
      .unwrap();

    engine.clear_cache().unwrap();

    assert!(engine.read(EntityType::Task, None).unwrap().is_empty());
    assert_eq!(engine.pending_entries().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_background_sync_follows_connectivity() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let handle = engine.start().unwrap();
    assert!(engine.start().is_err());

    // Offline: nothing is dispatched
    engine
      .submit(Operation::Create, EntityType::Task, json!({"id": "t1"}))
      .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(remote.calls().is_empty());

    // Coming online drains the backlog
    engine.set_online(true);
    wait_for_empty_queue(&engine).await;
    assert!(remote.get(EntityType::Task, "t1").is_some());

    // While online, a submit triggers a drain by itself
    engine
      .submit(Operation::Create, EntityType::Task, json!({"id": "t2"}))
      .unwrap();
    wait_for_empty_queue(&engine).await;
    assert!(remote.get(EntityType::Task, "t2").is_some());

    handle.shutdown().await.unwrap();
  }

  async fn wait_for_empty_queue(engine: &Engine<MemoryStorage, MemoryRemote>) {
    for _ in 0..100 {
      if engine.queue_health().unwrap().is_idle() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not drain");
  }
}
