//! Collection manager
//!
//! The façade the rest of an application talks to. It owns the collections,
//! the sync queue, the stats aggregator and optionally a realtime channel, and
//! runs the periodic maintenance and flush loops.
//!
//! Reads and writes are synchronous and take one collection lock at a time.
//! Network work (flushes, realtime I/O) happens on background tasks.

use crate::cache::{
    CacheStatsAggregator, CacheStatsSnapshot, CollectionConfig, Document, DocumentCollection, Evictable,
    Lookup, MutationOrigin, QueryPlan, QueryPresets, QuotaEnforcer, QuotaReport,
};
use crate::core::config::Config;
use crate::core::{Clock, Error, Result, SystemClock};
use crate::realtime::{EventKind, RealtimeChannel, RealtimeEvent};
use crate::sync::{FlushReport, HttpSyncBackend, SyncBackend, SyncHandle, SyncQueue, SyncQueueConfig, SyncSink};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

type SharedCollection = Arc<RwLock<DocumentCollection<Value>>>;

/// Per-write options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Flush priority; higher values are sent sooner
    pub priority: i32,
}

/// Result of a local write or delete
#[derive(Debug)]
pub struct WriteReceipt {
    /// Id of the emitted sync operation
    pub operation_id: String,
    /// Whether the id was new to the collection
    pub created: bool,
    /// Settles when the backend acknowledges or the queue gives up
    pub sync: SyncHandle,
}

/// What one maintenance cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Expired documents swept, per collection
    pub expired: BTreeMap<String, usize>,
    /// Quota enforcement result
    pub quota: QuotaReport,
}

struct Inner {
    config: Config,
    collections: DashMap<String, SharedCollection>,
    presets: RwLock<QueryPresets<Value>>,
    queue: Arc<SyncQueue>,
    stats: Arc<CacheStatsAggregator>,
    quota: QuotaEnforcer,
    clock: Arc<dyn Clock>,
    realtime: Mutex<Option<Arc<RealtimeChannel>>>,
    shutdown_tx: watch::Sender<bool>,
    /// Flush period; only ever shortened, by collections added at runtime
    flush_every: watch::Sender<Duration>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`CollectionManager`]
pub struct CollectionManagerBuilder {
    config: Config,
    backend: Option<Arc<dyn SyncBackend>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CollectionManagerBuilder {
    /// Use a specific backend instead of HTTP to `sync.endpoint`
    pub fn backend(mut self, backend: Arc<dyn SyncBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a specific clock instead of the system clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and create every configured collection
    pub fn build(self) -> Result<CollectionManager> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpSyncBackend::new(&self.config.sync.endpoint, self.config.sync.request_timeout)?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let stats = Arc::new(CacheStatsAggregator::new());
        let queue = Arc::new(SyncQueue::new(
            backend,
            SyncQueueConfig::from(&self.config.sync),
            stats.clone(),
            clock.clone(),
        ));

        let collections = DashMap::new();
        for named in &self.config.cache.collections {
            let sink: Arc<dyn SyncSink> = queue.clone();
            let collection = DocumentCollection::new(named.name.clone(), named.config.clone(), clock.clone()).with_sink(sink);
            collections.insert(named.name.clone(), Arc::new(RwLock::new(collection)));
        }

        let (shutdown_tx, _) = watch::channel(false);
        info!(
            collections = collections.len(),
            budget_bytes = self.config.cache.budget_bytes,
            "collection manager ready"
        );

        Ok(CollectionManager {
            inner: Arc::new(Inner {
                flush_every: watch::channel(self.config.effective_flush_interval()).0,
                config: self.config,
                collections,
                presets: RwLock::new(QueryPresets::with_defaults()),
                queue,
                stats,
                quota: QuotaEnforcer::new(),
                clock,
                realtime: Mutex::new(None),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Owns collections, sync queue, stats and the realtime channel
#[derive(Clone)]
pub struct CollectionManager {
    inner: Arc<Inner>,
}

impl CollectionManager {
    /// Start building a manager from configuration
    pub fn builder(config: Config) -> CollectionManagerBuilder {
        CollectionManagerBuilder { config, backend: None, clock: None }
    }

    /// Configuration in effect
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Names of all collections, sorted
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Current period of the flush loop
    pub fn flush_interval(&self) -> Duration {
        *self.inner.flush_every.borrow()
    }

    /// Add a collection at runtime
    ///
    /// A `sync_interval_ms` shorter than the current flush period shortens
    /// the running flush loop.
    pub fn add_collection(&self, name: impl Into<String>, config: CollectionConfig) -> Result<()> {
        match self.inner.collections.entry(name.into()) {
            Entry::Occupied(entry) => Err(Error::invalid_input(format!("Collection already exists: {}", entry.key()))),
            Entry::Vacant(entry) => {
                if config.sync_interval_ms > 0 {
                    let every = Duration::from_millis(config.sync_interval_ms);
                    self.inner.flush_every.send_if_modified(|current| {
                        let shorter = every < *current;
                        if shorter {
                            *current = every;
                        }
                        shorter
                    });
                }
                let sink: Arc<dyn SyncSink> = self.inner.queue.clone();
                let collection =
                    DocumentCollection::new(entry.key().clone(), config, self.inner.clock.clone()).with_sink(sink);
                entry.insert(Arc::new(RwLock::new(collection)));
                Ok(())
            }
        }
    }

    /// Insert or replace a document and queue it for the backend
    pub fn write(&self, collection: &str, id: &str, payload: Value) -> Result<WriteReceipt> {
        self.write_with(collection, id, payload, WriteOptions::default())
    }

    /// [`Self::write`] with explicit options
    pub fn write_with(&self, collection: &str, id: &str, payload: Value, options: WriteOptions) -> Result<WriteReceipt> {
        let handle = self.collection(collection)?;
        let outcome = handle
            .write()
            .upsert(id, payload, MutationOrigin::Local { priority: options.priority })?;

        self.inner.stats.record_eviction(collection, outcome.evicted);
        let sync = outcome
            .sync
            .ok_or_else(|| Error::internal(format!("Collection {} emitted no sync operation", collection)))?;
        self.enforce_if_over_budget();

        Ok(WriteReceipt {
            operation_id: sync.operation_id().to_string(),
            created: outcome.created,
            sync,
        })
    }

    /// Serialize `value` and write it
    pub fn write_as<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> Result<WriteReceipt> {
        self.write(collection, id, serde_json::to_value(value)?)
    }

    /// Remove a document and queue the delete; `None` when it did not exist
    pub fn delete(&self, collection: &str, id: &str) -> Result<Option<WriteReceipt>> {
        let handle = self.collection(collection)?;
        let outcome = handle.write().remove(id, MutationOrigin::local());

        Ok(match (outcome.removed, outcome.sync) {
            (Some(_), Some(sync)) => Some(WriteReceipt {
                operation_id: sync.operation_id().to_string(),
                created: false,
                sync,
            }),
            _ => None,
        })
    }

    /// Keyed read; records a hit or miss
    pub fn read(&self, collection: &str, id: &str) -> Result<Option<Document<Value>>> {
        let handle = self.collection(collection)?;
        let mut guard = handle.write();

        let doc = match guard.lookup(id) {
            Lookup::Hit(doc) => Some(doc.clone()),
            Lookup::Miss => None,
            Lookup::Expired => {
                self.inner.stats.record_eviction(collection, 1);
                None
            }
        };
        drop(guard);

        match &doc {
            Some(_) => self.inner.stats.record_hit(collection),
            None => self.inner.stats.record_miss(collection),
        }
        Ok(doc)
    }

    /// Keyed read deserialized into `T`
    pub fn read_as<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        match self.read(collection, id)? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.payload)?)),
            None => Ok(None),
        }
    }

    /// Read, or on a miss call `fetch` and cache its result without syncing it back
    pub async fn read_or_fetch<F, Fut>(&self, collection: &str, id: &str, fetch: F) -> Result<Document<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if let Some(doc) = self.read(collection, id)? {
            return Ok(doc);
        }

        debug!(collection, id, "cache miss; fetching");
        let payload = fetch().await?;
        let handle = self.collection(collection)?;
        let mut guard = handle.write();
        let outcome = guard.upsert(id, payload, MutationOrigin::Remote)?;
        self.inner.stats.record_eviction(collection, outcome.evicted);

        let doc = guard
            .peek(id)
            .cloned()
            .ok_or_else(|| Error::internal(format!("Fetched document {} vanished from {}", id, collection)))?;
        drop(guard);
        self.enforce_if_over_budget();
        Ok(doc)
    }

    /// Live documents matching `predicate`, in insertion order
    pub fn query<F>(&self, collection: &str, predicate: F) -> Result<Vec<Document<Value>>>
    where
        F: Fn(&Document<Value>) -> bool,
    {
        let handle = self.collection(collection)?;
        let guard = handle.read();
        Ok(guard.query(predicate).into_iter().cloned().collect())
    }

    /// Run a query plan against a collection
    pub fn execute(&self, collection: &str, plan: &QueryPlan<Value>) -> Result<Vec<Document<Value>>> {
        let handle = self.collection(collection)?;
        let guard = handle.read();
        Ok(guard.execute(plan).into_iter().cloned().collect())
    }

    /// Run a named preset against a collection
    pub fn run_preset(&self, collection: &str, preset: &str) -> Result<Vec<Document<Value>>> {
        let plan = self
            .inner
            .presets
            .read()
            .get(preset)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("query preset {}", preset)))?;
        self.execute(collection, &plan)
    }

    /// Add or replace a named preset
    pub fn register_preset(&self, name: impl Into<String>, plan: QueryPlan<Value>) {
        self.inner.presets.write().register(name, plan);
    }

    /// Apply a server-pushed change without queueing it back to the backend.
    ///
    /// Returns whether the event changed anything.
    pub fn apply_realtime_event(&self, event: &RealtimeEvent) -> bool {
        let Ok(handle) = self.collection(&event.collection) else {
            warn!(collection = %event.collection, entity_id = %event.entity_id, "realtime event for unknown collection dropped");
            return false;
        };

        let mut guard = handle.write();
        match &event.kind {
            EventKind::Created | EventKind::Updated => match guard.upsert(&event.entity_id, event.data.clone(), MutationOrigin::Remote) {
                Ok(outcome) => {
                    drop(guard);
                    self.inner.stats.record_eviction(&event.collection, outcome.evicted);
                    self.enforce_if_over_budget();
                    true
                }
                Err(e) => {
                    warn!(collection = %event.collection, entity_id = %event.entity_id, error = %e, "failed to apply realtime event");
                    false
                }
            },
            EventKind::Deleted => guard.remove(&event.entity_id, MutationOrigin::Remote).removed.is_some(),
            EventKind::Other(kind) => {
                debug!(collection = %event.collection, kind = %kind, "ignoring realtime event kind");
                false
            }
        }
    }

    /// Refresh per-collection footprints and return a stats snapshot
    pub fn get_stats(&self) -> CacheStatsSnapshot {
        self.refresh_footprints();
        self.inner.stats.snapshot()
    }

    /// Operations waiting in the sync queue
    pub fn pending_sync(&self) -> usize {
        self.inner.queue.size()
    }

    /// Flush one batch of the sync queue now
    pub async fn flush(&self) -> FlushReport {
        self.inner.queue.flush().await
    }

    /// One maintenance cycle: sweep expired documents, enforce the quota, refresh stats
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        for (name, handle) in self.sorted_collections() {
            let swept = handle.write().sweep_expired();
            self.inner.stats.record_eviction(&name, swept);
            if swept > 0 {
                report.expired.insert(name, swept);
            }
        }

        report.quota = self.enforce_quota();
        self.refresh_footprints();
        debug!(
            expired = report.expired.values().sum::<usize>(),
            quota_evicted = report.quota.total_evicted(),
            "maintenance cycle finished"
        );
        report
    }

    /// Route events from `channel` into the collections
    pub fn attach_realtime(&self, channel: Arc<RealtimeChannel>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        channel.on_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                CollectionManager { inner }.apply_realtime_event(&event);
            }
        });
        *self.inner.realtime.lock() = Some(channel);
    }

    /// The attached realtime channel
    pub fn realtime(&self) -> Option<Arc<RealtimeChannel>> {
        self.inner.realtime.lock().clone()
    }

    /// Spawn the maintenance and flush loops and connect the realtime channel
    pub async fn start(&self) {
        self.inner.shutdown_tx.send_replace(false);
        let mut tasks = Vec::new();

        let maintenance = self.inner.config.cache.maintenance_interval;
        let manager = self.clone();
        tasks.push(spawn_periodic("maintenance", maintenance, self.inner.shutdown_tx.subscribe(), move || {
            let manager = manager.clone();
            async move {
                manager.run_maintenance();
            }
        }));

        let flush_every = self.flush_interval();
        tasks.push(spawn_flush_loop(
            self.clone(),
            self.inner.flush_every.subscribe(),
            self.inner.shutdown_tx.subscribe(),
        ));

        self.inner.tasks.lock().extend(tasks);
        info!(?maintenance, ?flush_every, "background loops started");

        if let Some(channel) = self.realtime() {
            channel.connect().await;
        }
    }

    /// Stop the background loops and disconnect the realtime channel.
    ///
    /// A flush already in progress is allowed to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        if let Some(channel) = self.realtime() {
            channel.disconnect().await;
        }

        let pending = self.inner.queue.size();
        if pending > 0 {
            warn!(pending, "shutting down with unsynced operations");
        }
        info!("collection manager stopped");
    }

    fn collection(&self, name: &str) -> Result<SharedCollection> {
        self.inner
            .collections
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("collection {}", name)))
    }

    /// Collections sorted by name; the fixed order keeps multi-lock acquisition deadlock-free
    fn sorted_collections(&self) -> Vec<(String, SharedCollection)> {
        let mut all: Vec<(String, SharedCollection)> = self
            .inner
            .collections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn total_bytes(&self) -> usize {
        self.inner.collections.iter().map(|entry| entry.value().read().approx_bytes()).sum()
    }

    fn enforce_if_over_budget(&self) {
        if self.total_bytes() > self.inner.config.cache.budget_bytes {
            self.enforce_quota();
        }
    }

    fn enforce_quota(&self) -> QuotaReport {
        let handles = self.sorted_collections();
        let mut guards: Vec<_> = handles.iter().map(|(_, handle)| handle.write()).collect();
        let mut refs: Vec<&mut dyn Evictable> = guards.iter_mut().map(|guard| &mut **guard as &mut dyn Evictable).collect();

        let report = self.inner.quota.enforce(&mut refs, self.inner.config.cache.budget_bytes);
        drop(refs);
        drop(guards);

        for (name, evicted) in &report.evictions {
            self.inner.stats.record_eviction(name, *evicted);
        }
        report
    }

    fn refresh_footprints(&self) {
        for (name, handle) in self.sorted_collections() {
            let footprint = handle.read().footprint();
            self.inner.stats.update_footprint(&name, footprint);
        }
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(task = name, "background loop stopping");
                        break;
                    }
                }
            }
        }
    })
}

/// Flush on a period that may shrink while running
fn spawn_flush_loop(
    manager: CollectionManager,
    mut every_rx: watch::Receiver<Duration>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let every = *every_rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(every) => {
                    let report = manager.flush().await;
                    if report.attempted > 0 {
                        debug!(?report, "periodic flush");
                    }
                }
                changed = every_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(every = ?*every_rx.borrow(), "flush interval shortened");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(task = "flush", "background loop stopping");
                        break;
                    }
                }
            }
        }
    })
}
