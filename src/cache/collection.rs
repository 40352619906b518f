//! A typed, indexed, TTL-bound in-memory table for one entity kind.
//!
//! Documents live in a `HashMap` keyed by id. Each entry carries an insertion
//! sequence number (iteration and FIFO order) and a cached size estimate so
//! the collection's footprint is maintained incrementally.
//!
//! Mutations marked [`MutationOrigin::Local`] emit a [`SyncOperation`] to the
//! configured [`SyncSink`]; remote mutations never do.

use crate::cache::document::{CollectionConfig, Document, EvictionStrategy, MutationOrigin, Payload};
use crate::cache::query::QueryPlan;
use crate::core::{Clock, Result, Timestamp};
use crate::sync::{SyncHandle, SyncKind, SyncOperation, SyncSink};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Fixed per-entry overhead added to the serialized size estimate
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Key extractor for a secondary index
pub type IndexKeyFn<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;

struct Entry<T> {
    doc: Document<T>,
    size: usize,
    seq: u64,
}

struct SecondaryIndex<T> {
    key_fn: IndexKeyFn<T>,
    keys: HashMap<String, HashSet<String>>,
}

impl<T> SecondaryIndex<T> {
    fn insert(&mut self, id: &str, payload: &T) {
        if let Some(key) = (self.key_fn)(payload) {
            self.keys.entry(key).or_default().insert(id.to_string());
        }
    }

    fn remove(&mut self, id: &str, payload: &T) {
        if let Some(key) = (self.key_fn)(payload) {
            if let Some(ids) = self.keys.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.keys.remove(&key);
                }
            }
        }
    }
}

/// Result of a keyed read
#[derive(Debug)]
pub enum Lookup<'a, T> {
    /// Live document; its access metadata has been refreshed
    Hit(&'a Document<T>),
    /// No document with that id
    Miss,
    /// Document was past its TTL and has been purged
    Expired,
}

impl<'a, T> Lookup<'a, T> {
    /// The document on a hit
    pub fn document(self) -> Option<&'a Document<T>> {
        match self {
            Lookup::Hit(doc) => Some(doc),
            Lookup::Miss | Lookup::Expired => None,
        }
    }
}

/// What an upsert did
#[derive(Debug)]
pub struct UpsertOutcome {
    /// A new id was inserted (rather than replaced)
    pub created: bool,
    /// Documents evicted to respect `max_entries`, plus an expired one replaced by this write
    pub evicted: usize,
    /// Pending backend write for local mutations
    pub sync: Option<SyncHandle>,
}

/// What a remove did
#[derive(Debug)]
pub struct RemoveOutcome<T> {
    /// The removed document, if it existed
    pub removed: Option<Document<T>>,
    /// Pending backend delete for local mutations
    pub sync: Option<SyncHandle>,
}

/// Footprint of a collection, as reported in stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// Live documents (including expired ones not yet swept)
    pub document_count: usize,
    /// Serialized-size estimate of all documents
    pub approx_bytes: usize,
    /// Most recent read or write
    pub last_access: Option<Timestamp>,
}

/// In-memory table for one entity kind
pub struct DocumentCollection<T: Payload> {
    name: String,
    config: CollectionConfig,
    entries: HashMap<String, Entry<T>>,
    indexes: HashMap<String, SecondaryIndex<T>>,
    next_seq: u64,
    approx_bytes: usize,
    last_access: Option<Timestamp>,
    sink: Option<Arc<dyn SyncSink>>,
    clock: Arc<dyn Clock>,
}

impl<T: Payload> DocumentCollection<T> {
    /// Create an empty collection with no sync sink
    pub fn new(name: impl Into<String>, config: CollectionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            entries: HashMap::new(),
            indexes: HashMap::new(),
            next_seq: 0,
            approx_bytes: 0,
            last_access: None,
            sink: None,
            clock,
        }
    }

    /// Route local mutations to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation-time settings
    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Number of stored documents, expired ones included until swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection holds no documents
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialized-size estimate of all stored documents
    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    /// Current footprint
    pub fn footprint(&self) -> CollectionStats {
        CollectionStats {
            document_count: self.entries.len(),
            approx_bytes: self.approx_bytes,
            last_access: self.last_access,
        }
    }

    /// Insert or replace a document.
    ///
    /// A replacement keeps `created_at` and bumps `access_count`. Inserting a
    /// new id into a full collection first evicts one victim chosen by the
    /// eviction strategy. Writing over an expired document purges it and
    /// counts as an insert.
    pub fn upsert(&mut self, id: impl Into<String>, payload: T, origin: MutationOrigin) -> Result<UpsertOutcome> {
        let id = id.into();
        let size = estimate_size(&id, &payload)?;
        let sync_payload = match origin {
            MutationOrigin::Local { .. } if self.sink.is_some() => Some(serde_json::to_value(&payload)?),
            _ => None,
        };
        let now = self.clock.now_millis();

        // An expired entry is already absent to readers; rewriting it is a fresh insert.
        let mut evicted = 0;
        if self.entries.get(&id).is_some_and(|entry| entry.doc.is_expired(self.config.ttl_ms, now)) {
            trace!(collection = %self.name, id = %id, "replacing expired document");
            self.purge(&id);
            evicted += 1;
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            for index in self.indexes.values_mut() {
                index.remove(&id, &entry.doc.payload);
            }
            self.approx_bytes = self.approx_bytes.saturating_sub(entry.size) + size;
            entry.doc.payload = payload;
            entry.doc.touch(now);
            entry.size = size;
            for index in self.indexes.values_mut() {
                index.insert(&id, &entry.doc.payload);
            }
            self.last_access = Some(now);

            let sync = self.emit(SyncKind::Update, &id, sync_payload, origin, now);
            return Ok(UpsertOutcome { created: false, evicted: 0, sync });
        }

        if self.config.max_entries > 0 {
            while self.entries.len() >= self.config.max_entries {
                let Some(victim) = self.pick_victim() else { break };
                self.purge(&victim);
                evicted += 1;
            }
            if evicted > 0 {
                debug!(collection = %self.name, evicted, "evicted documents to respect max entries");
            }
        }

        for index in self.indexes.values_mut() {
            index.insert(&id, &payload);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.approx_bytes += size;
        self.last_access = Some(now);
        self.entries.insert(id.clone(), Entry { doc: Document::new(id.clone(), payload, now), size, seq });

        let sync = self.emit(SyncKind::Create, &id, sync_payload, origin, now);
        Ok(UpsertOutcome { created: true, evicted, sync })
    }

    /// Keyed read that refreshes access metadata on a hit and purges expired documents
    pub fn lookup(&mut self, id: &str) -> Lookup<'_, T> {
        let now = self.clock.now_millis();
        let expired = match self.entries.get(id) {
            None => return Lookup::Miss,
            Some(entry) => entry.doc.is_expired(self.config.ttl_ms, now),
        };

        if expired {
            trace!(collection = %self.name, id, "purging expired document on read");
            self.purge(id);
            return Lookup::Expired;
        }

        self.last_access = Some(now);
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.doc.touch(now);
                Lookup::Hit(&entry.doc)
            }
            None => Lookup::Miss,
        }
    }

    /// Keyed read; `None` when absent or expired
    pub fn get(&mut self, id: &str) -> Option<&Document<T>> {
        self.lookup(id).document()
    }

    /// Keyed read that leaves access metadata untouched
    pub fn peek(&self, id: &str) -> Option<&Document<T>> {
        let now = self.clock.now_millis();
        self.entries
            .get(id)
            .map(|entry| &entry.doc)
            .filter(|doc| !doc.is_expired(self.config.ttl_ms, now))
    }

    /// Live documents matching `predicate`, in insertion order
    pub fn query<F>(&self, predicate: F) -> Vec<&Document<T>>
    where
        F: Fn(&Document<T>) -> bool,
    {
        self.live_in_order().into_iter().filter(|doc| predicate(doc)).collect()
    }

    /// Run a query plan over the live documents
    pub fn execute(&self, plan: &QueryPlan<T>) -> Vec<&Document<T>> {
        plan.execute(self.live_in_order())
    }

    /// Remove a document
    pub fn remove(&mut self, id: &str, origin: MutationOrigin) -> RemoveOutcome<T> {
        let now = self.clock.now_millis();
        match self.purge(id) {
            Some(doc) => {
                self.last_access = Some(now);
                let sync = self.emit(SyncKind::Delete, id, Some(Value::Null), origin, now);
                RemoveOutcome { removed: Some(doc), sync }
            }
            None => RemoveOutcome { removed: None, sync: None },
        }
    }

    /// Drop every document older than the TTL; returns how many were removed
    pub fn sweep_expired(&mut self) -> usize {
        if self.config.ttl_ms == 0 {
            return 0;
        }

        let now = self.clock.now_millis();
        let ttl = self.config.ttl_ms;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.doc.is_expired(ttl, now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.purge(id);
        }

        if !expired.is_empty() {
            debug!(collection = %self.name, removed = expired.len(), "swept expired documents");
        }
        expired.len()
    }

    /// Evict the `n` least recently accessed documents; returns how many went
    pub fn evict_least_recent(&mut self, n: usize) -> usize {
        let mut order: Vec<(Timestamp, u64, String)> = self
            .entries
            .iter()
            .map(|(id, entry)| (entry.doc.last_access, entry.seq, id.clone()))
            .collect();
        order.sort_unstable();

        let victims: Vec<String> = order.into_iter().take(n).map(|(_, _, id)| id).collect();
        for id in &victims {
            self.purge(id);
        }
        victims.len()
    }

    /// Register a secondary index; existing documents are indexed immediately
    pub fn add_index<F>(&mut self, name: impl Into<String>, key_fn: F)
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        let mut index = SecondaryIndex { key_fn: Box::new(key_fn), keys: HashMap::new() };
        for (id, entry) in &self.entries {
            index.insert(id, &entry.doc.payload);
        }
        self.indexes.insert(name.into(), index);
    }

    /// Live documents whose index key equals `key`, in insertion order
    pub fn find_by_index(&self, index: &str, key: &str) -> Vec<&Document<T>> {
        let Some(ids) = self.indexes.get(index).and_then(|idx| idx.keys.get(key)) else {
            return Vec::new();
        };

        let now = self.clock.now_millis();
        let mut hits: Vec<&Entry<T>> = ids
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|entry| !entry.doc.is_expired(self.config.ttl_ms, now))
            .collect();
        hits.sort_by_key(|entry| entry.seq);
        hits.into_iter().map(|entry| &entry.doc).collect()
    }

    /// Remove every document without emitting sync operations
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        for index in self.indexes.values_mut() {
            index.keys.clear();
        }
        self.approx_bytes = 0;
        count
    }

    fn live_in_order(&self) -> Vec<&Document<T>> {
        let now = self.clock.now_millis();
        let mut live: Vec<&Entry<T>> = self
            .entries
            .values()
            .filter(|entry| !entry.doc.is_expired(self.config.ttl_ms, now))
            .collect();
        live.sort_by_key(|entry| entry.seq);
        live.into_iter().map(|entry| &entry.doc).collect()
    }

    fn pick_victim(&self) -> Option<String> {
        let entries = self.entries.iter();
        let victim = match self.config.eviction_strategy {
            EvictionStrategy::Lru => entries.min_by_key(|(_, e)| (e.doc.last_access, e.seq)),
            EvictionStrategy::Lfu => entries.min_by_key(|(_, e)| (e.doc.access_count, e.doc.last_access, e.seq)),
            EvictionStrategy::Fifo => entries.min_by_key(|(_, e)| e.seq),
        };
        victim.map(|(id, _)| id.clone())
    }

    fn purge(&mut self, id: &str) -> Option<Document<T>> {
        let entry = self.entries.remove(id)?;
        self.approx_bytes = self.approx_bytes.saturating_sub(entry.size);
        for index in self.indexes.values_mut() {
            index.remove(id, &entry.doc.payload);
        }
        Some(entry.doc)
    }

    fn emit(
        &self,
        kind: SyncKind,
        id: &str,
        payload: Option<Value>,
        origin: MutationOrigin,
        now: Timestamp,
    ) -> Option<SyncHandle> {
        let MutationOrigin::Local { priority } = origin else {
            return None;
        };
        let Some(sink) = &self.sink else {
            warn!(collection = %self.name, id, "local mutation with no sync sink configured");
            return None;
        };

        let op = SyncOperation::new(kind, self.name.clone(), id, payload.unwrap_or(Value::Null), now)
            .with_priority(priority);
        Some(sink.submit(op))
    }
}

/// Serialized JSON size of id and payload plus fixed overhead
pub fn estimate_size<T: serde::Serialize>(id: &str, payload: &T) -> Result<usize> {
    Ok(serde_json::to_vec(payload)?.len() + id.len() + ENTRY_OVERHEAD_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Evidence {
        case_id: String,
        title: String,
    }

    fn evidence(case_id: &str, title: &str) -> Evidence {
        Evidence { case_id: case_id.into(), title: title.into() }
    }

    #[derive(Default)]
    struct RecordingSink {
        ops: Mutex<Vec<SyncOperation>>,
    }

    impl SyncSink for RecordingSink {
        fn submit(&self, op: SyncOperation) -> SyncHandle {
            let (_tx, handle) = SyncHandle::channel(op.id.clone());
            self.ops.lock().push(op);
            handle
        }
    }

    fn collection(config: CollectionConfig) -> (DocumentCollection<Evidence>, Arc<ManualClock>, Arc<RecordingSink>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let sink = Arc::new(RecordingSink::default());
        let col = DocumentCollection::new("evidence", config, clock.clone()).with_sink(sink.clone());
        (col, clock, sink)
    }

    #[test]
    fn test_upsert_replace_preserves_created_at() {
        let (mut col, clock, _) = collection(CollectionConfig::default());
        let out = col.upsert("e1", evidence("c1", "photo"), MutationOrigin::local()).unwrap();
        assert!(out.created);

        clock.advance(500);
        let out = col.upsert("e1", evidence("c1", "photo v2"), MutationOrigin::local()).unwrap();
        assert!(!out.created);

        let doc = col.peek("e1").unwrap();
        assert_eq!(doc.created_at, 1_000);
        assert_eq!(doc.last_access, 1_500);
        assert_eq!(doc.access_count, 1);
        assert_eq!(doc.payload.title, "photo v2");
        assert_eq!(col.len(), 1);
    }

    #[test]
    fn test_get_touches_and_misses() {
        let (mut col, clock, _) = collection(CollectionConfig::default());
        col.upsert("e1", evidence("c1", "photo"), MutationOrigin::local()).unwrap();
        clock.advance(10);

        let doc = col.get("e1").unwrap();
        assert_eq!(doc.access_count, 1);
        assert_eq!(doc.last_access, 1_010);
        assert!(col.get("missing").is_none());
    }

    #[test]
    fn test_expired_documents_unreachable_before_sweep() {
        let (mut col, clock, _) = collection(CollectionConfig { ttl_ms: 100, ..Default::default() });
        col.upsert("e1", evidence("c1", "a"), MutationOrigin::local()).unwrap();
        col.upsert("e2", evidence("c1", "b"), MutationOrigin::local()).unwrap();
        clock.advance(101);

        assert!(col.peek("e1").is_none());
        assert!(col.query(|_| true).is_empty());
        assert_eq!(col.len(), 2);

        assert!(matches!(col.lookup("e1"), Lookup::Expired));
        assert_eq!(col.len(), 1);

        assert_eq!(col.sweep_expired(), 1);
        assert!(col.is_empty());
        assert_eq!(col.approx_bytes(), 0);
    }

    #[test]
    fn test_rewrite_of_expired_document_is_fresh_insert() {
        let (mut col, clock, sink) = collection(CollectionConfig { ttl_ms: 1_000, ..Default::default() });
        col.add_index("case", |e: &Evidence| Some(e.case_id.clone()));
        col.upsert("e1", evidence("c1", "old"), MutationOrigin::local()).unwrap();
        clock.advance(2_000);

        let out = col.upsert("e1", evidence("c2", "new"), MutationOrigin::local()).unwrap();
        assert!(out.created);
        assert_eq!(out.evicted, 1);

        let doc = col.get("e1").unwrap();
        assert_eq!(doc.created_at, 3_000);
        assert_eq!(doc.payload.title, "new");
        assert_eq!(col.len(), 1);
        assert!(col.find_by_index("case", "c1").is_empty());
        assert_eq!(col.find_by_index("case", "c2").len(), 1);

        let kinds: Vec<SyncKind> = sink.ops.lock().iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![SyncKind::Create, SyncKind::Create]);
    }

    #[test]
    fn test_sync_emission() {
        let (mut col, _, sink) = collection(CollectionConfig::default());
        col.upsert("e1", evidence("c1", "a"), MutationOrigin::Local { priority: 5 }).unwrap();
        col.upsert("e1", evidence("c1", "b"), MutationOrigin::local()).unwrap();
        col.upsert("e2", evidence("c2", "remote"), MutationOrigin::Remote).unwrap();
        col.remove("e1", MutationOrigin::local());
        col.remove("e2", MutationOrigin::Remote);
        col.remove("missing", MutationOrigin::local());

        let ops = sink.ops.lock();
        let kinds: Vec<SyncKind> = ops.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![SyncKind::Create, SyncKind::Update, SyncKind::Delete]);
        assert_eq!(ops[0].priority, 5);
        assert_eq!(ops[0].payload["title"], "a");
        assert_eq!(ops[2].entity_id, "e1");
        assert!(ops.iter().all(|op| op.collection == "evidence"));
    }

    #[test]
    fn test_max_entries_strategies() {
        let (mut lru, clock, _) = collection(CollectionConfig {
            max_entries: 2,
            eviction_strategy: EvictionStrategy::Lru,
            ..Default::default()
        });
        lru.upsert("a", evidence("c", "a"), MutationOrigin::Remote).unwrap();
        clock.advance(1);
        lru.upsert("b", evidence("c", "b"), MutationOrigin::Remote).unwrap();
        clock.advance(1);
        lru.get("a");
        let out = lru.upsert("c", evidence("c", "c"), MutationOrigin::Remote).unwrap();
        assert_eq!(out.evicted, 1);
        assert!(lru.peek("a").is_some());
        assert!(lru.peek("b").is_none());

        let (mut lfu, _, _) = collection(CollectionConfig {
            max_entries: 2,
            eviction_strategy: EvictionStrategy::Lfu,
            ..Default::default()
        });
        lfu.upsert("a", evidence("c", "a"), MutationOrigin::Remote).unwrap();
        lfu.upsert("b", evidence("c", "b"), MutationOrigin::Remote).unwrap();
        lfu.get("b");
        lfu.get("b");
        lfu.get("a");
        lfu.upsert("c", evidence("c", "c"), MutationOrigin::Remote).unwrap();
        assert!(lfu.peek("a").is_none());
        assert!(lfu.peek("b").is_some());

        let (mut fifo, _, _) = collection(CollectionConfig {
            max_entries: 2,
            eviction_strategy: EvictionStrategy::Fifo,
            ..Default::default()
        });
        fifo.upsert("a", evidence("c", "a"), MutationOrigin::Remote).unwrap();
        fifo.upsert("b", evidence("c", "b"), MutationOrigin::Remote).unwrap();
        fifo.get("a");
        fifo.upsert("c", evidence("c", "c"), MutationOrigin::Remote).unwrap();
        assert!(fifo.peek("a").is_none());
        assert_eq!(fifo.len(), 2);
    }

    #[test]
    fn test_secondary_index_tracks_mutations() {
        let (mut col, _, _) = collection(CollectionConfig::default());
        col.upsert("e1", evidence("case-1", "a"), MutationOrigin::Remote).unwrap();
        col.add_index("case", |e: &Evidence| Some(e.case_id.clone()));
        col.upsert("e2", evidence("case-1", "b"), MutationOrigin::Remote).unwrap();
        col.upsert("e3", evidence("case-2", "c"), MutationOrigin::Remote).unwrap();

        let ids: Vec<&str> = col.find_by_index("case", "case-1").iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);

        col.upsert("e1", evidence("case-2", "moved"), MutationOrigin::Remote).unwrap();
        col.remove("e3", MutationOrigin::Remote);
        assert_eq!(col.find_by_index("case", "case-1").len(), 1);
        let moved = col.find_by_index("case", "case-2");
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, "e1");
        assert!(col.find_by_index("unknown", "x").is_empty());
    }

    #[test]
    fn test_evict_least_recent_and_bytes() {
        let (mut col, clock, _) = collection(CollectionConfig::default());
        for i in 0..5 {
            col.upsert(format!("e{}", i), evidence("c", "x"), MutationOrigin::Remote).unwrap();
            clock.advance(1);
        }
        col.get("e0");
        let before = col.approx_bytes();

        assert_eq!(col.evict_least_recent(2), 2);
        assert!(col.peek("e0").is_some());
        assert!(col.peek("e1").is_none());
        assert!(col.peek("e2").is_none());
        assert!(col.approx_bytes() < before);
        assert_eq!(col.evict_least_recent(10), 3);
        assert_eq!(col.approx_bytes(), 0);
    }

    #[test]
    fn test_query_in_insertion_order() {
        let (mut col, _, _) = collection(CollectionConfig::default());
        for id in ["z", "a", "m"] {
            col.upsert(id, evidence("c", id), MutationOrigin::Remote).unwrap();
        }
        let ids: Vec<&str> = col.query(|d| d.id != "a").iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "m"]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sweep_leaves_only_fresh_documents(
                ttl in 1u64..1_000,
                steps in proptest::collection::vec((0u64..400, 0usize..20), 1..60),
            ) {
                let (mut col, clock, _) = collection(CollectionConfig { ttl_ms: ttl, ..Default::default() });
                for (advance, id) in steps {
                    clock.advance(advance);
                    col.upsert(format!("e{}", id), evidence("c", "x"), MutationOrigin::Remote).unwrap();
                }
                col.sweep_expired();
                let now = clock.now_millis();
                for doc in col.query(|_| true) {
                    prop_assert!(now - doc.created_at <= ttl);
                    prop_assert!(doc.last_access >= doc.created_at);
                }
                prop_assert_eq!(col.query(|_| true).len(), col.len());
            }
        }
    }
}
