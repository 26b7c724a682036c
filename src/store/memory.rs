use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{random_id, Change, ChangeKind, Document, DocumentStore, Subscription};
use crate::error::{AppError, Result};

#[derive(Default)]
struct Collection {
    /// Keyed by insertion stamp so replays come out in insertion order.
    docs: BTreeMap<u64, Document>,
    listeners: Vec<mpsc::UnboundedSender<Change>>,
}

impl Collection {
    fn broadcast(&mut self, change: &Change) {
        self.listeners.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn find(&self, id: &str) -> Option<u64> {
        self.docs.iter().find(|(_, doc)| doc.id == id).map(|(stamp, _)| *stamp)
    }
}

#[derive(Default)]
struct Inner {
    next_stamp: u64,
    collections: HashMap<String, Collection>,
    offline: bool,
}

/// In-process store. Writes and notifications happen under one lock, so every
/// subscriber of a collection sees changes in commit order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail, as a lost connection would.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.offline = offline;
        }
    }

    /// Number of documents currently stored in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.collections.get(collection).map_or(0, |c| c.docs.len()))
            .unwrap_or(0)
    }

    pub fn listener_count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .collections
                    .get(collection)
                    .map_or(0, |c| c.listeners.iter().filter(|tx| !tx.is_closed()).count())
            })
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| AppError::Store("memory store lock poisoned".to_string()))?;
        if inner.offline {
            return Err(AppError::Store("store is offline".to_string()));
        }
        Ok(inner)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn add(&self, collection: &str, fields: Value) -> Result<String> {
        let mut inner = self.lock()?;
        inner.next_stamp += 1;
        let doc = Document {
            id: random_id(),
            created: inner.next_stamp,
            fields,
        };
        let id = doc.id.clone();
        let entry = inner.collections.entry(collection.to_string()).or_default();
        entry.docs.insert(doc.created, doc.clone());
        entry.broadcast(&Change {
            kind: ChangeKind::Added,
            document: doc,
        });
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let inner = self.lock()?;
        Ok(inner.collections.get(collection).and_then(|c| {
            c.find(id).and_then(|stamp| c.docs.get(&stamp).cloned())
        }))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.collections.get_mut(collection) else {
            return Ok(());
        };
        if let Some(doc) = entry.find(id).and_then(|stamp| entry.docs.remove(&stamp)) {
            entry.broadcast(&Change {
                kind: ChangeKind::Removed,
                document: doc,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription> {
        let mut inner = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = inner.collections.entry(collection.to_string()).or_default();
        for doc in entry.docs.values() {
            let _ = tx.send(Change {
                kind: ChangeKind::Added,
                document: doc.clone(),
            });
        }
        entry.listeners.push(tx);
        Ok(Subscription::new(rx))
    }
}
