//! Document store used as the presence and signaling bulletin board.
//!
//! Collections are addressed by slash separated paths such as
//! `calls/<room>/presence`. A subscription first replays every existing
//! document as [`ChangeKind::Added`] and then delivers live changes.

mod memory;
mod remote;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Store assigned insertion stamp, strictly increasing per store.
    pub created: u64,
    pub fields: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub document: Document,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a document with a store generated id and returns the id.
    async fn add(&self, collection: &str, fields: Value) -> Result<String>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Deleting a missing document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn subscribe(&self, collection: &str) -> Result<Subscription>;
}

/// Live change feed for one collection. Dropping it detaches the listener.
pub struct Subscription {
    changes: mpsc::UnboundedReceiver<Change>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(changes: mpsc::UnboundedReceiver<Change>) -> Self {
        Self {
            changes,
            on_drop: None,
        }
    }

    pub fn with_release(
        changes: mpsc::UnboundedReceiver<Change>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            changes,
            on_drop: Some(Box::new(release)),
        }
    }

    /// Next change, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<Change> {
        self.changes.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

pub(crate) fn random_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}
