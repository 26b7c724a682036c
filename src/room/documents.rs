use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{AppError, Result};
use crate::store::DocumentStore;

/// Body of presence, disconnect and stop-stream documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub peer_id: String,
    pub username: String,
    pub room_id: String,
}

/// Sub-collection paths of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPaths {
    pub presence: String,
    pub disconnects: String,
    pub stopped: String,
}

impl RoomPaths {
    pub fn new(config: &StoreConfig, room_id: &str) -> Self {
        let base = format!("{}/{}", config.rooms_collection, room_id);
        Self {
            presence: format!("{}/{}", base, config.presence_collection),
            disconnects: format!("{}/{}", base, config.disconnect_collection),
            stopped: format!("{}/{}", base, config.stop_collection),
        }
    }
}

/// Writes presence, disconnect and stop-stream documents for one room.
///
/// Failures never propagate: callers get `None` or `false` and decide what
/// to show. Every store call is bounded by the request timeout and retried
/// a fixed number of times.
#[derive(Clone)]
pub struct RoomDocuments {
    store: Arc<dyn DocumentStore>,
    room_id: String,
    paths: RoomPaths,
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
}

impl RoomDocuments {
    pub fn new(store: Arc<dyn DocumentStore>, config: &StoreConfig, room_id: &str) -> Self {
        Self {
            store,
            room_id: room_id.to_string(),
            paths: RoomPaths::new(config, room_id),
            timeout: config.request_timeout(),
            attempts: config.write_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn paths(&self) -> &RoomPaths {
        &self.paths
    }

    /// Files a presence record; the returned id is needed to retract it.
    pub async fn publish_presence(&self, peer_id: &str, username: &str) -> Option<String> {
        match self.insert(&self.paths.presence, peer_id, username).await {
            Ok(id) => {
                tracing::debug!(room = %self.room_id, peer = %peer_id, record = %id, "presence published");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(room = %self.room_id, peer = %peer_id, error = %e, "failed to publish presence");
                None
            }
        }
    }

    /// Deletes a presence record. Deleting one that is already gone counts
    /// as success; `false` means the record may still be in the store.
    pub async fn retract_presence(&self, record_id: &str) -> bool {
        let result = self
            .retrying("presence delete", || {
                self.store.delete(&self.paths.presence, record_id)
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(room = %self.room_id, record = %record_id, error = %e, "failed to retract presence");
                false
            }
        }
    }

    pub async fn publish_disconnect(&self, peer_id: &str, username: &str) -> bool {
        match self.insert(&self.paths.disconnects, peer_id, username).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(room = %self.room_id, peer = %peer_id, error = %e, "failed to publish disconnect");
                false
            }
        }
    }

    pub async fn publish_stop_stream(&self, peer_id: &str, username: &str) -> bool {
        match self.insert(&self.paths.stopped, peer_id, username).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(room = %self.room_id, peer = %peer_id, error = %e, "failed to publish stop-stream");
                false
            }
        }
    }

    async fn insert(&self, collection: &str, peer_id: &str, username: &str) -> Result<String> {
        let fields = serde_json::to_value(PresenceRecord {
            peer_id: peer_id.to_string(),
            username: username.to_string(),
            room_id: self.room_id.clone(),
        })?;
        self.retrying("document add", || self.store.add(collection, fields.clone()))
            .await
    }

    async fn retrying<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(what)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    tracing::debug!(room = %self.room_id, attempt, error = %e, "{} failed, retrying", what);
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> StoreConfig {
        StoreConfig {
            retry_backoff_ms: 1,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn paths_nest_under_room() {
        let paths = RoomPaths::new(&StoreConfig::default(), "r1");
        assert_eq!(paths.presence, "calls/r1/presence");
        assert_eq!(paths.disconnects, "calls/r1/disconnects");
        assert_eq!(paths.stopped, "calls/r1/stopped");
    }

    #[tokio::test]
    async fn presence_round_trip() {
        let store = MemoryStore::new();
        let docs = RoomDocuments::new(Arc::new(store.clone()), &config(), "r1");

        let record = docs.publish_presence("peer-a", "alice").await.unwrap();
        let doc = store
            .get("calls/r1/presence", &record)
            .await
            .unwrap()
            .unwrap();
        let body: PresenceRecord = serde_json::from_value(doc.fields).unwrap();
        assert_eq!(body.peer_id, "peer-a");
        assert_eq!(body.room_id, "r1");

        assert!(docs.retract_presence(&record).await);
        assert_eq!(store.len("calls/r1/presence"), 0);
        // absent record
        assert!(docs.retract_presence(&record).await);
    }

    #[tokio::test]
    async fn failures_become_sentinels() {
        let store = MemoryStore::new();
        let docs = RoomDocuments::new(Arc::new(store.clone()), &config(), "r1");
        store.set_offline(true);

        assert!(docs.publish_presence("peer-a", "alice").await.is_none());
        assert!(!docs.publish_disconnect("peer-a", "alice").await);
        assert!(!docs.publish_stop_stream("peer-a", "alice").await);
        assert!(!docs.retract_presence("missing").await);
    }

    #[tokio::test]
    async fn events_land_in_their_collections() {
        let store = MemoryStore::new();
        let docs = RoomDocuments::new(Arc::new(store.clone()), &config(), "r1");
        assert!(docs.publish_disconnect("peer-a", "alice").await);
        assert!(docs.publish_stop_stream("peer-a", "alice").await);
        assert_eq!(store.len("calls/r1/disconnects"), 1);
        assert_eq!(store.len("calls/r1/stopped"), 1);
        assert_eq!(store.len("calls/r1/presence"), 0);
    }
}
