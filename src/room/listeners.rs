use serde::Deserialize;

use super::documents::RoomPaths;
use super::state::Signal;
use crate::error::Result;
use crate::store::{Change, ChangeKind, DocumentStore, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    Presence,
    Disconnects,
    Stopped,
}

#[derive(Deserialize)]
struct EventFields {
    peer_id: String,
    #[serde(default)]
    username: String,
}

/// The three change feeds of one room. Dropping the value detaches all of
/// them from the store.
pub struct Listeners {
    presence: Subscription,
    disconnects: Subscription,
    stopped: Subscription,
}

impl Listeners {
    pub async fn attach(store: &dyn DocumentStore, paths: &RoomPaths) -> Result<Self> {
        let disconnects = store.subscribe(&paths.disconnects).await?;
        let stopped = store.subscribe(&paths.stopped).await?;
        let presence = store.subscribe(&paths.presence).await?;
        Ok(Self {
            presence,
            disconnects,
            stopped,
        })
    }

    /// Next signal from any feed. Disconnects win over stop-stream events,
    /// which win over presence changes, when several are ready.
    ///
    /// Returns `None` once every feed has closed.
    pub async fn next(&mut self) -> Option<Signal> {
        loop {
            let (feed, change) = tokio::select! {
                biased;
                Some(change) = self.disconnects.next() => (Feed::Disconnects, change),
                Some(change) = self.stopped.next() => (Feed::Stopped, change),
                Some(change) = self.presence.next() => (Feed::Presence, change),
                else => return None,
            };
            if let Some(signal) = to_signal(feed, change) {
                return Some(signal);
            }
        }
    }
}

fn to_signal(feed: Feed, change: Change) -> Option<Signal> {
    let document = change.document;
    let fields: EventFields = match serde_json::from_value(document.fields) {
        Ok(fields) => fields,
        Err(e) => {
            tracing::debug!(record = %document.id, ?feed, error = %e, "skipping malformed room document");
            return None;
        }
    };
    match (feed, change.kind) {
        (Feed::Presence, ChangeKind::Added) => Some(Signal::PresenceAdded {
            peer_id: fields.peer_id,
            username: fields.username,
            record_id: document.id,
            stamp: document.created,
        }),
        (Feed::Presence, ChangeKind::Removed) => Some(Signal::PresenceRemoved {
            peer_id: fields.peer_id,
            record_id: document.id,
        }),
        (Feed::Disconnects, ChangeKind::Added) => Some(Signal::Disconnect {
            peer_id: fields.peer_id,
            stamp: document.created,
        }),
        (Feed::Stopped, ChangeKind::Added) => Some(Signal::StopStream {
            peer_id: fields.peer_id,
            stamp: document.created,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn replays_existing_documents_in_priority_order() {
        let store = MemoryStore::new();
        let paths = RoomPaths::new(&StoreConfig::default(), "r1");
        store
            .add(&paths.presence, json!({"peer_id": "b", "username": "bobby", "room_id": "r1"}))
            .await
            .unwrap();
        store
            .add(&paths.disconnects, json!({"peer_id": "b", "username": "bobby", "room_id": "r1"}))
            .await
            .unwrap();

        let mut listeners = Listeners::attach(&store, &paths).await.unwrap();
        assert!(matches!(
            listeners.next().await,
            Some(Signal::Disconnect { stamp: 2, .. })
        ));
        match listeners.next().await {
            Some(Signal::PresenceAdded {
                peer_id,
                username,
                stamp,
                ..
            }) => {
                assert_eq!(peer_id, "b");
                assert_eq!(username, "bobby");
                assert_eq!(stamp, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped() {
        let store = MemoryStore::new();
        let paths = RoomPaths::new(&StoreConfig::default(), "r1");
        let mut listeners = Listeners::attach(&store, &paths).await.unwrap();
        store.add(&paths.stopped, json!({"nope": 1})).await.unwrap();
        let id = store
            .add(&paths.presence, json!({"peer_id": "c"}))
            .await
            .unwrap();
        store.delete(&paths.presence, &id).await.unwrap();

        assert!(matches!(listeners.next().await, Some(Signal::PresenceAdded { .. })));
        match listeners.next().await {
            Some(Signal::PresenceRemoved { record_id, .. }) => assert_eq!(record_id, id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_detaches_every_feed() {
        let store = MemoryStore::new();
        let paths = RoomPaths::new(&StoreConfig::default(), "r1");
        let listeners = Listeners::attach(&store, &paths).await.unwrap();
        assert_eq!(store.listener_count(&paths.presence), 1);
        assert_eq!(store.listener_count(&paths.disconnects), 1);
        assert_eq!(store.listener_count(&paths.stopped), 1);
        drop(listeners);
        assert_eq!(store.listener_count(&paths.presence), 0);
        assert_eq!(store.listener_count(&paths.disconnects), 0);
        assert_eq!(store.listener_count(&paths.stopped), 0);
    }
}
