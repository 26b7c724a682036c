use serde_json::json;

use crate::config::StoreConfig;
use crate::error::{AppError, Result};
use crate::store::DocumentStore;

/// Last path segment of a share link, or the input itself when it is a bare id.
pub fn room_id_from_link(input: &str) -> &str {
    let trimmed = input.trim().trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Confirms that the referenced room exists and returns its id.
///
/// Store faults, slow lookups and missing rooms all collapse into
/// [`AppError::RoomNotFound`]; the user is shown one message either way.
pub async fn resolve_room(
    store: &dyn DocumentStore,
    config: &StoreConfig,
    input: &str,
) -> Result<String> {
    let room_id = room_id_from_link(input);
    if room_id.is_empty() {
        return Err(AppError::RoomNotFound);
    }
    let lookup = store.get(&config.rooms_collection, room_id);
    match tokio::time::timeout(config.request_timeout(), lookup).await {
        Ok(Ok(Some(doc))) => Ok(doc.id),
        Ok(Ok(None)) => {
            tracing::debug!(room = %room_id, "room document missing");
            Err(AppError::RoomNotFound)
        }
        Ok(Err(e)) => {
            tracing::debug!(room = %room_id, error = %e, "room lookup failed");
            Err(AppError::RoomNotFound)
        }
        Err(_) => {
            tracing::debug!(room = %room_id, "room lookup timed out");
            Err(AppError::RoomNotFound)
        }
    }
}

pub async fn create_room(store: &dyn DocumentStore, rooms_collection: &str) -> Result<String> {
    let id = store.add(rooms_collection, json!({})).await?;
    tracing::info!(room = %id, "room created");
    Ok(id)
}

pub fn share_link(origin: &str, room_id: &str) -> String {
    format!("{}/{}", origin.trim_end_matches('/'), room_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn rooms() -> StoreConfig {
        StoreConfig::default()
    }

    #[test]
    fn link_and_bare_id_agree() {
        assert_eq!(room_id_from_link("https://host/abc123"), "abc123");
        assert_eq!(room_id_from_link("abc123"), "abc123");
        assert_eq!(room_id_from_link("  https://host/rooms/abc123/ "), "abc123");
        assert_eq!(room_id_from_link(""), "");
    }

    #[test]
    fn share_link_has_one_slash() {
        assert_eq!(share_link("https://host/", "abc"), "https://host/abc");
        assert_eq!(share_link("https://host", "abc"), "https://host/abc");
    }

    #[tokio::test]
    async fn resolves_created_room_from_link() {
        let store = MemoryStore::new();
        let config = rooms();
        let id = create_room(&store, &config.rooms_collection).await.unwrap();
        let link = share_link("https://host", &id);
        assert_eq!(resolve_room(&store, &config, &link).await.unwrap(), id);
        assert_eq!(resolve_room(&store, &config, &id).await.unwrap(), id);
    }

    #[tokio::test]
    async fn missing_room_is_not_found() {
        let store = MemoryStore::new();
        let err = resolve_room(&store, &rooms(), "https://host/nope").await.unwrap_err();
        assert!(matches!(err, AppError::RoomNotFound));
        assert!(matches!(
            resolve_room(&store, &rooms(), "  ").await,
            Err(AppError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn store_failure_reads_as_not_found() {
        let store = MemoryStore::new();
        let config = rooms();
        let id = create_room(&store, &config.rooms_collection).await.unwrap();
        store.set_offline(true);
        let err = resolve_room(&store, &config, &id).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Either room id is incorrect or room doesn't exist"
        );
    }
}
