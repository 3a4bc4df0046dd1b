// Reset coordination: clear a room's progress for everyone while preserving
// membership.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::info;

use super::paths;
use crate::store::{RemoteStore, StoreError};

/// Reset `room_code` back to layer 0 for all players.
///
/// Rewrites the room subtree in one write that keeps the current player map
/// and drops the layer data, then bumps the reset trigger with a fresh
/// timestamp. The trigger change is the sole cross-session broadcast: every
/// subscribed session (the initiator included) reacts to it by clearing its
/// local layer state, not to the data write itself. Returns the timestamp
/// written.
pub async fn reset(store: &Arc<dyn RemoteStore>, room_code: &str) -> Result<i64, StoreError> {
    let players = store
        .get(&paths::players(room_code))
        .await?
        .unwrap_or_else(|| json!({}));

    let stamp = Utc::now().timestamp_millis();
    info!("resetting room {room_code} at {stamp}");

    // One subtree write so membership and the data wipe land atomically.
    store
        .put(&paths::room(room_code), json!({ "players": players }))
        .await?;
    store
        .put(&paths::reset_trigger(room_code), json!(stamp))
        .await?;
    Ok(stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;

    #[tokio::test]
    async fn reset_preserves_players_and_clears_data() {
        let backend = MemoryBackend::new();
        let store: Arc<dyn RemoteStore> = Arc::new(backend.connect());
        store
            .put("rooms/ABC/players/Alice", json!({"online": true}))
            .await
            .unwrap();
        store
            .put("rooms/ABC/players/Bob", json!({"online": false}))
            .await
            .unwrap();
        store.put("rooms/ABC/data/0/Alice", json!(2)).await.unwrap();
        store.put("rooms/ABC/data/4/Bob", json!(1)).await.unwrap();

        let stamp = reset(&store, "ABC").await.unwrap();

        assert_eq!(store.get("rooms/ABC/data").await.unwrap(), None);
        assert_eq!(
            store.get("rooms/ABC/players").await.unwrap(),
            Some(json!({"Alice": {"online": true}, "Bob": {"online": false}}))
        );
        assert_eq!(
            store.get("rooms/ABC/resetTrigger").await.unwrap(),
            Some(json!(stamp))
        );
    }

    #[tokio::test]
    async fn resetting_twice_bumps_the_trigger() {
        let backend = MemoryBackend::new();
        let store: Arc<dyn RemoteStore> = Arc::new(backend.connect());
        store
            .put("rooms/ABC/players/Alice", json!({"online": true}))
            .await
            .unwrap();

        let first = reset(&store, "ABC").await.unwrap();
        let second = reset(&store, "ABC").await.unwrap();
        assert!(second >= first);
        assert_eq!(
            store.get("rooms/ABC/resetTrigger").await.unwrap(),
            Some(json!(second))
        );
    }
}
