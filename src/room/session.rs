// Room session lifecycle: join, reconnect, exit, and the single room
// garbage-collection rule.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::paths;
use super::progress::{LayerData, Progress, NUM_LAYERS};
use crate::store::{DisconnectAction, DisconnectGuard, RemoteStore, StoreError, Subscription};

/// Longest allowed room code.
pub const MAX_ROOM_CODE_LEN: usize = 9;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("room code `{code}` must be 1 to {MAX_ROOM_CODE_LEN} characters")]
    RoomCodeInvalid { code: String },

    #[error("player name must not be empty")]
    PlayerNameEmpty,

    #[error("the name `{name}` is already in use in this room")]
    NameTaken { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Player list parsing
// ---------------------------------------------------------------------------

/// Parse the room's player map: name -> online. Accepts both storage shapes
/// that exist in the wild (`{"online": bool}` records and plain `true`
/// presence flags); this crate always writes the record shape.
pub fn parse_players(value: Option<&Value>) -> BTreeMap<String, bool> {
    let mut out = BTreeMap::new();
    let Some(map) = value.and_then(|v| v.as_object()) else {
        return out;
    };
    for (name, entry) in map {
        let online = match entry {
            Value::Bool(b) => *b,
            Value::Object(fields) => fields
                .get("online")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            _ => {
                warn!("ignoring malformed player entry for `{name}`");
                continue;
            }
        };
        out.insert(name.clone(), online);
    }
    out
}

/// Number of players currently marked online.
pub fn online_count(players: &BTreeMap<String, bool>) -> usize {
    players.values().filter(|online| **online).count()
}

// ---------------------------------------------------------------------------
// Session subscriptions
// ---------------------------------------------------------------------------

/// The three live subscriptions a joined session holds. Each cancels on drop,
/// so teardown happens deterministically whichever way the session ends.
pub struct SessionStreams {
    pub data: Subscription,
    pub players: Subscription,
    pub reset: Subscription,
}

/// Everything `join` produces: the session handle, its subscriptions, and
/// the initial local state.
pub struct JoinOutcome {
    pub session: RoomSession,
    pub streams: SessionStreams,
    pub progress: Progress,
    pub data: LayerData,
    pub players: BTreeMap<String, bool>,
}

impl std::fmt::Debug for JoinOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinOutcome")
            .field("progress", &self.progress)
            .field("data", &self.data)
            .field("players", &self.players)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// The session
// ---------------------------------------------------------------------------

/// One player's membership in one room.
pub struct RoomSession {
    store: Arc<dyn RemoteStore>,
    room_code: String,
    player_name: String,
    guard: Option<DisconnectGuard>,
    exited: bool,
}

impl RoomSession {
    /// Join `room_code` as `player_name`.
    ///
    /// Reads the player list once. A name that is present and online is
    /// rejected with [`SessionError::NameTaken`]; present but offline is a
    /// reconnect, resuming the pointer one past the player's last recorded
    /// pick. Registers presence, arms the offline-on-disconnect mutation,
    /// and subscribes to the room's data, players, and reset-trigger paths.
    pub async fn join(
        store: Arc<dyn RemoteStore>,
        room_code: &str,
        player_name: &str,
    ) -> Result<JoinOutcome, SessionError> {
        let code_len = room_code.chars().count();
        if code_len == 0 || code_len > MAX_ROOM_CODE_LEN {
            return Err(SessionError::RoomCodeInvalid {
                code: room_code.to_string(),
            });
        }
        if player_name.is_empty() {
            return Err(SessionError::PlayerNameEmpty);
        }

        let mut players = parse_players(store.get(&paths::players(room_code)).await?.as_ref());
        let returning = match players.get(player_name) {
            Some(true) => {
                return Err(SessionError::NameTaken {
                    name: player_name.to_string(),
                })
            }
            Some(false) => true,
            None => false,
        };

        let data = LayerData::from_value(store.get(&paths::data(room_code)).await?.as_ref());
        let progress = if returning {
            let resumed = Progress::resume(&data, player_name);
            info!(
                "`{player_name}` reconnecting to room {room_code}, resuming at layer {}",
                resumed.pointer()
            );
            resumed
        } else {
            info!("`{player_name}` joining room {room_code}");
            Progress::default()
        };

        let player_path = paths::player(room_code, player_name);
        store.put(&player_path, json!({"online": true})).await?;
        players.insert(player_name.to_string(), true);

        // If the connection drops before a clean exit, the server marks the
        // player offline; this is the only code guaranteed to run then.
        let guard = store
            .arm_on_disconnect(&player_path, DisconnectAction::Put(json!({"online": false})))
            .await?;

        let streams = SessionStreams {
            data: store.subscribe(&paths::data(room_code)).await?,
            players: store.subscribe(&paths::players(room_code)).await?,
            reset: store.subscribe(&paths::reset_trigger(room_code)).await?,
        };

        Ok(JoinOutcome {
            session: RoomSession {
                store,
                room_code: room_code.to_string(),
                player_name: player_name.to_string(),
                guard: Some(guard),
                exited: false,
            },
            streams,
            progress,
            data,
            players,
        })
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    /// Leave the room: disarm the disconnect mutation, remove this player's
    /// registration and every layer entry, then run the room GC rule.
    ///
    /// Idempotent, and never fails the caller-visible flow: remote errors on
    /// the way out are logged, and a second call (or a call after the room
    /// was deleted elsewhere) is a quiet no-op.
    pub async fn exit(&mut self) {
        if self.exited {
            debug!(
                "`{}` already exited room {}, ignoring",
                self.player_name, self.room_code
            );
            return;
        }
        self.exited = true;
        info!("`{}` leaving room {}", self.player_name, self.room_code);

        if let Some(mut guard) = self.guard.take() {
            guard.cancel();
        }

        let player_path = paths::player(&self.room_code, &self.player_name);
        if let Err(e) = self.store.remove(&player_path).await {
            warn!("failed to remove player registration: {e}");
        }
        for layer in 0..NUM_LAYERS {
            let entry = paths::entry(&self.room_code, layer, &self.player_name);
            if let Err(e) = self.store.remove(&entry).await {
                warn!("failed to remove layer {layer} entry: {e}");
            }
        }

        gc_room(&self.store, &self.room_code).await;
    }

    /// Whether `exit` has already run.
    pub fn exited(&self) -> bool {
        self.exited
    }
}

/// The room garbage-collection rule, in one place: when no player is marked
/// online, delete the whole room subtree so players, layer data, and the
/// reset trigger go together with no orphaned paths.
///
/// Invoked after every membership change: the exit path and observed
/// presence changes in the session event loop both land here.
pub async fn gc_room(store: &Arc<dyn RemoteStore>, room_code: &str) {
    let players = match store.get(&paths::players(room_code)).await {
        Ok(v) => parse_players(v.as_ref()),
        Err(e) => {
            warn!("room GC read failed for {room_code}: {e}");
            return;
        }
    };
    if online_count(&players) > 0 {
        return;
    }
    info!("no online players left in room {room_code}, deleting the room");
    if let Err(e) = store.remove(&paths::room(room_code)).await {
        warn!("room GC delete failed for {room_code}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;

    fn connect(backend: &Arc<MemoryBackend>) -> Arc<dyn RemoteStore> {
        Arc::new(backend.connect())
    }

    #[tokio::test]
    async fn join_publishes_presence() {
        let backend = MemoryBackend::new();
        let store = connect(&backend);

        let outcome = RoomSession::join(store.clone(), "ABC", "Alice").await.unwrap();
        assert_eq!(outcome.progress.pointer(), 0);
        assert_eq!(
            store.get("rooms/ABC/players/Alice").await.unwrap(),
            Some(json!({"online": true}))
        );
        assert_eq!(outcome.players.get("Alice"), Some(&true));
    }

    #[tokio::test]
    async fn room_code_and_name_are_validated() {
        let backend = MemoryBackend::new();
        let store = connect(&backend);

        let err = RoomSession::join(store.clone(), "", "Alice").await.unwrap_err();
        assert!(matches!(err, SessionError::RoomCodeInvalid { .. }));

        let err = RoomSession::join(store.clone(), "TENLETTERS", "Alice")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::RoomCodeInvalid { .. }));

        let err = RoomSession::join(store.clone(), "ABC", "").await.unwrap_err();
        assert!(matches!(err, SessionError::PlayerNameEmpty));

        // Nine characters is the maximum, and it is accepted.
        assert!(RoomSession::join(store, "NINECHARS", "Alice").await.is_ok());
    }

    #[tokio::test]
    async fn second_join_with_an_online_name_is_rejected() {
        let backend = MemoryBackend::new();
        let first = RoomSession::join(connect(&backend), "ABC", "Alice")
            .await
            .unwrap();

        let err = RoomSession::join(connect(&backend), "ABC", "Alice")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NameTaken { .. }));

        // Case-sensitive, first-come-wins: a differently-cased name is new.
        assert!(RoomSession::join(connect(&backend), "ABC", "alice")
            .await
            .is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn offline_player_reconnects_with_resumed_pointer() {
        let backend = MemoryBackend::new();
        let store = connect(&backend);
        store
            .put("rooms/ABC/players/Alice", json!({"online": false}))
            .await
            .unwrap();
        store.put("rooms/ABC/data/0/Alice", json!(2)).await.unwrap();
        store.put("rooms/ABC/data/1/Alice", json!(3)).await.unwrap();

        let outcome = RoomSession::join(store.clone(), "ABC", "Alice").await.unwrap();
        assert_eq!(outcome.progress.pointer(), 2);
        assert_eq!(
            store.get("rooms/ABC/players/Alice").await.unwrap(),
            Some(json!({"online": true}))
        );
    }

    #[tokio::test]
    async fn exit_strips_picks_and_deletes_an_empty_room() {
        let backend = MemoryBackend::new();
        let store = connect(&backend);
        let mut outcome = RoomSession::join(store.clone(), "ABC", "Alice")
            .await
            .unwrap();
        store.put("rooms/ABC/data/0/Alice", json!(2)).await.unwrap();
        store.put("rooms/ABC/resetTrigger", json!(123)).await.unwrap();

        outcome.session.exit().await;

        // Whole subtree gone: players, data, resetTrigger.
        assert_eq!(store.get("rooms/ABC").await.unwrap(), None);
    }

    #[tokio::test]
    async fn exit_is_idempotent() {
        let backend = MemoryBackend::new();
        let store = connect(&backend);
        let mut outcome = RoomSession::join(store.clone(), "ABC", "Alice")
            .await
            .unwrap();

        outcome.session.exit().await;
        let after_first = store.get("rooms").await.unwrap();
        outcome.session.exit().await;
        assert_eq!(store.get("rooms").await.unwrap(), after_first);
        assert!(outcome.session.exited());
    }

    #[tokio::test]
    async fn exit_keeps_the_room_while_others_are_online() {
        let backend = MemoryBackend::new();
        let mut alice = RoomSession::join(connect(&backend), "ABC", "Alice")
            .await
            .unwrap();
        let bob = RoomSession::join(connect(&backend), "ABC", "Bob")
            .await
            .unwrap();

        let store = connect(&backend);
        store.put("rooms/ABC/data/0/Alice", json!(2)).await.unwrap();
        store.put("rooms/ABC/data/0/Bob", json!(1)).await.unwrap();

        alice.session.exit().await;

        // Alice's registration and picks are gone, Bob's remain.
        assert_eq!(store.get("rooms/ABC/players/Alice").await.unwrap(), None);
        assert_eq!(
            store.get("rooms/ABC/data/0").await.unwrap(),
            Some(json!({"Bob": 1}))
        );
        drop(bob);
    }

    #[tokio::test]
    async fn crash_marks_the_player_offline_and_allows_reconnect() {
        let backend = MemoryBackend::new();
        let conn = backend.connect();
        let conn_id = conn.conn_id();
        let store: Arc<dyn RemoteStore> = Arc::new(conn);

        let outcome = RoomSession::join(store.clone(), "ABC", "Alice").await.unwrap();
        store.put("rooms/ABC/data/0/Alice", json!(2)).await.unwrap();
        drop(outcome); // session dropped without exit; the armed mutation stays

        backend.drop_connection(conn_id);
        assert_eq!(
            store.get("rooms/ABC/players/Alice").await.unwrap(),
            Some(json!({"online": false}))
        );

        // The name is reusable now, and progress resumes past layer 0.
        let rejoined = RoomSession::join(connect(&backend), "ABC", "Alice")
            .await
            .unwrap();
        assert_eq!(rejoined.progress.pointer(), 1);
    }

    #[tokio::test]
    async fn gc_ignores_rooms_with_online_players() {
        let backend = MemoryBackend::new();
        let store = connect(&backend);
        let _outcome = RoomSession::join(store.clone(), "ABC", "Alice")
            .await
            .unwrap();

        gc_room(&store, "ABC").await;
        assert!(store.get("rooms/ABC/players/Alice").await.unwrap().is_some());
    }

    #[test]
    fn parse_players_accepts_both_storage_shapes() {
        let value = json!({
            "Alice": {"online": true},
            "Bob": {"online": false},
            "Carol": true,
            "Mallory": 3,
        });
        let players = parse_players(Some(&value));
        assert_eq!(players.get("Alice"), Some(&true));
        assert_eq!(players.get("Bob"), Some(&false));
        assert_eq!(players.get("Carol"), Some(&true));
        assert!(!players.contains_key("Mallory"));
        assert_eq!(online_count(&players), 2);
    }
}
