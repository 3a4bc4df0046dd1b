// Session orchestration: the central event loop.
//
// Coordinates user commands from the presentation layer with change
// notifications from the remote store. User actions are applied to local
// state first (optimistic), then written to the store; remote notifications
// replace the corresponding local state wholesale. Every state change pushes
// a fresh snapshot to the UI channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{RoomSnapshot, UiUpdate, UserCommand};
use crate::room::progress::{LayerData, Progress, NUMBER_CHOICES, NUM_LAYERS};
use crate::room::session::{gc_room, online_count, RoomSession, SessionStreams};
use crate::room::{paths, reset, JoinOutcome};
use crate::store::RemoteStore;

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Why the joined-session loop ended.
enum SessionEnd {
    /// The player exited the room; go back to waiting for a join.
    Left,
    /// The command channel or UI channel closed; shut the engine down.
    Closed,
}

/// Run the session engine until the command channel closes.
///
/// While not in a room, only `Join` is meaningful; other commands are
/// rejected. After a successful join the loop also reacts to the room's
/// data, players, and reset-trigger subscriptions.
pub async fn run(
    store: Arc<dyn RemoteStore>,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
) -> anyhow::Result<()> {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            UserCommand::Join {
                room_code,
                player_name,
            } => {
                let outcome =
                    match RoomSession::join(store.clone(), &room_code, &player_name).await {
                        Ok(o) => o,
                        Err(e) => {
                            info!("join refused: {e}");
                            if ui_tx
                                .send(UiUpdate::JoinFailed {
                                    reason: e.to_string(),
                                })
                                .await
                                .is_err()
                            {
                                return Ok(());
                            }
                            continue;
                        }
                    };
                match run_session(&store, &mut cmd_rx, &ui_tx, outcome).await {
                    SessionEnd::Left => continue,
                    SessionEnd::Closed => return Ok(()),
                }
            }
            other => {
                debug!("ignoring {other:?} outside a room");
                if ui_tx
                    .send(UiUpdate::Rejected {
                        reason: "join a room first".into(),
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
    }
    info!("command channel closed, session engine stopping");
    Ok(())
}

/// Local state of a joined session.
struct Active {
    session: RoomSession,
    data: LayerData,
    progress: Progress,
    players: BTreeMap<String, bool>,
    /// Last observed reset-trigger value. The initial subscription snapshot
    /// seeds it; only a subsequent *change* to a present value is treated as
    /// a reset broadcast (a pre-existing trigger must not wipe a resumed
    /// session).
    last_trigger: Option<Value>,
    trigger_seen: bool,
}

impl Active {
    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot::build(
            self.session.room_code(),
            self.session.player_name(),
            &self.players,
            &self.data,
            &self.progress,
        )
    }
}

async fn run_session(
    store: &Arc<dyn RemoteStore>,
    cmd_rx: &mut mpsc::Receiver<UserCommand>,
    ui_tx: &mpsc::Sender<UiUpdate>,
    outcome: JoinOutcome,
) -> SessionEnd {
    let JoinOutcome {
        session,
        streams,
        progress,
        data,
        players,
    } = outcome;
    let SessionStreams {
        data: mut data_sub,
        players: mut players_sub,
        reset: mut reset_sub,
    } = streams;

    let mut active = Active {
        session,
        data,
        progress,
        players,
        last_trigger: None,
        trigger_seen: false,
    };

    if ui_tx
        .send(UiUpdate::Joined(active.snapshot()))
        .await
        .is_err()
    {
        active.session.exit().await;
        return SessionEnd::Closed;
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Presentation layer is gone; leave cleanly.
                    active.session.exit().await;
                    return SessionEnd::Closed;
                };
                match handle_command(store, ui_tx, &mut active, cmd).await {
                    Some(end) => return end,
                    None => {}
                }
            }

            change = data_sub.recv() => {
                let Some(change) = change else {
                    warn!("data subscription ended, leaving the room");
                    active.session.exit().await;
                    let _ = ui_tx.send(UiUpdate::Left).await;
                    return SessionEnd::Left;
                };
                active.data = LayerData::from_value(change.value.as_ref());
                if push(ui_tx, &active).await.is_err() {
                    active.session.exit().await;
                    return SessionEnd::Closed;
                }
            }

            change = players_sub.recv() => {
                let Some(change) = change else {
                    warn!("players subscription ended, leaving the room");
                    active.session.exit().await;
                    let _ = ui_tx.send(UiUpdate::Left).await;
                    return SessionEnd::Left;
                };
                active.players = crate::room::session::parse_players(change.value.as_ref());
                // Membership changed: evaluate the room GC rule (the one
                // place it lives is room::session::gc_room).
                if online_count(&active.players) == 0 && !active.players.is_empty() {
                    gc_room(store, active.session.room_code()).await;
                }
                if push(ui_tx, &active).await.is_err() {
                    active.session.exit().await;
                    return SessionEnd::Closed;
                }
            }

            change = reset_sub.recv() => {
                let Some(change) = change else {
                    warn!("reset subscription ended, leaving the room");
                    active.session.exit().await;
                    let _ = ui_tx.send(UiUpdate::Left).await;
                    return SessionEnd::Left;
                };
                let is_reset = active.trigger_seen
                    && change.value.is_some()
                    && change.value != active.last_trigger;
                active.trigger_seen = true;
                active.last_trigger = change.value;
                if is_reset {
                    info!(
                        "reset detected in room {}, returning to layer 0",
                        active.session.room_code()
                    );
                    active.data.clear();
                    active.progress.reset();
                    if push(ui_tx, &active).await.is_err() {
                        active.session.exit().await;
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }
}

/// Apply one user command to the active session. Returns `Some` when the
/// session loop should end.
async fn handle_command(
    store: &Arc<dyn RemoteStore>,
    ui_tx: &mpsc::Sender<UiUpdate>,
    active: &mut Active,
    cmd: UserCommand,
) -> Option<SessionEnd> {
    match cmd {
        UserCommand::Pick { number } => {
            if !NUMBER_CHOICES.contains(&number) {
                return reject(ui_tx, format!("pick a number between 1 and 4, not {number}"))
                    .await;
            }
            let layer = active.progress.pointer();
            if layer >= NUM_LAYERS {
                debug!("pick ignored: all layers complete");
                return reject(ui_tx, "all layers are already complete".into()).await;
            }
            let me = active.session.player_name().to_string();
            if active.data.number_used_by_other(layer, &me, number) {
                return reject(
                    ui_tx,
                    format!("{number} is already taken at layer {}", layer + 1),
                )
                .await;
            }

            // Optimistic local update, then the narrow per-entry write. Only
            // this player's cell at this layer goes over the wire, so two
            // players writing concurrently cannot clobber each other.
            active.data.record(layer, &me, number);
            active.progress.advance();
            let path = paths::entry(active.session.room_code(), layer, &me);
            if let Err(e) = store.put(&path, json!(number)).await {
                warn!("pick write failed at `{path}`: {e}");
                if ui_tx
                    .send(UiUpdate::WriteFailed {
                        context: format!("recording your pick at layer {}", layer + 1),
                    })
                    .await
                    .is_err()
                {
                    return Some(SessionEnd::Closed);
                }
            }
        }

        UserCommand::Undo => {
            let Some(layer) = active.progress.retreat() else {
                debug!("undo ignored at layer 0");
                return reject(ui_tx, "already at the first layer".into()).await;
            };
            let me = active.session.player_name().to_string();
            if active.data.remove_entry(layer, &me) {
                let path = paths::entry(active.session.room_code(), layer, &me);
                if let Err(e) = store.remove(&path).await {
                    warn!("undo write failed at `{path}`: {e}");
                    if ui_tx
                        .send(UiUpdate::WriteFailed {
                            context: format!("undoing your pick at layer {}", layer + 1),
                        })
                        .await
                        .is_err()
                    {
                        return Some(SessionEnd::Closed);
                    }
                }
            }
        }

        UserCommand::Reset => {
            // Local clearing happens when the trigger change comes back
            // through the subscription, same as for every other session.
            if let Err(e) = reset::reset(store, active.session.room_code()).await {
                warn!("reset failed: {e}");
                if ui_tx
                    .send(UiUpdate::WriteFailed {
                        context: "resetting the room".into(),
                    })
                    .await
                    .is_err()
                {
                    return Some(SessionEnd::Closed);
                }
            }
            return None;
        }

        UserCommand::Exit => {
            active.session.exit().await;
            let _ = ui_tx.send(UiUpdate::Left).await;
            return Some(SessionEnd::Left);
        }

        UserCommand::Join { .. } => {
            return reject(ui_tx, "already in a room".into()).await;
        }
    }

    if push(ui_tx, active).await.is_err() {
        return Some(SessionEnd::Closed);
    }
    None
}

async fn push(ui_tx: &mpsc::Sender<UiUpdate>, active: &Active) -> Result<(), ()> {
    ui_tx
        .send(UiUpdate::Snapshot(active.snapshot()))
        .await
        .map_err(|_| ())
}

async fn reject(ui_tx: &mpsc::Sender<UiUpdate>, reason: String) -> Option<SessionEnd> {
    debug!("command rejected: {reason}");
    match ui_tx.send(UiUpdate::Rejected { reason }).await {
        Ok(()) => None,
        Err(_) => Some(SessionEnd::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(ui_rx: &mut mpsc::Receiver<UiUpdate>) -> UiUpdate {
        timeout(Duration::from_secs(1), ui_rx.recv())
            .await
            .expect("ui update within 1s")
            .expect("ui channel open")
    }

    /// Drain updates until the next snapshot-bearing one.
    async fn next_snapshot(ui_rx: &mut mpsc::Receiver<UiUpdate>) -> RoomSnapshot {
        loop {
            match recv(ui_rx).await {
                UiUpdate::Joined(s) | UiUpdate::Snapshot(s) => return s,
                _ => {}
            }
        }
    }

    fn spawn_engine(
        backend: &std::sync::Arc<MemoryBackend>,
    ) -> (mpsc::Sender<UserCommand>, mpsc::Receiver<UiUpdate>) {
        let store: Arc<dyn RemoteStore> = Arc::new(backend.connect());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ui_tx, ui_rx) = mpsc::channel(256);
        tokio::spawn(run(store, cmd_rx, ui_tx));
        (cmd_tx, ui_rx)
    }

    #[tokio::test]
    async fn join_pick_undo_flow() {
        let backend = MemoryBackend::new();
        let (cmd_tx, mut ui_rx) = spawn_engine(&backend);

        cmd_tx
            .send(UserCommand::Join {
                room_code: "ABC".into(),
                player_name: "Alice".into(),
            })
            .await
            .unwrap();
        let snap = next_snapshot(&mut ui_rx).await;
        assert_eq!(snap.pointer, 0);

        cmd_tx.send(UserCommand::Pick { number: 2 }).await.unwrap();
        let snap = next_snapshot(&mut ui_rx).await;
        assert_eq!(snap.pointer, 1);
        assert_eq!(snap.grid[0].get("Alice"), Some(&2));

        cmd_tx.send(UserCommand::Undo).await.unwrap();
        let snap = next_snapshot(&mut ui_rx).await;
        assert_eq!(snap.pointer, 0);
        assert!(snap.grid[0].is_empty());
    }

    #[tokio::test]
    async fn commands_outside_a_room_are_rejected() {
        let backend = MemoryBackend::new();
        let (cmd_tx, mut ui_rx) = spawn_engine(&backend);

        cmd_tx.send(UserCommand::Pick { number: 1 }).await.unwrap();
        assert!(matches!(recv(&mut ui_rx).await, UiUpdate::Rejected { .. }));
    }

    #[tokio::test]
    async fn join_failure_is_reported_and_engine_stays_up() {
        let backend = MemoryBackend::new();
        let (cmd_tx, mut ui_rx) = spawn_engine(&backend);

        cmd_tx
            .send(UserCommand::Join {
                room_code: "WAYTOOLONGCODE".into(),
                player_name: "Alice".into(),
            })
            .await
            .unwrap();
        assert!(matches!(recv(&mut ui_rx).await, UiUpdate::JoinFailed { .. }));

        cmd_tx
            .send(UserCommand::Join {
                room_code: "ABC".into(),
                player_name: "Alice".into(),
            })
            .await
            .unwrap();
        assert!(matches!(recv(&mut ui_rx).await, UiUpdate::Joined(_)));
    }

    #[tokio::test]
    async fn reset_returns_the_initiator_to_layer_zero() {
        let backend = MemoryBackend::new();
        let (cmd_tx, mut ui_rx) = spawn_engine(&backend);

        cmd_tx
            .send(UserCommand::Join {
                room_code: "ABC".into(),
                player_name: "Alice".into(),
            })
            .await
            .unwrap();
        next_snapshot(&mut ui_rx).await;

        cmd_tx.send(UserCommand::Pick { number: 3 }).await.unwrap();
        let snap = next_snapshot(&mut ui_rx).await;
        assert_eq!(snap.pointer, 1);

        cmd_tx.send(UserCommand::Reset).await.unwrap();
        // The trigger notification clears local progress.
        let snap = loop {
            let s = next_snapshot(&mut ui_rx).await;
            if s.pointer == 0 {
                break s;
            }
        };
        assert!(snap.grid.iter().all(|layer| layer.is_empty()));
        assert!(!snap.complete);
    }

    #[tokio::test]
    async fn remote_picks_from_another_player_arrive_as_snapshots() {
        let backend = MemoryBackend::new();
        let (cmd_tx, mut ui_rx) = spawn_engine(&backend);

        cmd_tx
            .send(UserCommand::Join {
                room_code: "ABC".into(),
                player_name: "Alice".into(),
            })
            .await
            .unwrap();
        next_snapshot(&mut ui_rx).await;

        // Bob writes directly through another connection.
        let bob: Arc<dyn RemoteStore> = Arc::new(backend.connect());
        bob.put("rooms/ABC/data/0/Bob", json!(1)).await.unwrap();

        let snap = loop {
            let s = next_snapshot(&mut ui_rx).await;
            if s.grid[0].get("Bob").is_some() {
                break s;
            }
        };
        assert_eq!(snap.grid[0].get("Bob"), Some(&1));
        // Alice's own pointer is untouched by Bob's pick.
        assert_eq!(snap.pointer, 0);
        assert_eq!(snap.disabled, std::collections::BTreeSet::from([1]));
    }
}
