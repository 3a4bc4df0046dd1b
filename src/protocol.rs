// Types exchanged between the session engine and the presentation layer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::room::progress::{LayerData, Progress};

// ---------------------------------------------------------------------------
// Commands (presentation layer -> engine)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserCommand {
    Join { room_code: String, player_name: String },
    Pick { number: u8 },
    Undo,
    Reset,
    Exit,
}

// ---------------------------------------------------------------------------
// Updates (engine -> presentation layer)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    /// Join succeeded; the snapshot carries the (possibly resumed) state.
    Joined(RoomSnapshot),
    /// Any state change after joining: a pick, an undo, a remote update,
    /// a reset, a membership change.
    Snapshot(RoomSnapshot),
    /// Join was refused; the session is not established.
    JoinFailed { reason: String },
    /// A local action was applied but its remote write failed. Local state
    /// is kept as-is (last-known-good); the user should be informed that
    /// the room may be out of sync.
    WriteFailed { context: String },
    /// A command was ignored (picking a taken number, undo at layer 0, ...).
    Rejected { reason: String },
    /// The session ended.
    Left,
}

/// One player row in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub name: String,
    pub online: bool,
}

/// Everything the presentation layer needs to render a joined room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_code: String,
    pub player_name: String,
    pub players: Vec<PlayerEntry>,
    /// One map per layer (player name -> picked number), dense over all
    /// layers.
    pub grid: Vec<BTreeMap<String, u8>>,
    /// Current layer pointer for this session, in `[0, NUM_LAYERS]`.
    pub pointer: usize,
    pub complete: bool,
    /// Numbers already taken at the current layer (empty once complete).
    pub disabled: BTreeSet<u8>,
    /// Highlight hint: the single remaining number at the current layer.
    pub hint: Option<u8>,
}

impl RoomSnapshot {
    /// Assemble a snapshot from the session's local state.
    pub fn build(
        room_code: &str,
        player_name: &str,
        players: &BTreeMap<String, bool>,
        data: &LayerData,
        progress: &Progress,
    ) -> Self {
        let (disabled, hint) = if progress.pointer() < crate::room::NUM_LAYERS {
            (
                data.disabled_numbers(progress.pointer()),
                data.available_number(progress.pointer()),
            )
        } else {
            (BTreeSet::new(), None)
        };
        RoomSnapshot {
            room_code: room_code.to_string(),
            player_name: player_name.to_string(),
            players: players
                .iter()
                .map(|(name, online)| PlayerEntry {
                    name: name.clone(),
                    online: *online,
                })
                .collect(),
            grid: data.grid(),
            pointer: progress.pointer(),
            complete: progress.complete(),
            disabled,
            hint,
        }
    }
}
