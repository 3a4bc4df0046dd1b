// Layer progress engine: the per-layer pick table and the per-session
// pointer state machine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Number of layers in a game.
pub const NUM_LAYERS: usize = 10;

/// The numbers a player may pick on each layer.
pub const NUMBER_CHOICES: [u8; 4] = [1, 2, 3, 4];

// ---------------------------------------------------------------------------
// Layer data
// ---------------------------------------------------------------------------

/// All recorded picks of a room: layer index -> (player name -> number).
///
/// Serializes to the store's JSON shape (`{"0": {"Alice": 2}, ...}`); layer
/// keys are strings on the wire since JSON object keys always are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerData(pub BTreeMap<usize, BTreeMap<String, u8>>);

impl LayerData {
    /// Parse the value read from the room's `data` path. Absent values mean
    /// an empty table; entries that don't fit the schema are dropped with a
    /// warning rather than failing the whole sync.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return LayerData::default();
        };
        let Some(layers) = value.as_object() else {
            warn!("layer data is not an object, treating as empty");
            return LayerData::default();
        };

        let mut out = BTreeMap::new();
        for (key, picks) in layers {
            let Ok(layer) = key.parse::<usize>() else {
                warn!("ignoring non-numeric layer key `{key}`");
                continue;
            };
            if layer >= NUM_LAYERS {
                warn!("ignoring out-of-range layer {layer}");
                continue;
            }
            let Some(picks) = picks.as_object() else {
                warn!("ignoring malformed picks at layer {layer}");
                continue;
            };
            let mut layer_map = BTreeMap::new();
            for (player, number) in picks {
                match number.as_u64() {
                    Some(n) if NUMBER_CHOICES.contains(&(n as u8)) => {
                        layer_map.insert(player.clone(), n as u8);
                    }
                    _ => warn!("ignoring invalid pick {number} for `{player}` at layer {layer}"),
                }
            }
            if !layer_map.is_empty() {
                out.insert(layer, layer_map);
            }
        }
        LayerData(out)
    }

    /// Record `player`'s pick at `layer`.
    pub fn record(&mut self, layer: usize, player: &str, number: u8) {
        self.0
            .entry(layer)
            .or_default()
            .insert(player.to_string(), number);
    }

    /// Remove `player`'s pick at `layer`. Returns whether an entry existed.
    pub fn remove_entry(&mut self, layer: usize, player: &str) -> bool {
        let Some(picks) = self.0.get_mut(&layer) else {
            return false;
        };
        let removed = picks.remove(player).is_some();
        if picks.is_empty() {
            self.0.remove(&layer);
        }
        removed
    }

    /// Remove `player`'s picks from every layer, returning the layers that
    /// actually held one.
    pub fn strip_player(&mut self, player: &str) -> Vec<usize> {
        let layers: Vec<usize> = self
            .0
            .iter()
            .filter(|(_, picks)| picks.contains_key(player))
            .map(|(layer, _)| *layer)
            .collect();
        for layer in &layers {
            self.remove_entry(*layer, player);
        }
        layers
    }

    /// Clear all picks.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Numbers already chosen by any player at `layer`. Derived, not stored.
    pub fn disabled_numbers(&self, layer: usize) -> BTreeSet<u8> {
        self.0
            .get(&layer)
            .map(|picks| picks.values().copied().collect())
            .unwrap_or_default()
    }

    /// If exactly one of the four numbers remains unused at `layer`, return
    /// it. Purely a UI highlight hint, not an enforcement mechanism.
    pub fn available_number(&self, layer: usize) -> Option<u8> {
        let used = self.disabled_numbers(layer);
        let mut free = NUMBER_CHOICES.iter().filter(|n| !used.contains(n));
        match (free.next(), free.next()) {
            (Some(&n), None) => Some(n),
            _ => None,
        }
    }

    /// Whether `number` is already held by a player other than `player` at
    /// `layer`. Advisory only; the store never re-validates.
    pub fn number_used_by_other(&self, layer: usize, player: &str, number: u8) -> bool {
        self.0
            .get(&layer)
            .is_some_and(|picks| picks.iter().any(|(p, &n)| n == number && p != player))
    }

    /// The highest layer containing a pick by `player`, if any. Linear scan
    /// over the fixed-size layer sequence; used to resume a reconnecting
    /// player's pointer.
    pub fn last_layer_of(&self, player: &str) -> Option<usize> {
        self.0
            .iter()
            .rev()
            .find(|(_, picks)| picks.contains_key(player))
            .map(|(layer, _)| *layer)
    }

    /// Dense per-layer view for snapshots: one map per layer, empty where no
    /// picks exist.
    pub fn grid(&self) -> Vec<BTreeMap<String, u8>> {
        (0..NUM_LAYERS)
            .map(|layer| self.0.get(&layer).cloned().unwrap_or_default())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Pointer state machine
// ---------------------------------------------------------------------------

/// A session's position in the layer sequence: `pointer` in `[0, NUM_LAYERS]`
/// plus the local-only completion flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pointer: usize,
    complete: bool,
}

impl Progress {
    /// Resume position for a reconnecting player: one past the last layer
    /// holding their pick, or 0 if they have none.
    pub fn resume(data: &LayerData, player: &str) -> Self {
        let pointer = data.last_layer_of(player).map(|l| l + 1).unwrap_or(0);
        Progress {
            pointer,
            complete: pointer == NUM_LAYERS,
        }
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    /// Advance after a valid pick. Returns false (and stays put) when every
    /// layer is already done.
    pub fn advance(&mut self) -> bool {
        if self.pointer >= NUM_LAYERS {
            return false;
        }
        self.pointer += 1;
        if self.pointer == NUM_LAYERS {
            self.complete = true;
        }
        true
    }

    /// Step back one layer, returning the layer index now uncovered. `None`
    /// (and no movement) at layer 0.
    pub fn retreat(&mut self) -> Option<usize> {
        if self.pointer == 0 {
            return None;
        }
        self.pointer -= 1;
        self.complete = false;
        Some(self.pointer)
    }

    /// Back to layer 0 with the completion flag cleared.
    pub fn reset(&mut self) {
        *self = Progress::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pointer_replay_clamps_to_bounds() {
        // Net displacement of any pick/undo sequence, clamped to [0, 10].
        let sequences: Vec<&[i8]> = vec![
            &[1, 1, 1],
            &[1, -1, 1, -1],
            &[-1, -1, 1],
            &[1; 15],
            &[1, 1, -1, -1, -1, 1],
        ];
        for seq in sequences {
            let mut p = Progress::default();
            let mut expected: i64 = 0;
            for step in seq {
                if *step > 0 {
                    p.advance();
                    expected = (expected + 1).min(NUM_LAYERS as i64);
                } else {
                    p.retreat();
                    expected = (expected - 1).max(0);
                }
            }
            assert_eq!(p.pointer() as i64, expected);
        }
    }

    #[test]
    fn advance_at_cap_and_retreat_at_zero_are_noops() {
        let mut p = Progress::default();
        assert_eq!(p.retreat(), None);
        for _ in 0..NUM_LAYERS {
            assert!(p.advance());
        }
        assert!(p.complete());
        assert!(!p.advance());
        assert_eq!(p.pointer(), NUM_LAYERS);
    }

    #[test]
    fn completing_the_last_layer_sets_the_flag_and_undo_clears_it() {
        let mut p = Progress::default();
        for _ in 0..NUM_LAYERS {
            p.advance();
        }
        assert!(p.complete());
        assert_eq!(p.retreat(), Some(NUM_LAYERS - 1));
        assert!(!p.complete());
    }

    #[test]
    fn resume_points_one_past_the_last_pick() {
        let mut data = LayerData::default();
        assert_eq!(Progress::resume(&data, "Alice").pointer(), 0);

        data.record(0, "Alice", 2);
        data.record(1, "Alice", 3);
        data.record(4, "Alice", 1);
        data.record(6, "Bob", 1);
        let p = Progress::resume(&data, "Alice");
        assert_eq!(p.pointer(), 5);
        assert!(!p.complete());
    }

    #[test]
    fn resume_after_finishing_all_layers_is_complete() {
        let mut data = LayerData::default();
        for layer in 0..NUM_LAYERS {
            data.record(layer, "Alice", 1);
        }
        let p = Progress::resume(&data, "Alice");
        assert_eq!(p.pointer(), NUM_LAYERS);
        assert!(p.complete());
    }

    #[test]
    fn disabled_numbers_reflect_all_players_at_a_layer() {
        let mut data = LayerData::default();
        data.record(0, "Alice", 2);
        data.record(0, "Bob", 4);
        data.record(1, "Alice", 1);
        assert_eq!(
            data.disabled_numbers(0),
            BTreeSet::from([2, 4])
        );
        assert_eq!(data.disabled_numbers(1), BTreeSet::from([1]));
        assert!(data.disabled_numbers(5).is_empty());
    }

    #[test]
    fn available_number_only_when_exactly_one_remains() {
        let mut data = LayerData::default();
        data.record(0, "A", 1);
        data.record(0, "B", 2);
        assert_eq!(data.available_number(0), None);
        data.record(0, "C", 3);
        assert_eq!(data.available_number(0), Some(4));
        data.record(0, "D", 4);
        assert_eq!(data.available_number(0), None);
    }

    #[test]
    fn number_used_by_other_ignores_own_pick() {
        let mut data = LayerData::default();
        data.record(0, "Alice", 2);
        assert!(data.number_used_by_other(0, "Bob", 2));
        assert!(!data.number_used_by_other(0, "Alice", 2));
        assert!(!data.number_used_by_other(0, "Bob", 3));
    }

    #[test]
    fn strip_player_removes_every_layer_entry() {
        let mut data = LayerData::default();
        data.record(0, "Alice", 2);
        data.record(3, "Alice", 1);
        data.record(3, "Bob", 4);
        let touched = data.strip_player("Alice");
        assert_eq!(touched, vec![0, 3]);
        assert_eq!(data.last_layer_of("Alice"), None);
        assert_eq!(data.disabled_numbers(3), BTreeSet::from([4]));
        // Layer 0 emptied out entirely.
        assert!(data.0.get(&0).is_none());
    }

    #[test]
    fn from_value_parses_the_wire_shape_and_drops_junk() {
        let value = json!({
            "0": {"Alice": 2, "Bob": 1},
            "3": {"Alice": 9},          // out-of-domain number dropped
            "bogus": {"X": 1},          // non-numeric layer key dropped
            "12": {"Y": 2},             // out-of-range layer dropped
        });
        let data = LayerData::from_value(Some(&value));
        assert_eq!(data.disabled_numbers(0), BTreeSet::from([1, 2]));
        assert!(data.0.get(&3).is_none());
        assert_eq!(data.0.len(), 1);

        assert_eq!(LayerData::from_value(None), LayerData::default());
    }

    #[test]
    fn serializes_layer_keys_as_strings() {
        let mut data = LayerData::default();
        data.record(0, "Alice", 2);
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value, json!({"0": {"Alice": 2}}));
        let back: LayerData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }
}
