// Room domain logic: layer progress engine, session lifecycle, reset
// coordination, and the store path schema shared by all three.

pub mod progress;
pub mod reset;
pub mod session;

pub use progress::{LayerData, Progress, NUMBER_CHOICES, NUM_LAYERS};
pub use session::{JoinOutcome, RoomSession, SessionError};

/// Store path schema. Everything a room owns lives under `rooms/{code}` so
/// deleting that one path tears down players, layer data, and the reset
/// trigger together.
pub mod paths {
    pub fn room(code: &str) -> String {
        format!("rooms/{code}")
    }

    pub fn players(code: &str) -> String {
        format!("rooms/{code}/players")
    }

    pub fn player(code: &str, name: &str) -> String {
        format!("rooms/{code}/players/{name}")
    }

    pub fn data(code: &str) -> String {
        format!("rooms/{code}/data")
    }

    pub fn entry(code: &str, layer: usize, name: &str) -> String {
        format!("rooms/{code}/data/{layer}/{name}")
    }

    pub fn reset_trigger(code: &str) -> String {
        format!("rooms/{code}/resetTrigger")
    }
}
