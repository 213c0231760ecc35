use std::collections::HashMap;
use std::sync::Mutex;

use crate::sink::PlaybackHandle;
use crate::track::{RoomId, Track};

/// Live state of one voice room. Queue and history live in the queue service;
/// the session carries what the controller needs to drive playback.
pub struct RoomSession {
    pub current: Option<Track>,
    pub playback: Option<PlaybackHandle>,
    pub is_paused: bool,
    /// Guards against concurrent queue advancement for the same room.
    pub advancing: bool,
    pub volume: f32,
    pub voice_channel: Option<u64>,
    pub notify_channel: Option<u64>,
    /// Bumped whenever the room stops being idle; a pending idle-disconnect
    /// timer only fires if the epoch it captured is still current.
    pub idle_epoch: u64,
    /// Bumped per attached driver; completion events from an older generation
    /// are stale and must not touch the session.
    pub playback_gen: u64,
}

impl Default for RoomSession {
    fn default() -> Self {
        Self {
            current: None,
            playback: None,
            is_paused: false,
            advancing: false,
            volume: 1.0,
            voice_channel: None,
            notify_channel: None,
            idle_epoch: 0,
            playback_gen: 0,
        }
    }
}

/// Owns every room's session, partitioned by room key. An absent room behaves
/// as idle and empty; `with` creates it on first touch.
///
/// The lock is only ever held for the duration of the closure — callers take
/// handles out of the session before awaiting on them.
#[derive(Default)]
pub struct RoomSessionStore {
    rooms: Mutex<HashMap<RoomId, RoomSession>>,
}

impl RoomSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T>(&self, room: RoomId, f: impl FnOnce(&mut RoomSession) -> T) -> T {
        let mut rooms = self.rooms.lock().expect("session lock poisoned");
        f(rooms.entry(room).or_default())
    }

    /// Read-only view that does not materialize absent rooms; `None` when the
    /// room has no session.
    pub fn peek<T>(&self, room: RoomId, f: impl FnOnce(&RoomSession) -> T) -> Option<T> {
        let rooms = self.rooms.lock().expect("session lock poisoned");
        rooms.get(&room).map(f)
    }

    /// Drops the room's session entirely. Returns it so the caller can close
    /// whatever playback was still attached.
    pub fn remove(&self, room: RoomId) -> Option<RoomSession> {
        self.rooms.lock().expect("session lock poisoned").remove(&room)
    }

    pub fn contains(&self, room: RoomId) -> bool {
        self.rooms.lock().expect("session lock poisoned").contains_key(&room)
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms
            .lock()
            .expect("session lock poisoned")
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_room_is_idle_and_empty() {
        let store = RoomSessionStore::new();
        assert!(!store.contains(RoomId(1)));
        let playing = store.with(RoomId(1), |s| s.playback.is_some());
        assert!(!playing);
        // `with` materialized it.
        assert!(store.contains(RoomId(1)));
    }

    #[test]
    fn sessions_are_isolated() {
        let store = RoomSessionStore::new();
        store.with(RoomId(1), |s| {
            s.is_paused = true;
            s.volume = 0.5;
        });
        store.with(RoomId(2), |s| {
            assert!(!s.is_paused);
            assert_eq!(s.volume, 1.0);
        });
    }

    #[test]
    fn peek_does_not_materialize() {
        let store = RoomSessionStore::new();
        assert!(store.peek(RoomId(1), |s| s.idle_epoch).is_none());
        assert!(!store.contains(RoomId(1)));

        store.with(RoomId(1), |s| s.idle_epoch = 3);
        assert_eq!(store.peek(RoomId(1), |s| s.idle_epoch), Some(3));
    }

    #[test]
    fn remove_clears_state() {
        let store = RoomSessionStore::new();
        store.with(RoomId(1), |s| s.idle_epoch = 9);
        let removed = store.remove(RoomId(1)).unwrap();
        assert_eq!(removed.idle_epoch, 9);
        assert!(!store.contains(RoomId(1)));
        store.with(RoomId(1), |s| assert_eq!(s.idle_epoch, 0));
    }
}
