use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rand::seq::SliceRandom;

use crate::persist::PersistHandle;
use crate::track::{RoomId, Track};

/// Bounded play history per room.
pub const DEFAULT_HISTORY_CAP: usize = 50;

#[derive(Default)]
struct RoomQueues {
    queue: VecDeque<Track>,
    history: VecDeque<Track>,
}

/// Per-room FIFO queue plus bounded history. Rooms are fully partitioned by
/// key; an absent room behaves as an empty one. Every mutation snapshots the
/// queue to the persistence writer without blocking the caller.
pub struct QueueService {
    rooms: Mutex<HashMap<RoomId, RoomQueues>>,
    persist: PersistHandle,
    history_cap: usize,
}

impl QueueService {
    pub fn new(persist: PersistHandle, history_cap: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            persist,
            history_cap,
        }
    }

    fn with_room<T>(&self, room: RoomId, f: impl FnOnce(&mut RoomQueues) -> T) -> T {
        let mut rooms = self.rooms.lock().expect("queue lock poisoned");
        f(rooms.entry(room).or_default())
    }

    fn persist_queue(&self, room: RoomId, q: &RoomQueues) {
        self.persist
            .save_queue(room, q.queue.iter().cloned().collect());
    }

    pub fn enqueue(&self, room: RoomId, track: Track) {
        self.with_room(room, |q| {
            q.queue.push_back(track);
            self.persist_queue(room, q);
        });
    }

    /// Appends a batch preserving order (playlist import).
    pub fn enqueue_many(&self, room: RoomId, tracks: Vec<Track>) {
        if tracks.is_empty() {
            return;
        }
        self.with_room(room, |q| {
            q.queue.extend(tracks);
            self.persist_queue(room, q);
        });
    }

    /// Head insert: "play this next", and the return path for "previous".
    pub fn push_front(&self, room: RoomId, track: Track) {
        self.with_room(room, |q| {
            q.queue.push_front(track);
            self.persist_queue(room, q);
        });
    }

    pub fn dequeue(&self, room: RoomId) -> Option<Track> {
        self.with_room(room, |q| {
            let track = q.queue.pop_front();
            if track.is_some() {
                self.persist_queue(room, q);
            }
            track
        })
    }

    pub fn peek(&self, room: RoomId) -> Option<Track> {
        self.with_room(room, |q| q.queue.front().cloned())
    }

    pub fn len(&self, room: RoomId) -> usize {
        self.with_room(room, |q| q.queue.len())
    }

    pub fn is_empty(&self, room: RoomId) -> bool {
        self.len(room) == 0
    }

    pub fn snapshot(&self, room: RoomId) -> Vec<Track> {
        self.with_room(room, |q| q.queue.iter().cloned().collect())
    }

    /// Uniform random permutation. No-op on queues shorter than two.
    pub fn shuffle(&self, room: RoomId) {
        self.with_room(room, |q| {
            if q.queue.len() > 1 {
                q.queue.make_contiguous().shuffle(&mut rand::rng());
                self.persist_queue(room, q);
            }
        });
    }

    /// Moves the track at `from` to `to`. Indices are 1-based as presented to
    /// users; 0 and out-of-range are declined with `None` and leave the queue
    /// untouched. A same-index move is a valid no-op returning the element.
    pub fn move_track(&self, room: RoomId, from: usize, to: usize) -> Option<Track> {
        self.with_room(room, |q| {
            let n = q.queue.len();
            if from == 0 || to == 0 || from > n || to > n {
                return None;
            }
            let (from, to) = (from - 1, to - 1);
            if from == to {
                return q.queue.get(from).cloned();
            }
            let track = q.queue.remove(from)?;
            q.queue.insert(to, track.clone());
            self.persist_queue(room, q);
            Some(track)
        })
    }

    /// Empties the queue. History is untouched.
    pub fn clear(&self, room: RoomId) {
        self.with_room(room, |q| {
            q.queue.clear();
            self.persist_queue(room, q);
        });
    }

    /// Appends a played track, evicting the oldest beyond the cap. Also mirrors
    /// the record into the durable history table.
    pub fn record_history(&self, room: RoomId, track: Track) {
        self.with_room(room, |q| {
            q.history.push_back(track.clone());
            while q.history.len() > self.history_cap {
                q.history.pop_front();
            }
        });
        self.persist.record_history(room, track);
    }

    /// Removes and returns the most recent history entry ("previous track").
    pub fn pop_last(&self, room: RoomId) -> Option<Track> {
        self.with_room(room, |q| q.history.pop_back())
    }

    pub fn history_snapshot(&self, room: RoomId) -> Vec<Track> {
        self.with_room(room, |q| q.history.iter().cloned().collect())
    }

    pub fn history_len(&self, room: RoomId) -> usize {
        self.with_room(room, |q| q.history.len())
    }

    /// Drops a room's in-memory queues entirely (room leave).
    pub fn remove_room(&self, room: RoomId) {
        self.rooms.lock().expect("queue lock poisoned").remove(&room);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> QueueService {
        QueueService::new(PersistHandle::disabled(), DEFAULT_HISTORY_CAP)
    }

    fn track(title: &str) -> Track {
        Track {
            title: title.to_string(),
            playable_url: format!("https://media.example/{title}"),
            canonical_url: format!("https://example.com/watch?v={title}"),
            duration: Some(60),
            thumbnail: None,
            requester_id: None,
        }
    }

    #[test]
    fn fifo_order() {
        let qs = service();
        for i in 0..5 {
            qs.enqueue(RoomId(1), track(&format!("t{i}")));
        }
        for i in 0..5 {
            assert_eq!(qs.dequeue(RoomId(1)).unwrap().title, format!("t{i}"));
        }
        assert_eq!(qs.dequeue(RoomId(1)), None);
    }

    #[test]
    fn dequeue_empty_room_is_none_not_error() {
        let qs = service();
        assert_eq!(qs.dequeue(RoomId(404)), None);
        assert_eq!(qs.peek(RoomId(404)), None);
        qs.clear(RoomId(404));
    }

    #[test]
    fn push_front_takes_priority() {
        let qs = service();
        qs.enqueue(RoomId(1), track("original"));
        qs.push_front(RoomId(1), track("priority"));
        assert_eq!(qs.dequeue(RoomId(1)).unwrap().title, "priority");
        assert_eq!(qs.dequeue(RoomId(1)).unwrap().title, "original");
    }

    #[test]
    fn enqueue_many_preserves_order() {
        let qs = service();
        qs.enqueue_many(RoomId(1), (0..4).map(|i| track(&format!("p{i}"))).collect());
        assert_eq!(qs.len(RoomId(1)), 4);
        assert_eq!(qs.peek(RoomId(1)).unwrap().title, "p0");
    }

    #[test]
    fn rooms_are_isolated() {
        let qs = service();
        qs.enqueue(RoomId(1), track("one"));
        qs.enqueue(RoomId(2), track("two"));
        let before = qs.snapshot(RoomId(2));

        qs.push_front(RoomId(1), track("front"));
        qs.shuffle(RoomId(1));
        qs.record_history(RoomId(1), track("played"));
        qs.clear(RoomId(1));

        assert_eq!(qs.snapshot(RoomId(2)), before);
        assert_eq!(qs.history_len(RoomId(2)), 0);
    }

    #[test]
    fn shuffle_preserves_elements() {
        let qs = service();
        qs.enqueue_many(RoomId(1), (0..20).map(|i| track(&format!("s{i}"))).collect());
        let mut before = qs.snapshot(RoomId(1));
        qs.shuffle(RoomId(1));
        let mut after = qs.snapshot(RoomId(1));
        assert_eq!(after.len(), 20);
        before.sort_by(|a, b| a.title.cmp(&b.title));
        after.sort_by(|a, b| a.title.cmp(&b.title));
        assert_eq!(before, after);
    }

    #[test]
    fn shuffle_single_element_is_noop() {
        let qs = service();
        qs.enqueue(RoomId(1), track("only"));
        qs.shuffle(RoomId(1));
        assert_eq!(qs.peek(RoomId(1)).unwrap().title, "only");
    }

    #[test]
    fn move_track_bounds() {
        let qs = service();
        qs.enqueue_many(RoomId(1), (0..3).map(|i| track(&format!("m{i}"))).collect());
        let before = qs.snapshot(RoomId(1));

        // Index 0 is reserved, out-of-range declined; queue unchanged.
        assert!(qs.move_track(RoomId(1), 0, 2).is_none());
        assert!(qs.move_track(RoomId(1), 2, 0).is_none());
        assert!(qs.move_track(RoomId(1), 1, 10).is_none());
        assert!(qs.move_track(RoomId(1), 10, 1).is_none());
        assert_eq!(qs.snapshot(RoomId(1)), before);

        // Same index returns the element without reordering.
        assert_eq!(qs.move_track(RoomId(1), 2, 2).unwrap().title, "m1");
        assert_eq!(qs.snapshot(RoomId(1)), before);
    }

    #[test]
    fn move_track_reorders() {
        let qs = service();
        qs.enqueue_many(RoomId(1), (0..5).map(|i| track(&format!("m{i}"))).collect());

        let moved = qs.move_track(RoomId(1), 5, 1).unwrap();
        assert_eq!(moved.title, "m4");
        assert_eq!(qs.peek(RoomId(1)).unwrap().title, "m4");

        let moved = qs.move_track(RoomId(1), 1, 5).unwrap();
        assert_eq!(moved.title, "m4");
        let snap = qs.snapshot(RoomId(1));
        assert_eq!(snap.last().unwrap().title, "m4");
    }

    #[test]
    fn move_track_empty_queue() {
        let qs = service();
        assert!(qs.move_track(RoomId(1), 1, 2).is_none());
    }

    #[test]
    fn history_cap_evicts_oldest() {
        let qs = service();
        let cap = DEFAULT_HISTORY_CAP;
        for i in 0..(cap + 20) {
            qs.record_history(RoomId(1), track(&format!("h{i}")));
        }
        assert_eq!(qs.history_len(RoomId(1)), cap);
        // Most recent retained; the 20 oldest evicted.
        assert_eq!(qs.pop_last(RoomId(1)).unwrap().title, format!("h{}", cap + 19));
        let mut oldest = None;
        while let Some(t) = qs.pop_last(RoomId(1)) {
            oldest = Some(t);
        }
        assert_eq!(oldest.unwrap().title, "h20");
    }

    #[test]
    fn pop_last_consumes() {
        let qs = service();
        qs.record_history(RoomId(1), track("first"));
        qs.record_history(RoomId(1), track("last"));
        assert_eq!(qs.pop_last(RoomId(1)).unwrap().title, "last");
        assert_eq!(qs.pop_last(RoomId(1)).unwrap().title, "first");
        assert_eq!(qs.pop_last(RoomId(1)), None);
    }

    #[test]
    fn clear_leaves_history() {
        let qs = service();
        qs.enqueue(RoomId(1), track("queued"));
        qs.record_history(RoomId(1), track("played"));
        qs.clear(RoomId(1));
        assert!(qs.is_empty(RoomId(1)));
        assert_eq!(qs.history_len(RoomId(1)), 1);
    }
}
