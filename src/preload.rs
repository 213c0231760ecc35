use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PlayerError, Result};
use crate::resolver::TrackResolver;
use crate::source::{AudioSource, SourceOpener};
use crate::track::{RoomId, Track};

/// An opened, not-yet-attached pipeline bound to one track. Consumed exactly
/// once or explicitly closed; dropping it unconsumed still reaps the
/// subprocesses via kill-on-drop, but closing is the polite path.
pub struct PreparedSource {
    pub track: Track,
    pub source: Box<dyn AudioSource>,
}

/// Fresh resolve + open for one queued track. Resolution re-runs against the
/// canonical URL because the stored playable URL may have expired.
pub async fn materialize(
    resolver: &dyn TrackResolver,
    opener: &dyn SourceOpener,
    track: &Track,
) -> Result<PreparedSource> {
    let mut resolved = resolver.resolve(&track.canonical_url).await?;
    if resolved.is_empty() {
        return Err(PlayerError::resolution(&track.canonical_url, "no results"));
    }
    let fresh = resolved.swap_remove(0).with_requester(track.requester_id);
    let source = opener.open(&fresh).await?;
    Ok(PreparedSource {
        track: track.clone(),
        source,
    })
}

struct Slot {
    epoch: u64,
    state: SlotState,
}

enum SlotState {
    InFlight(JoinHandle<()>),
    Ready(PreparedSource),
}

#[derive(Default)]
struct Slots {
    map: HashMap<RoomId, Slot>,
    epochs: HashMap<RoomId, u64>,
}

/// Eagerly prepares the next queued track while the current one plays. At
/// most one outstanding preload per room; failures are swallowed — the
/// synchronous open path is always the fallback.
pub struct Preloader {
    resolver: Arc<dyn TrackResolver>,
    opener: Arc<dyn SourceOpener>,
    slots: Arc<Mutex<Slots>>,
}

impl Preloader {
    pub fn new(resolver: Arc<dyn TrackResolver>, opener: Arc<dyn SourceOpener>) -> Self {
        Self {
            resolver,
            opener,
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// Starts a background prepare for `track` unless one is already in
    /// flight or cached for this room.
    pub fn kick(&self, room: RoomId, track: Track) {
        let mut slots = self.slots.lock().expect("preload lock poisoned");
        if slots.map.contains_key(&room) {
            return;
        }
        let epoch = {
            let e = slots.epochs.entry(room).or_default();
            *e += 1;
            *e
        };

        let resolver = self.resolver.clone();
        let opener = self.opener.clone();
        let shared = self.slots.clone();
        let handle = tokio::spawn(async move {
            let outcome = materialize(&*resolver, &*opener, &track).await;
            let mut slots = shared.lock().expect("preload lock poisoned");
            let still_wanted = matches!(
                slots.map.get(&room),
                Some(slot) if slot.epoch == epoch
            );
            match outcome {
                Ok(prepared) if still_wanted => {
                    debug!(%room, title = %prepared.track.title, "preload ready");
                    slots.map.insert(
                        room,
                        Slot {
                            epoch,
                            state: SlotState::Ready(prepared),
                        },
                    );
                }
                Ok(prepared) => {
                    drop(slots);
                    discard(prepared);
                }
                Err(e) => {
                    warn!(%room, title = %track.title, "preload failed: {e}");
                    if still_wanted {
                        slots.map.remove(&room);
                    }
                }
            }
        });

        slots.map.insert(
            room,
            Slot {
                epoch,
                state: SlotState::InFlight(handle),
            },
        );
    }

    /// Consumes the cached source if it matches the queue head; anything else
    /// (mismatch, still in flight) is discarded so the caller opens fresh.
    pub fn take_if_match(&self, room: RoomId, head: &Track) -> Option<PreparedSource> {
        let mut slots = self.slots.lock().expect("preload lock poisoned");
        match slots.map.remove(&room) {
            Some(Slot {
                state: SlotState::Ready(prepared),
                ..
            }) if prepared.track.canonical_url == head.canonical_url => Some(prepared),
            Some(Slot {
                state: SlotState::Ready(stale),
                ..
            }) => {
                debug!(%room, title = %stale.track.title, "discarding stale preload");
                drop(slots);
                discard(stale);
                None
            }
            Some(Slot {
                state: SlotState::InFlight(handle),
                ..
            }) => {
                handle.abort();
                None
            }
            None => None,
        }
    }

    /// Drops whatever is cached or in flight for the room (skip, clear, stop,
    /// leave). The epoch counter goes with it; a completion racing onto a
    /// reused epoch is still rejected by the head match in `take_if_match`.
    pub fn invalidate(&self, room: RoomId) {
        let mut slots = self.slots.lock().expect("preload lock poisoned");
        slots.epochs.remove(&room);
        match slots.map.remove(&room) {
            Some(Slot {
                state: SlotState::Ready(stale),
                ..
            }) => {
                drop(slots);
                discard(stale);
            }
            Some(Slot {
                state: SlotState::InFlight(handle),
                ..
            }) => handle.abort(),
            None => {}
        }
    }
}

fn discard(mut prepared: PreparedSource) {
    tokio::spawn(async move {
        prepared.source.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

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

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TrackResolver for CountingResolver {
        async fn resolve(&self, query: &str) -> Result<Vec<Track>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.contains("broken") {
                return Err(PlayerError::resolution(query, "no results"));
            }
            let title = query.rsplit('=').next().unwrap_or("hit");
            Ok(vec![track(title)])
        }

        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<Track>> {
            self.resolve(query).await
        }
    }

    struct NullSource {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AudioSource for NullSource {
        fn title(&self) -> &str {
            "null"
        }
        async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct CountingOpener {
        opens: AtomicUsize,
        last_closed: Mutex<Option<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl SourceOpener for CountingOpener {
        async fn open(&self, _track: &Track) -> Result<Box<dyn AudioSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let closed = Arc::new(AtomicBool::new(false));
            *self.last_closed.lock().unwrap() = Some(closed.clone());
            Ok(Box::new(NullSource { closed }))
        }
    }

    fn preloader() -> (Arc<Preloader>, Arc<CountingResolver>, Arc<CountingOpener>) {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let opener = Arc::new(CountingOpener {
            opens: AtomicUsize::new(0),
            last_closed: Mutex::new(None),
        });
        let p = Arc::new(Preloader::new(resolver.clone(), opener.clone()));
        (p, resolver, opener)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn preload_is_consumed_on_match() {
        let (p, resolver, opener) = preloader();
        let t = track("next");
        p.kick(RoomId(1), t.clone());
        settle().await;

        let prepared = p.take_if_match(RoomId(1), &t).expect("ready");
        assert_eq!(prepared.track.canonical_url, t.canonical_url);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);

        // Consumed exactly once.
        assert!(p.take_if_match(RoomId(1), &t).is_none());
    }

    #[tokio::test]
    async fn only_one_preload_in_flight_per_room() {
        let (p, resolver, _opener) = preloader();
        let t = track("next");
        p.kick(RoomId(1), t.clone());
        p.kick(RoomId(1), t.clone());
        p.kick(RoomId(1), t.clone());
        settle().await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatch_is_discarded_and_closed() {
        let (p, _resolver, opener) = preloader();
        p.kick(RoomId(1), track("stale"));
        settle().await;

        let other = track("other");
        assert!(p.take_if_match(RoomId(1), &other).is_none());
        settle().await;

        let closed = opener.last_closed.lock().unwrap().clone().unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_preload_clears_the_slot() {
        let (p, resolver, _opener) = preloader();
        let mut bad = track("x");
        bad.canonical_url = "https://example.com/watch?v=broken".to_string();
        p.kick(RoomId(1), bad.clone());
        settle().await;

        assert!(p.take_if_match(RoomId(1), &bad).is_none());
        // Slot is free again for the next kick.
        p.kick(RoomId(1), track("fine"));
        settle().await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_drops_ready_source() {
        let (p, _resolver, opener) = preloader();
        let t = track("next");
        p.kick(RoomId(1), t.clone());
        settle().await;

        p.invalidate(RoomId(1));
        settle().await;
        let closed = opener.last_closed.lock().unwrap().clone().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert!(p.take_if_match(RoomId(1), &t).is_none());
    }

    #[tokio::test]
    async fn invalidate_forgets_the_room_entirely() {
        let (p, _resolver, _opener) = preloader();
        p.kick(RoomId(1), track("next"));
        settle().await;

        p.invalidate(RoomId(1));
        let slots = p.slots.lock().unwrap();
        assert!(slots.map.is_empty());
        assert!(slots.epochs.is_empty());
    }

    #[tokio::test]
    async fn rooms_preload_independently() {
        let (p, resolver, _opener) = preloader();
        let a = track("a");
        let b = track("b");
        p.kick(RoomId(1), a.clone());
        p.kick(RoomId(2), b.clone());
        settle().await;

        assert!(p.take_if_match(RoomId(1), &a).is_some());
        assert!(p.take_if_match(RoomId(2), &b).is_some());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }
}
