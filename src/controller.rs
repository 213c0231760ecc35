use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PlayerError, Result};
use crate::persist::{PersistHandle, RoomStateSnapshot, Store};
use crate::preload::{Preloader, materialize};
use crate::queue::QueueService;
use crate::resolver::TrackResolver;
use crate::session::RoomSessionStore;
use crate::sink::{CancelKind, PlayerEvent, VoiceSink, spawn_driver};
use crate::source::SourceOpener;
use crate::track::{RoomId, Track};

/// Voice-platform boundary: connection lifecycle plus sink handout. The chat
/// platform's transport lives behind this.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn connect(&self, room: RoomId, channel: u64) -> Result<()>;
    async fn disconnect(&self, room: RoomId);
    fn is_connected(&self, room: RoomId) -> bool;
    fn open_sink(&self, room: RoomId) -> Box<dyn VoiceSink>;
    /// Whether the room still exists on the platform (startup recovery).
    async fn room_exists(&self, room: RoomId) -> bool;
    /// Whether the channel still has at least one non-bot occupant.
    async fn channel_has_listeners(&self, room: RoomId, channel: u64) -> bool;
}

/// User-facing notices the core must trigger; rendering is out of scope.
pub trait Notifier: Send + Sync {
    fn track_failed(&self, room: RoomId, title: &str, reason: &str);
    fn resumed(&self, room: RoomId, title: &str);
}

/// Drives every room's playback state machine: Idle → Playing ⇄ Paused →
/// Idle. All completion events funnel through one task, so queue advancement
/// for a given room is never re-entered concurrently.
pub struct PlayerController {
    /// Self-handle for background tasks (idle timers).
    me: Weak<PlayerController>,
    sessions: RoomSessionStore,
    queues: Arc<QueueService>,
    resolver: Arc<dyn TrackResolver>,
    opener: Arc<dyn SourceOpener>,
    gateway: Arc<dyn VoiceGateway>,
    notifier: Arc<dyn Notifier>,
    preloader: Arc<Preloader>,
    persist: PersistHandle,
    store: Option<Store>,
    events_tx: mpsc::UnboundedSender<PlayerEvent>,
    idle_timeout: Duration,
}

impl PlayerController {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        queues: Arc<QueueService>,
        resolver: Arc<dyn TrackResolver>,
        opener: Arc<dyn SourceOpener>,
        gateway: Arc<dyn VoiceGateway>,
        notifier: Arc<dyn Notifier>,
        persist: PersistHandle,
        store: Option<Store>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let preloader = Arc::new(Preloader::new(resolver.clone(), opener.clone()));
        let controller = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sessions: RoomSessionStore::new(),
            queues,
            resolver,
            opener,
            gateway,
            notifier,
            preloader,
            persist,
            store,
            events_tx,
            idle_timeout,
        });

        let this = controller.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PlayerEvent::TrackEnded {
                        room,
                        track,
                        generation,
                        error,
                    } => {
                        this.handle_track_ended(room, track, generation, error).await;
                    }
                }
            }
        });

        controller
    }

    pub async fn connect(
        &self,
        room: RoomId,
        voice_channel: u64,
        notify_channel: Option<u64>,
    ) -> Result<()> {
        self.gateway.connect(room, voice_channel).await?;
        self.sessions.with(room, |s| {
            s.voice_channel = Some(voice_channel);
            s.notify_channel = notify_channel;
        });
        Ok(())
    }

    /// Resolves a query, queues the result, and starts playback if the room
    /// is idle. Returns what was queued.
    pub async fn play(
        &self,
        room: RoomId,
        query: &str,
        requester: Option<u64>,
    ) -> Result<Vec<Track>> {
        let tracks: Vec<Track> = self
            .resolver
            .resolve(query)
            .await?
            .into_iter()
            .map(|t| t.with_requester(requester))
            .collect();
        self.queues.enqueue_many(room, tracks.clone());
        self.play_next(room).await?;

        // If something is already playing, warm up the new head.
        if self.sessions.with(room, |s| s.playback.is_some())
            && let Some(head) = self.queues.peek(room)
        {
            self.preloader.kick(room, head);
        }
        Ok(tracks)
    }

    /// Advances to the next queued track. No-op while something plays or an
    /// advance is already underway.
    pub async fn play_next(&self, room: RoomId) -> Result<()> {
        let claimed = self.sessions.with(room, |s| {
            if s.playback.is_some() || s.advancing {
                false
            } else {
                s.advancing = true;
                true
            }
        });
        if !claimed {
            return Ok(());
        }
        let result = self.advance(room).await;
        self.sessions.with(room, |s| s.advancing = false);
        result
    }

    async fn advance(&self, room: RoomId) -> Result<()> {
        // Each failed open consumes one queue item, so this loop is bounded
        // by queue length; an entirely bad queue drains to idle.
        loop {
            let Some(track) = self.queues.dequeue(room) else {
                let epoch = self.sessions.with(room, |s| {
                    s.current = None;
                    s.is_paused = false;
                    s.idle_epoch += 1;
                    s.idle_epoch
                });
                self.persist_state(room);
                self.arm_idle_timer(room, epoch);
                return Ok(());
            };

            let source = match self.preloader.take_if_match(room, &track) {
                Some(prepared) => {
                    debug!(%room, title = %track.title, "using preloaded source");
                    prepared.source
                }
                None => match materialize(&*self.resolver, &*self.opener, &track).await {
                    Ok(prepared) => prepared.source,
                    Err(e) => {
                        warn!(%room, title = %track.title, "track failed to open: {e}");
                        self.notifier.track_failed(room, &track.title, &e.to_string());
                        continue;
                    }
                },
            };

            let sink = self.gateway.open_sink(room);
            // Bump the generation before the driver exists, so any event still
            // in flight from a predecessor is already stale.
            let (volume, generation) = self.sessions.with(room, |s| {
                s.playback_gen += 1;
                (s.volume, s.playback_gen)
            });
            let handle = spawn_driver(
                room,
                track.clone(),
                generation,
                source,
                sink,
                self.events_tx.clone(),
                volume,
            );
            info!(%room, title = %track.title, "now playing");
            self.sessions.with(room, |s| {
                s.current = Some(track);
                s.is_paused = false;
                s.playback = Some(handle);
                s.idle_epoch += 1;
            });
            self.persist_state(room);

            if let Some(head) = self.queues.peek(room) {
                self.preloader.kick(room, head);
            }
            return Ok(());
        }
    }

    async fn handle_track_ended(
        &self,
        room: RoomId,
        track: Track,
        generation: u64,
        error: Option<String>,
    ) {
        // A skip can race with a new play: the replacement driver is installed
        // before the skipped driver's event is processed. Such an event is one
        // generation behind and must not touch the session that replaced it.
        let fresh = self.sessions.with(room, |s| {
            if s.playback_gen != generation {
                return false;
            }
            s.playback = None;
            s.current = None;
            s.is_paused = false;
            true
        });
        if !fresh {
            debug!(%room, title = %track.title, "dropping stale completion event");
            return;
        }

        if let Some(reason) = &error {
            warn!(%room, title = %track.title, "track ended with error: {reason}");
            self.notifier.track_failed(room, &track.title, reason);
        } else {
            debug!(%room, title = %track.title, "track finished");
        }
        self.queues.record_history(room, track);

        if self.gateway.is_connected(room)
            && let Err(e) = self.play_next(room).await
        {
            warn!(%room, "failed to advance queue: {e}");
        }
    }

    /// Ends the current track; the completion path advances into the next.
    pub async fn skip(&self, room: RoomId) -> Result<()> {
        let handle = self.sessions.with(room, |s| s.playback.take());
        match handle {
            Some(handle) => {
                handle.cancel(CancelKind::Skip).await;
                Ok(())
            }
            None => Err(PlayerError::InvalidOperation("nothing is playing")),
        }
    }

    pub fn pause(&self, room: RoomId) -> Result<()> {
        self.sessions.with(room, |s| match &s.playback {
            Some(handle) if !s.is_paused => {
                handle.set_paused(true);
                s.is_paused = true;
                Ok(())
            }
            Some(_) => Err(PlayerError::InvalidOperation("already paused")),
            None => Err(PlayerError::InvalidOperation("nothing is playing")),
        })?;
        self.persist_state(room);
        Ok(())
    }

    pub fn resume(&self, room: RoomId) -> Result<()> {
        self.sessions.with(room, |s| match &s.playback {
            Some(handle) if s.is_paused => {
                handle.set_paused(false);
                s.is_paused = false;
                Ok(())
            }
            Some(_) => Err(PlayerError::InvalidOperation("not paused")),
            None => Err(PlayerError::InvalidOperation("nothing is playing")),
        })?;
        self.persist_state(room);
        Ok(())
    }

    /// Clears queue and current track. The source is fully closed before this
    /// returns; no completion event fires, so the queue does not re-advance.
    pub async fn stop(&self, room: RoomId) -> Result<()> {
        self.queues.clear(room);
        self.preloader.invalidate(room);
        let handle = self.sessions.with(room, |s| {
            s.current = None;
            s.is_paused = false;
            s.idle_epoch += 1;
            s.playback.take()
        });
        if let Some(handle) = handle {
            handle.cancel(CancelKind::Halt).await;
        }
        self.persist.clear(room);

        let epoch = self.sessions.with(room, |s| s.idle_epoch);
        self.arm_idle_timer(room, epoch);
        Ok(())
    }

    /// Stop, disconnect, and forget the room entirely.
    pub async fn leave(&self, room: RoomId) -> Result<()> {
        self.queues.clear(room);
        self.preloader.invalidate(room);
        let handle = self.sessions.with(room, |s| s.playback.take());
        if let Some(handle) = handle {
            handle.cancel(CancelKind::Halt).await;
        }
        self.gateway.disconnect(room).await;
        self.sessions.remove(room);
        self.queues.remove_room(room);
        self.persist.clear(room);
        info!(%room, "left room");
        Ok(())
    }

    /// Replays the most recent history entry. The interrupted current track
    /// returns to the queue head behind it.
    pub async fn previous(&self, room: RoomId) -> Result<Track> {
        let prev = match self.queues.pop_last(room) {
            Some(t) => Some(t),
            None => match &self.store {
                Some(store) => {
                    let store = store.clone();
                    tokio::task::spawn_blocking(move || store.pop_last_history(room))
                        .await
                        .map_err(|e| PlayerError::Persistence(e.to_string()))??
                }
                None => None,
            },
        };
        let Some(prev) = prev else {
            return Err(PlayerError::InvalidOperation("no playback history"));
        };

        let (current, handle) = self.sessions.with(room, |s| {
            s.is_paused = false;
            (s.current.take(), s.playback.take())
        });
        if let Some(current) = current {
            self.queues.push_front(room, current);
        }
        self.queues.push_front(room, prev.clone());
        if let Some(handle) = handle {
            handle.cancel(CancelKind::Halt).await;
        }
        self.play_next(room).await?;
        Ok(prev)
    }

    pub fn set_volume(&self, room: RoomId, volume: f32) -> f32 {
        let volume = volume.clamp(0.0, 2.0);
        self.sessions.with(room, |s| {
            s.volume = volume;
            if let Some(handle) = &s.playback {
                handle.set_volume(volume);
            }
        });
        volume
    }

    pub fn status(&self, room: RoomId) -> (Option<Track>, bool) {
        self.sessions.with(room, |s| (s.current.clone(), s.is_paused))
    }

    pub fn notify_resumed(&self, room: RoomId, title: &str) {
        self.notifier.resumed(room, title);
    }

    fn persist_state(&self, room: RoomId) {
        let snapshot = self.sessions.with(room, |s| RoomStateSnapshot {
            room,
            voice_channel: s.voice_channel,
            notify_channel: s.notify_channel,
            current: s.current.clone(),
            is_paused: s.is_paused,
        });
        if snapshot.current.is_none() && self.queues.is_empty(room) {
            self.persist.clear(room);
        } else {
            self.persist.save_state(snapshot);
        }
    }

    /// Disconnects the room if it is still idle and empty when the timeout
    /// elapses. Any playback in the meantime bumps the epoch and voids the
    /// timer.
    fn arm_idle_timer(&self, room: RoomId, epoch: u64) {
        let Some(this) = self.me.upgrade() else { return };
        let wait = self.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            // `peek`, not `with`: a room removed by leave() must not be
            // resurrected by its own expiring timer.
            let still_idle = this
                .sessions
                .peek(room, |s| s.playback.is_none() && s.idle_epoch == epoch)
                .unwrap_or(false);
            if still_idle && this.queues.is_empty(room) {
                info!(%room, "idle timeout, disconnecting");
                this.gateway.disconnect(room).await;
                this.sessions.remove(room);
                this.queues.remove_room(room);
                this.persist.clear(room);
            }
        });
    }
}
