use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::error::Result;
use crate::source::{AudioSource, FRAME_MS};
use crate::track::{RoomId, Track};

/// Voice output boundary. The real platform transport lives behind this.
#[async_trait]
pub trait VoiceSink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// Swallows frames at real-time pace. Stands in for a voice transport when
/// running headless; also keeps subprocess backpressure realistic.
pub struct DiscardSink {
    ticker: Option<tokio::time::Interval>,
}

impl DiscardSink {
    pub fn new() -> Self {
        Self { ticker: None }
    }
}

impl Default for DiscardSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VoiceSink for DiscardSink {
    async fn write_frame(&mut self, _frame: &[u8]) -> Result<()> {
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut t = tokio::time::interval(Duration::from_millis(FRAME_MS as u64));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });
        ticker.tick().await;
        Ok(())
    }
}

/// Emitted exactly once per attached source when its driver stops pulling
/// frames, except on an explicit halt.
#[derive(Debug)]
pub enum PlayerEvent {
    TrackEnded {
        room: RoomId,
        track: Track,
        /// Generation of the driver that emitted this. The controller drops
        /// events whose generation is no longer the room's current one.
        generation: u64,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// End this track and let the completion path advance the queue.
    Skip,
    /// End this track without a completion event (stop, leave).
    Halt,
}

/// Control surface for one running track. Dropping the handle closes the
/// control channels, which stops the driver as if the stream had ended: the
/// source is closed and a completion event fires. [`PlaybackHandle::cancel`]
/// stops it synchronously instead.
pub struct PlaybackHandle {
    cancel_tx: mpsc::Sender<(CancelKind, oneshot::Sender<()>)>,
    pause_tx: watch::Sender<bool>,
    volume_tx: watch::Sender<f32>,
}

impl PlaybackHandle {
    pub fn set_paused(&self, paused: bool) {
        let _ = self.pause_tx.send(paused);
    }

    pub fn set_volume(&self, volume: f32) {
        let _ = self.volume_tx.send(volume.clamp(0.0, 2.0));
    }

    /// Stops the driver and waits until the source is closed. By the time
    /// this returns no subprocess behind the track is left running.
    pub async fn cancel(&self, kind: CancelKind) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cancel_tx.send((kind, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Scales s16le samples in place. Unity volume is a no-op.
pub fn apply_volume(frame: &mut [u8], volume: f32) {
    if (volume - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in frame.chunks_exact_mut(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        let scaled = (value as f32 * volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        sample.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Spawns the per-track driver task: pulls frames from the source into the
/// sink until end-of-stream, error, or cancellation, closes the source on
/// every exit path, then reports completion on the event channel.
pub fn spawn_driver(
    room: RoomId,
    track: Track,
    generation: u64,
    mut source: Box<dyn AudioSource>,
    mut sink: Box<dyn VoiceSink>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    volume: f32,
) -> PlaybackHandle {
    let (cancel_tx, mut cancel_rx) = mpsc::channel::<(CancelKind, oneshot::Sender<()>)>(1);
    let (pause_tx, mut pause_rx) = watch::channel(false);
    let (volume_tx, volume_rx) = watch::channel(volume);

    tokio::spawn(async move {
        let mut error: Option<String> = None;
        loop {
            if *pause_rx.borrow() {
                tokio::select! {
                    biased;
                    Some((kind, ack)) = cancel_rx.recv() => {
                        source.close().await;
                        let _ = ack.send(());
                        finish(kind, room, track, generation, &events);
                        return;
                    }
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                biased;
                Some((kind, ack)) = cancel_rx.recv() => {
                    source.close().await;
                    let _ = ack.send(());
                    finish(kind, room, track, generation, &events);
                    return;
                }
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                frame = source.read_frame() => {
                    match frame {
                        Ok(Some(mut frame)) => {
                            apply_volume(&mut frame, *volume_rx.borrow());
                            if let Err(e) = sink.write_frame(&frame).await {
                                warn!(%room, "voice sink write failed: {e}");
                                error = Some(e.to_string());
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error = Some(e.to_string());
                            break;
                        }
                    }
                }
            }
        }

        source.close().await;
        debug!(%room, title = %track.title, "playback driver finished");
        let _ = events.send(PlayerEvent::TrackEnded {
            room,
            track,
            generation,
            error,
        });
    });

    PlaybackHandle {
        cancel_tx,
        pause_tx,
        volume_tx,
    }
}

fn finish(
    kind: CancelKind,
    room: RoomId,
    track: Track,
    generation: u64,
    events: &mpsc::UnboundedSender<PlayerEvent>,
) {
    if kind == CancelKind::Skip {
        let _ = events.send(PlayerEvent::TrackEnded {
            room,
            track,
            generation,
            error: None,
        });
    }
}
