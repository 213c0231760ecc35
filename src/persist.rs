use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::database::models::{ActiveRoom, HistoryTrack, QueueTrack, RoomState};
use crate::database::{establish_connection, init_schema};
use crate::error::{PlayerError, Result};
use crate::track::{RoomId, Track};

/// Full-replace snapshot of one room's playback state, as sent to the writer.
#[derive(Debug, Clone)]
pub struct RoomStateSnapshot {
    pub room: RoomId,
    pub voice_channel: Option<u64>,
    pub notify_channel: Option<u64>,
    pub current: Option<Track>,
    pub is_paused: bool,
}

#[derive(Debug)]
enum PersistCmd {
    SaveState(RoomStateSnapshot),
    SaveQueue(RoomId, Vec<Track>),
    RecordHistory(RoomId, Track),
    Clear(RoomId),
}

/// Fire-and-forget sender into the persistence writer. Callers never wait on
/// storage; a crash immediately after a mutation may lose that one write.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCmd>,
}

impl PersistHandle {
    pub fn save_state(&self, snapshot: RoomStateSnapshot) {
        let _ = self.tx.send(PersistCmd::SaveState(snapshot));
    }

    pub fn save_queue(&self, room: RoomId, queue: Vec<Track>) {
        let _ = self.tx.send(PersistCmd::SaveQueue(room, queue));
    }

    pub fn record_history(&self, room: RoomId, track: Track) {
        let _ = self.tx.send(PersistCmd::RecordHistory(room, track));
    }

    pub fn clear(&self, room: RoomId) {
        let _ = self.tx.send(PersistCmd::Clear(room));
    }

    /// A handle whose writes go nowhere. For tests and dry runs.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Synchronous read/write access to the store, one connection per call like
/// the writer itself. Reads are wrapped in `spawn_blocking` by async callers.
#[derive(Clone)]
pub struct Store {
    db_path: Arc<PathBuf>,
}

impl Store {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let mut conn = establish_connection(&db_path)?;
        init_schema(&mut conn)?;
        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    pub fn load_all_active(&self) -> Result<Vec<ActiveRoom>> {
        let mut conn = establish_connection(&self.db_path)?;
        RoomState::load_all_active(&mut conn).map_err(persistence_err)
    }

    pub fn load_queue(&self, room: RoomId) -> Result<Vec<Track>> {
        let mut conn = establish_connection(&self.db_path)?;
        QueueTrack::load_queue(&mut conn, room).map_err(persistence_err)
    }

    pub fn pop_last_history(&self, room: RoomId) -> Result<Option<Track>> {
        let mut conn = establish_connection(&self.db_path)?;
        HistoryTrack::pop_last(&mut conn, room).map_err(persistence_err)
    }

    pub fn top_tracks(&self, room: RoomId, limit: usize) -> Result<Vec<(Track, u32)>> {
        let mut conn = establish_connection(&self.db_path)?;
        HistoryTrack::top_tracks(&mut conn, room, limit).map_err(persistence_err)
    }

    pub fn total_listening_time(&self, room: RoomId) -> Result<i64> {
        let mut conn = establish_connection(&self.db_path)?;
        HistoryTrack::total_listening_time(&mut conn, room).map_err(persistence_err)
    }

    pub fn clear_room(&self, room: RoomId) -> Result<()> {
        let mut conn = establish_connection(&self.db_path)?;
        apply_clear(&mut conn, room)
    }
}

fn persistence_err(e: diesel::result::Error) -> PlayerError {
    PlayerError::Persistence(e.to_string())
}

fn apply_clear(conn: &mut diesel::SqliteConnection, room: RoomId) -> Result<()> {
    RoomState::clear(conn, room).map_err(persistence_err)?;
    QueueTrack::clear(conn, room).map_err(persistence_err)?;
    Ok(())
}

fn apply(store: &Store, cmd: PersistCmd) -> Result<()> {
    let mut conn = establish_connection(&store.db_path)?;
    match cmd {
        PersistCmd::SaveState(s) => {
            RoomState::upsert(
                &mut conn,
                s.room,
                s.voice_channel,
                s.notify_channel,
                s.current.as_ref(),
                s.is_paused,
            )
            .map_err(persistence_err)?;
        }
        PersistCmd::SaveQueue(room, queue) => {
            QueueTrack::replace_queue(&mut conn, room, &queue).map_err(persistence_err)?;
        }
        PersistCmd::RecordHistory(room, track) => {
            HistoryTrack::record(&mut conn, room, &track).map_err(persistence_err)?;
        }
        PersistCmd::Clear(room) => apply_clear(&mut conn, room)?,
    }
    Ok(())
}

/// Spawns the single writer task. Commands are applied strictly in send
/// order, which keeps per-room upserts ordered under rapid mutation bursts
/// even though no caller blocks on them. Write failures are logged and
/// dropped — persistence is best-effort by contract.
pub fn spawn_writer(store: Store) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistCmd>();
    let handle = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let store = store.clone();
            let outcome = tokio::task::spawn_blocking(move || apply(&store, cmd)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("persistence write failed: {e}"),
                Err(e) => error!("persistence task panicked: {e}"),
            }
        }
        debug!("persistence writer shut down");
    });
    (PersistHandle { tx }, handle)
}
