use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::database::schema::room_state;
use crate::track::{RoomId, Track};

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug)]
#[diesel(table_name = room_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RoomState {
    pub room_id: String,
    pub voice_channel_id: Option<String>,
    pub notify_channel_id: Option<String>,
    pub current_track: Option<String>,
    pub is_paused: bool,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = room_state)]
struct NewRoomState {
    room_id: String,
    voice_channel_id: Option<String>,
    notify_channel_id: Option<String>,
    current_track: Option<String>,
    is_paused: bool,
    updated_at: NaiveDateTime,
}

/// A persisted room that still had an active session — decoded form used by
/// startup recovery.
#[derive(Debug, Clone)]
pub struct ActiveRoom {
    pub room: RoomId,
    pub voice_channel: u64,
    pub notify_channel: Option<u64>,
    pub current: Track,
    pub is_paused: bool,
}

impl RoomState {
    /// Full-row replace for one room. Each write is a complete record, so a
    /// crash mid-burst loses at most the latest mutations, never leaves a
    /// partial row.
    pub fn upsert(
        conn: &mut SqliteConnection,
        room: RoomId,
        voice_channel: Option<u64>,
        notify_channel: Option<u64>,
        current: Option<&Track>,
        is_paused: bool,
    ) -> QueryResult<usize> {
        let current_track = current.and_then(|t| serde_json::to_string(t).ok());
        let row = NewRoomState {
            room_id: room.to_string(),
            voice_channel_id: voice_channel.map(|c| c.to_string()),
            notify_channel_id: notify_channel.map(|c| c.to_string()),
            current_track,
            is_paused,
            updated_at: chrono::Utc::now().naive_utc(),
        };

        diesel::insert_into(room_state::table)
            .values(&row)
            .on_conflict(room_state::room_id)
            .do_update()
            .set((
                room_state::voice_channel_id.eq(&row.voice_channel_id),
                room_state::notify_channel_id.eq(&row.notify_channel_id),
                room_state::current_track.eq(&row.current_track),
                room_state::is_paused.eq(row.is_paused),
                room_state::updated_at.eq(row.updated_at),
            ))
            .execute(conn)
    }

    pub fn clear(conn: &mut SqliteConnection, room: RoomId) -> QueryResult<usize> {
        diesel::delete(room_state::table)
            .filter(room_state::room_id.eq(room.to_string()))
            .execute(conn)
    }

    /// Every room that was mid-playback when the process last stopped. Used
    /// only at startup; corrupt rows are skipped, not fatal.
    pub fn load_all_active(conn: &mut SqliteConnection) -> QueryResult<Vec<ActiveRoom>> {
        let rows = room_state::table
            .filter(room_state::voice_channel_id.is_not_null())
            .filter(room_state::current_track.is_not_null())
            .select(RoomState::as_select())
            .load::<RoomState>(conn)?;

        Ok(rows.into_iter().filter_map(|r| r.decode()).collect())
    }

    fn decode(self) -> Option<ActiveRoom> {
        let room = match self.room_id.parse::<u64>() {
            Ok(id) => RoomId(id),
            Err(_) => {
                warn!(room_id = %self.room_id, "skipping room state with bad key");
                return None;
            }
        };
        let voice_channel = self.voice_channel_id.as_deref()?.parse::<u64>().ok()?;
        let notify_channel = self
            .notify_channel_id
            .as_deref()
            .and_then(|c| c.parse::<u64>().ok());
        let current = match serde_json::from_str::<Track>(self.current_track.as_deref()?) {
            Ok(t) => t,
            Err(e) => {
                warn!(%room, "skipping room state with bad track json: {e}");
                return None;
            }
        };
        Some(ActiveRoom {
            room,
            voice_channel,
            notify_channel,
            current,
            is_paused: self.is_paused,
        })
    }
}
