use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::database::schema::history_tracks;
use crate::track::{RoomId, Track};

/// Retained history rows per room; oldest pruned beyond this.
pub const HISTORY_ROW_CAP: i64 = 200;

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = history_tracks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct HistoryTrack {
    pub id: Option<i32>,
    pub room_id: String,
    pub title: String,
    pub canonical_url: String,
    pub duration: Option<i32>,
    pub thumbnail: Option<String>,
    pub played_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = history_tracks)]
struct NewHistoryTrack {
    room_id: String,
    title: String,
    canonical_url: String,
    duration: Option<i32>,
    thumbnail: Option<String>,
    played_at: NaiveDateTime,
}

impl HistoryTrack {
    pub fn record(conn: &mut SqliteConnection, room: RoomId, track: &Track) -> QueryResult<()> {
        let row = NewHistoryTrack {
            room_id: room.to_string(),
            title: track.title.clone(),
            canonical_url: track.canonical_url.clone(),
            duration: track.duration.map(|d| d as i32),
            thumbnail: track.thumbnail.clone(),
            played_at: chrono::Utc::now().naive_utc(),
        };
        diesel::insert_into(history_tracks::table)
            .values(&row)
            .execute(conn)?;

        // Prune oldest beyond the per-room cap. Ids are monotonic, so id order
        // is insertion order.
        let stale: Vec<Option<i32>> = history_tracks::table
            .filter(history_tracks::room_id.eq(room.to_string()))
            .order(history_tracks::id.desc())
            .offset(HISTORY_ROW_CAP)
            .select(history_tracks::id)
            .load::<Option<i32>>(conn)?;
        if !stale.is_empty() {
            diesel::delete(history_tracks::table)
                .filter(history_tracks::id.eq_any(stale))
                .execute(conn)?;
        }
        Ok(())
    }

    /// Most recent first.
    pub fn recent(
        conn: &mut SqliteConnection,
        room: RoomId,
        limit: i64,
    ) -> QueryResult<Vec<HistoryTrack>> {
        history_tracks::table
            .filter(history_tracks::room_id.eq(room.to_string()))
            .order(history_tracks::id.desc())
            .limit(limit)
            .select(HistoryTrack::as_select())
            .load::<HistoryTrack>(conn)
    }

    /// Removes and returns the most recently played track. Feeds the
    /// "previous track" action when the in-memory history is empty after a
    /// restart.
    pub fn pop_last(conn: &mut SqliteConnection, room: RoomId) -> QueryResult<Option<Track>> {
        let last = history_tracks::table
            .filter(history_tracks::room_id.eq(room.to_string()))
            .order(history_tracks::id.desc())
            .select(HistoryTrack::as_select())
            .first::<HistoryTrack>(conn)
            .optional()?;

        let Some(row) = last else { return Ok(None) };
        diesel::delete(history_tracks::table)
            .filter(history_tracks::id.eq(row.id))
            .execute(conn)?;
        Ok(Some(row.into_track()))
    }

    /// Most-played tracks, by canonical URL.
    pub fn top_tracks(
        conn: &mut SqliteConnection,
        room: RoomId,
        limit: usize,
    ) -> QueryResult<Vec<(Track, u32)>> {
        let rows = Self::recent(conn, room, HISTORY_ROW_CAP)?;
        let mut counts: HashMap<String, (Track, u32)> = HashMap::new();
        for row in rows {
            let track = row.into_track();
            counts
                .entry(track.canonical_url.clone())
                .and_modify(|(_, n)| *n += 1)
                .or_insert((track, 1));
        }
        let mut ranked: Vec<(Track, u32)> = counts.into_values().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Total seconds of recorded playback for a room.
    pub fn total_listening_time(conn: &mut SqliteConnection, room: RoomId) -> QueryResult<i64> {
        use diesel::dsl::sum;

        history_tracks::table
            .filter(history_tracks::room_id.eq(room.to_string()))
            .select(sum(history_tracks::duration))
            .first::<Option<i64>>(conn)
            .map(|total| total.unwrap_or(0))
    }

    fn into_track(self) -> Track {
        Track {
            title: self.title,
            playable_url: self.canonical_url.clone(),
            canonical_url: self.canonical_url,
            duration: self.duration.map(|d| d as u32),
            thumbnail: self.thumbnail,
            requester_id: None,
        }
    }
}
