use diesel::prelude::*;

use crate::database::schema::queue_tracks;
use crate::track::{RoomId, Track};

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = queue_tracks)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueueTrack {
    pub id: Option<i32>,
    pub room_id: String,
    pub position: i32,
    pub track: String,
}

#[derive(Insertable)]
#[diesel(table_name = queue_tracks)]
struct NewQueueTrack {
    room_id: String,
    position: i32,
    track: String,
}

impl QueueTrack {
    /// Atomically replaces the persisted queue for one room. Delete-then-insert
    /// inside a transaction, so readers never see a half-written queue.
    pub fn replace_queue(
        conn: &mut SqliteConnection,
        room: RoomId,
        tracks: &[Track],
    ) -> QueryResult<()> {
        conn.transaction(|conn| {
            diesel::delete(queue_tracks::table)
                .filter(queue_tracks::room_id.eq(room.to_string()))
                .execute(conn)?;

            let rows: Vec<NewQueueTrack> = tracks
                .iter()
                .enumerate()
                .filter_map(|(pos, t)| {
                    Some(NewQueueTrack {
                        room_id: room.to_string(),
                        position: pos as i32,
                        track: serde_json::to_string(t).ok()?,
                    })
                })
                .collect();

            if !rows.is_empty() {
                diesel::insert_into(queue_tracks::table)
                    .values(&rows)
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    pub fn load_queue(conn: &mut SqliteConnection, room: RoomId) -> QueryResult<Vec<Track>> {
        let rows = queue_tracks::table
            .filter(queue_tracks::room_id.eq(room.to_string()))
            .order(queue_tracks::position.asc())
            .select(QueueTrack::as_select())
            .load::<QueueTrack>(conn)?;

        Ok(rows
            .into_iter()
            .filter_map(|r| serde_json::from_str(&r.track).ok())
            .collect())
    }

    pub fn clear(conn: &mut SqliteConnection, room: RoomId) -> QueryResult<usize> {
        diesel::delete(queue_tracks::table)
            .filter(queue_tracks::room_id.eq(room.to_string()))
            .execute(conn)
    }
}
