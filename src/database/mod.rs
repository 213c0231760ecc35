use std::path::Path;

use diesel::prelude::*;
use diesel::sql_query;

pub mod models;
pub mod schema;

use crate::error::{PlayerError, Result};

pub fn establish_connection(db_path: &Path) -> Result<SqliteConnection> {
    let database_url = db_path.to_string_lossy();
    SqliteConnection::establish(&database_url)
        .map_err(|e| PlayerError::Persistence(format!("connecting to {database_url}: {e}")))
}

/// Creates the tables on first run. Idempotent.
pub fn init_schema(conn: &mut SqliteConnection) -> Result<()> {
    const DDL: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS room_state (
            room_id TEXT PRIMARY KEY NOT NULL,
            voice_channel_id TEXT,
            notify_channel_id TEXT,
            current_track TEXT,
            is_paused BOOLEAN NOT NULL DEFAULT 0,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        "CREATE TABLE IF NOT EXISTS queue_tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            track TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_queue_tracks_room ON queue_tracks (room_id, position)",
        "CREATE TABLE IF NOT EXISTS history_tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id TEXT NOT NULL,
            title TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            duration INTEGER,
            thumbnail TEXT,
            played_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        "CREATE INDEX IF NOT EXISTS idx_history_tracks_room ON history_tracks (room_id, played_at)",
    ];
    for stmt in DDL {
        sql_query(*stmt)
            .execute(conn)
            .map_err(|e| PlayerError::Persistence(format!("initializing schema: {e}")))?;
    }
    Ok(())
}
