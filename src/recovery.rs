use std::sync::Arc;

use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::controller::{PlayerController, VoiceGateway};
use crate::database::models::ActiveRoom;
use crate::error::{PlayerError, Result};
use crate::persist::Store;
use crate::queue::QueueService;
use crate::track::RoomId;

/// Reconnects every room that was mid-playback when the process last stopped
/// and restarts its queue. Best-effort: a room whose channel is gone or empty
/// has its state cleared, a room that errors is cleared and skipped — one
/// corrupt record never blocks the others. Returns how many rooms resumed.
pub async fn auto_resume(
    controller: &Arc<PlayerController>,
    store: &Store,
    gateway: &Arc<dyn VoiceGateway>,
    queues: &Arc<QueueService>,
) -> Result<usize> {
    let rooms = {
        let store = store.clone();
        spawn_blocking(move || store.load_all_active())
            .await
            .map_err(|e| PlayerError::Persistence(e.to_string()))??
    };
    if rooms.is_empty() {
        return Ok(0);
    }
    info!(count = rooms.len(), "recovering active rooms");

    let mut resumed = 0;
    for active in rooms {
        let room = active.room;
        match resume_room(controller, store, gateway, queues, active).await {
            Ok(true) => resumed += 1,
            Ok(false) => info!(%room, "cleared stale session"),
            Err(e) => {
                warn!(%room, "resume failed: {e}");
                clear_room(store, room).await;
            }
        }
    }
    Ok(resumed)
}

async fn resume_room(
    controller: &Arc<PlayerController>,
    store: &Store,
    gateway: &Arc<dyn VoiceGateway>,
    queues: &Arc<QueueService>,
    active: ActiveRoom,
) -> Result<bool> {
    let room = active.room;

    if !gateway.room_exists(room).await
        || !gateway
            .channel_has_listeners(room, active.voice_channel)
            .await
    {
        clear_room(store, room).await;
        return Ok(false);
    }

    controller
        .connect(room, active.voice_channel, active.notify_channel)
        .await?;

    let queue = {
        let store = store.clone();
        spawn_blocking(move || store.load_queue(room))
            .await
            .map_err(|e| PlayerError::Persistence(e.to_string()))??
    };
    queues.enqueue_many(room, queue);
    // The interrupted track plays first. Requester identity does not survive
    // a restart.
    queues.push_front(room, active.current.clone().with_requester(None));

    controller.play_next(room).await?;
    controller.notify_resumed(room, &active.current.title);
    info!(%room, title = %active.current.title, "resumed playback");
    Ok(true)
}

async fn clear_room(store: &Store, room: RoomId) {
    let store = store.clone();
    if let Ok(Err(e)) = spawn_blocking(move || store.clear_room(room)).await {
        warn!(%room, "failed to clear stale room state: {e}");
    }
}
