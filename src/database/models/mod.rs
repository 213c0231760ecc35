pub mod history_tracks;
pub mod queue_tracks;
pub mod room_state;

// Re-export all models for convenience
pub use history_tracks::HistoryTrack;
pub use queue_tracks::QueueTrack;
pub use room_state::{ActiveRoom, RoomState};
