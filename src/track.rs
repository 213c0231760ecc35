use std::fmt;

use serde::{Deserialize, Serialize};

/// Key for one isolated voice room (a server on the chat platform).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A resolved, playable audio item. Immutable once created — carried through
/// the queue and history by clone, never mutated in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    /// Resolved media URL (often time-limited) or the page URL when only flat
    /// metadata was extracted.
    pub playable_url: String,
    pub canonical_url: String,
    /// Seconds; `None` for live or unknown-length sources.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Opaque platform user id of whoever requested the track. Lost across
    /// restarts.
    #[serde(default)]
    pub requester_id: Option<u64>,
}

impl Track {
    pub fn with_requester(mut self, requester_id: Option<u64>) -> Self {
        self.requester_id = requester_id;
        self
    }
}
