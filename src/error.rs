use thiserror::Error;

/// Error taxonomy for the playback core.
///
/// Errors local to one track (`Resolution`, `SourceOpen`) are contained by the
/// controller and converted into "advance the queue"; they never tear down a
/// room session. `Persistence` failures are logged and ignored from the
/// playback path. `InvalidOperation` is a declined request, not a fault.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to resolve '{query}': {reason}")]
    Resolution { query: String, reason: String },

    #[error("failed to open audio source for '{title}': {reason}")]
    SourceOpen { title: String, reason: String },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("yt-dlp provisioning failed: {0}")]
    Provision(String),

    #[error("{0}")]
    InvalidOperation(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    pub fn resolution(query: impl Into<String>, reason: impl ToString) -> Self {
        Self::Resolution {
            query: query.into(),
            reason: reason.to_string(),
        }
    }

    pub fn source_open(title: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceOpen {
            title: title.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
