//! Streaming playback core for a voice bot: track resolution via an external
//! extractor, a stall-tolerant subprocess audio pipeline framed as raw PCM,
//! per-room queues and history, next-track preloading, and crash-safe
//! persistence with startup auto-resume.

pub mod config;
pub mod controller;
pub mod database;
pub mod error;
pub mod persist;
pub mod preload;
pub mod queue;
pub mod recovery;
pub mod resolver;
pub mod session;
pub mod sink;
pub mod source;
pub mod track;
