use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};

/// How the streaming source feeds ffmpeg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// yt-dlp streams the media to ffmpeg over a pipe (canonical).
    Pipeline,
    /// ffmpeg fetches the resolved URL itself.
    Direct,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub db_path: PathBuf,
    /// Explicit yt-dlp binary; otherwise located via PATH or auto-downloaded.
    pub ytdlp_bin: Option<PathBuf>,
    pub ffmpeg_bin: PathBuf,
    pub source: SourceKind,
    pub idle_timeout: Duration,
    pub history_cap: usize,
    pub search_results: usize,
    pub resolve_retries: u32,
    pub resolve_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_path = match std::env::var("KITHARA_DB_PATH") {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => default_db_path()?,
        };

        let ytdlp_bin = std::env::var("KITHARA_YTDLP")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let ffmpeg_bin = match std::env::var("KITHARA_FFMPEG") {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => which::which("ffmpeg")
                .map_err(|_| anyhow!("ffmpeg not found; install it or set KITHARA_FFMPEG"))?,
        };

        let source = match std::env::var("KITHARA_SOURCE").as_deref() {
            Ok("direct") => SourceKind::Direct,
            _ => SourceKind::Pipeline,
        };

        let idle_timeout = std::env::var("KITHARA_IDLE_TIMEOUT_S")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|v| *v >= 5 && *v <= 3600)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        let search_results = std::env::var("KITHARA_SEARCH_RESULTS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|v| *v >= 1 && *v <= 25)
            .unwrap_or(10);

        Ok(Self {
            db_path,
            ytdlp_bin,
            ffmpeg_bin,
            source,
            idle_timeout,
            history_cap: 50,
            search_results,
            resolve_retries: 3,
            resolve_backoff: Duration::from_secs(2),
        })
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| anyhow!("no data dir available on this system"))?;
    let dir = base.join("kithara");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join("kithara.db"))
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(":memory:"),
            ytdlp_bin: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            source: SourceKind::Pipeline,
            idle_timeout: Duration::from_secs(60),
            history_cap: 50,
            search_results: 10,
            resolve_retries: 3,
            resolve_backoff: Duration::from_millis(10),
        }
    }
}
