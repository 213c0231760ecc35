use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use tokio::fs;
use tokio::process::Command as TokioCommand;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PlayerError, Result};
use crate::track::Track;

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("kithara/0.1 (+https://github.com/)")
        .build()
        .expect("client")
});

static YTDLP: OnceCell<PathBuf> = OnceCell::const_new();

const GITHUB_RELEASES_API: &str = "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest";

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseInfo {
    assets: Vec<ReleaseAsset>,
}

fn cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .ok_or_else(|| PlayerError::Provision("no cache dir available on this system".into()))?;
    Ok(base.join("kithara").join("yt-dlp"))
}

fn platform_asset_name() -> &'static str {
    if cfg!(target_os = "windows") {
        if cfg!(target_arch = "x86_64") {
            "yt-dlp.exe"
        } else {
            "yt-dlp_x86.exe"
        }
    } else if cfg!(target_os = "linux") {
        "yt-dlp_linux"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp"
    }
}

/// Locates yt-dlp on PATH, or downloads the latest release asset into the
/// cache dir. Resolved once per process.
pub async fn ensure_yt_dlp() -> Result<PathBuf> {
    YTDLP
        .get_or_try_init(locate_or_download)
        .await
        .cloned()
}

async fn locate_or_download() -> Result<PathBuf> {
    if let Ok(p) = which::which("yt-dlp") {
        return Ok(p);
    }

    let dir = cache_dir()?;
    fs::create_dir_all(&dir).await.ok();

    let local = dir.join(if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    });
    if fs::try_exists(&local).await.unwrap_or(false) {
        return Ok(local);
    }

    let provision = |e: &dyn std::fmt::Display| PlayerError::Provision(e.to_string());

    let resp = HTTP
        .get(GITHUB_RELEASES_API)
        .header(ACCEPT, "application/vnd.github+json")
        .send()
        .await
        .map_err(|e| provision(&e))?
        .error_for_status()
        .map_err(|e| provision(&e))?;
    let rel: ReleaseInfo = resp.json().await.map_err(|e| provision(&e))?;

    let wanted = platform_asset_name();
    let asset = rel
        .assets
        .into_iter()
        .find(|a| a.name == wanted)
        .ok_or_else(|| {
            PlayerError::Provision(format!("no suitable yt-dlp asset for this platform: {wanted}"))
        })?;

    debug!(asset = %asset.name, "downloading yt-dlp");
    let bytes = HTTP
        .get(asset.browser_download_url)
        .header(USER_AGENT, "kithara/0.1")
        .send()
        .await
        .map_err(|e| provision(&e))?
        .error_for_status()
        .map_err(|e| provision(&e))?
        .bytes()
        .await
        .map_err(|e| provision(&e))?;

    fs::write(&local, &bytes).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&local).await?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&local, perms).await?;
    }
    Ok(local)
}

/// Turns a URL or search query into playable tracks.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// One track for a single URL or bare search query; the full ordered
    /// expansion for a playlist URL.
    async fn resolve(&self, query: &str) -> Result<Vec<Track>>;

    /// Up to `limit` candidates with flat metadata, for selection menus.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>>;
}

pub struct YtDlpResolver {
    bin: Option<PathBuf>,
    retries: u32,
    backoff: Duration,
}

impl YtDlpResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            bin: config.ytdlp_bin.clone(),
            retries: config.resolve_retries.max(1),
            backoff: config.resolve_backoff,
        }
    }

    async fn bin(&self) -> Result<PathBuf> {
        match &self.bin {
            Some(p) => Ok(p.clone()),
            None => ensure_yt_dlp().await,
        }
    }

    /// Runs the extractor, retrying transient failures (spawn error, non-zero
    /// exit, empty output) with a short pause between attempts. Returns
    /// non-empty stdout lines.
    async fn run(&self, query: &str, args: &[&str], target: &str) -> Result<Vec<String>> {
        let bin = self.bin().await?;
        let mut last_err = String::new();
        for attempt in 1..=self.retries {
            let out = TokioCommand::new(&bin)
                .args(args)
                .arg(target)
                .stdin(Stdio::null())
                .output()
                .await;

            match out {
                Ok(out) if out.status.success() => {
                    let lines: Vec<String> = String::from_utf8_lossy(&out.stdout)
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !lines.is_empty() {
                        return Ok(lines);
                    }
                    last_err = "extractor returned no output".to_string();
                }
                Ok(out) => last_err = format!("yt-dlp exited with {}", out.status),
                Err(e) => last_err = format!("failed to run yt-dlp: {e}"),
            }

            if attempt < self.retries {
                warn!(query, attempt, "resolution attempt failed: {last_err}");
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(PlayerError::resolution(query, last_err))
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<Vec<Track>> {
        if is_url(query) && is_playlist_url(query) {
            // Flat expansion bounds latency; entries resolve fully at open
            // time. Unparseable entries are skipped.
            let lines = self
                .run(query, &["--dump-json", "--flat-playlist", "--quiet"], query)
                .await?;
            let tracks: Vec<Track> = lines
                .iter()
                .filter_map(|line| serde_json::from_str::<Extracted>(line).ok())
                .map(|e| e.into_track(query))
                .collect();
            if tracks.is_empty() {
                return Err(PlayerError::resolution(query, "playlist expanded to nothing"));
            }
            return Ok(tracks);
        }

        let target = if is_url(query) {
            query.to_string()
        } else {
            format!("ytsearch1:{query}")
        };
        let lines = self
            .run(
                query,
                &[
                    "-f",
                    "bestaudio/best",
                    "--dump-json",
                    "--no-playlist",
                    "--quiet",
                ],
                &target,
            )
            .await?;
        let first = lines
            .first()
            .ok_or_else(|| PlayerError::resolution(query, "no results"))?;
        let extracted: Extracted =
            serde_json::from_str(first).map_err(|e| PlayerError::resolution(query, e))?;
        Ok(vec![extracted.into_track(query)])
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>> {
        let target = format!("ytsearch{}:{query}", limit.max(1));
        let lines = self
            .run(query, &["--dump-json", "--flat-playlist", "--quiet"], &target)
            .await?;
        let tracks: Vec<Track> = lines
            .iter()
            .filter_map(|line| serde_json::from_str::<Extracted>(line).ok())
            .map(|e| e.into_track(query))
            .take(limit)
            .collect();
        if tracks.is_empty() {
            return Err(PlayerError::resolution(query, "no search results"));
        }
        Ok(tracks)
    }
}

fn is_url(query: &str) -> bool {
    url::Url::parse(query)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Playlist pages carry a `list` query parameter (or a `/sets/` path on
/// soundcloud-style providers).
fn is_playlist_url(query: &str) -> bool {
    match url::Url::parse(query) {
        Ok(u) => u.query_pairs().any(|(k, _)| k == "list") || u.path().contains("/sets/"),
        Err(_) => false,
    }
}

/// The subset of yt-dlp's JSON the core cares about. Full extraction carries
/// a direct media `url`; flat playlist entries carry the page URL there.
#[derive(Debug, Deserialize)]
struct Extracted {
    title: Option<String>,
    webpage_url: Option<String>,
    url: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
}

impl Extracted {
    fn into_track(self, fallback_url: &str) -> Track {
        let canonical_url = self
            .webpage_url
            .clone()
            .or_else(|| self.url.clone())
            .unwrap_or_else(|| fallback_url.to_string());
        let playable_url = self
            .url
            .or(self.webpage_url)
            .unwrap_or_else(|| fallback_url.to_string());
        Track {
            title: self.title.unwrap_or_else(|| "unknown title".to_string()),
            playable_url,
            canonical_url,
            duration: self
                .duration
                .filter(|d| *d > 0.0)
                .map(|d| d.round() as u32),
            thumbnail: self.thumbnail,
            requester_id: None,
        }
    }
}
