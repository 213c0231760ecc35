use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command as TokioCommand};
use tracing::{debug, warn};

use crate::config::{Config, SourceKind};
use crate::error::{PlayerError, Result};
use crate::track::Track;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
pub const BYTES_PER_SAMPLE: u32 = 2;
pub const FRAME_MS: u32 = 20;
/// 48 kHz stereo s16le, 20 ms per frame.
pub const FRAME_SIZE: usize =
    (SAMPLE_RATE * CHANNELS * BYTES_PER_SAMPLE * FRAME_MS / 1000) as usize;

const STALL_RETRIES: u32 = 3;
const STALL_PAUSE: Duration = Duration::from_millis(30);
const SPAWN_PROBE_PAUSE: Duration = Duration::from_millis(50);

/// One opened track's audio, pulled as fixed-size PCM frames.
#[async_trait]
pub trait AudioSource: Send {
    fn title(&self) -> &str;

    /// Next frame, always exactly [`FRAME_SIZE`] bytes, or `None` at genuine
    /// end-of-stream. The final frame may be silence-padded.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Idempotent. Terminates anything still running behind the source.
    async fn close(&mut self);
}

/// Opens an [`AudioSource`] for a resolved track.
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, track: &Track) -> Result<Box<dyn AudioSource>>;
}

/// Accumulates pipe reads into exact [`FRAME_SIZE`] frames.
///
/// An `Ok(0)` read is ambiguous on a subprocess pipe: it can be a transient
/// network stall upstream or the real end of the stream. `stage_alive` reports
/// whether the producing process is still running; while it is, empty reads
/// are retried a few times with a short pause before concluding end-of-stream.
/// Leftover bytes at end-of-stream are flushed as one final padded frame.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(FRAME_SIZE * 2),
            done: false,
        }
    }

    pub async fn read_frame<F>(&mut self, mut stage_alive: F) -> std::io::Result<Option<Vec<u8>>>
    where
        F: FnMut() -> bool,
    {
        if self.done {
            return Ok(None);
        }

        let mut empty_reads = 0u32;
        let mut chunk = [0u8; 4096];
        while self.buf.len() < FRAME_SIZE {
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                if stage_alive() && empty_reads < STALL_RETRIES {
                    empty_reads += 1;
                    tokio::time::sleep(STALL_PAUSE).await;
                    continue;
                }
                self.done = true;
                return Ok(self.flush_padded());
            }
            empty_reads = 0;
            self.buf.extend_from_slice(&chunk[..n]);
        }

        Ok(Some(self.buf.drain(..FRAME_SIZE).collect()))
    }

    fn flush_padded(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.buf);
        frame.resize(FRAME_SIZE, 0);
        Some(frame)
    }
}

/// The canonical source: a fetch subprocess piped into a transcode subprocess
/// emitting raw PCM on stdout. In direct mode the transcoder fetches the URL
/// itself and there is no fetch stage.
pub struct StreamingSource {
    title: String,
    fetcher: Option<Child>,
    transcoder: Option<Child>,
    frames: FrameReader<ChildStdout>,
}

impl StreamingSource {
    pub async fn open(track: &Track, config: &Config) -> Result<Self> {
        match config.source {
            SourceKind::Pipeline => Self::open_pipeline(track, config).await,
            SourceKind::Direct => Self::open_direct(track, config).await,
        }
    }

    async fn open_pipeline(track: &Track, config: &Config) -> Result<Self> {
        let ytdlp = match &config.ytdlp_bin {
            Some(p) => p.clone(),
            None => crate::resolver::ensure_yt_dlp().await?,
        };
        let mut fetcher = TokioCommand::new(&ytdlp)
            .arg("-f")
            .arg("bestaudio/best")
            .arg("-o")
            .arg("-")
            .arg("--no-playlist")
            .arg("--quiet")
            .arg(&track.playable_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlayerError::source_open(&track.title, format!("spawning fetcher: {e}")))?;

        let fetched: Stdio = fetcher
            .stdout
            .take()
            .ok_or_else(|| PlayerError::source_open(&track.title, "fetcher stdout missing"))?
            .try_into()
            .map_err(|e| PlayerError::source_open(&track.title, format!("fetcher pipe: {e}")))?;

        let transcoder = Self::spawn_transcoder(&config.ffmpeg_bin, fetched, "pipe:0");
        let mut transcoder = match transcoder {
            Ok(child) => child,
            Err(e) => {
                let _ = fetcher.start_kill();
                return Err(PlayerError::source_open(
                    &track.title,
                    format!("spawning transcoder: {e}"),
                ));
            }
        };

        Self::assemble(track, Some(fetcher), &mut transcoder)
            .await
            .map(|mut s| {
                s.transcoder = Some(transcoder);
                s
            })
    }

    async fn open_direct(track: &Track, config: &Config) -> Result<Self> {
        let mut transcoder =
            Self::spawn_transcoder(&config.ffmpeg_bin, Stdio::null(), &track.playable_url)
                .map_err(|e| {
                    PlayerError::source_open(&track.title, format!("spawning transcoder: {e}"))
                })?;

        Self::assemble(track, None, &mut transcoder).await.map(|mut s| {
            s.transcoder = Some(transcoder);
            s
        })
    }

    fn spawn_transcoder(ffmpeg: &Path, stdin: Stdio, input: &str) -> std::io::Result<Child> {
        TokioCommand::new(ffmpeg)
            .arg("-reconnect")
            .arg("1")
            .arg("-reconnect_streamed")
            .arg("1")
            .arg("-reconnect_delay_max")
            .arg("5")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            // Resync against timestamp discontinuities in the upstream feed.
            .arg("-af")
            .arg("aresample=async=1:first_pts=0")
            .arg("pipe:1")
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }

    async fn assemble(
        track: &Track,
        fetcher: Option<Child>,
        transcoder: &mut Child,
    ) -> Result<Self> {
        let stdout = transcoder
            .stdout
            .take()
            .ok_or_else(|| PlayerError::source_open(&track.title, "transcoder stdout missing"))?;

        // A pipeline that dies straight away is an open failure, not a
        // zero-length track.
        tokio::time::sleep(SPAWN_PROBE_PAUSE).await;
        if let Ok(Some(status)) = transcoder.try_wait() {
            let mut this = Self {
                title: track.title.clone(),
                fetcher,
                transcoder: None,
                frames: FrameReader::new(stdout),
            };
            this.close().await;
            return Err(PlayerError::source_open(
                &track.title,
                format!("transcoder exited immediately: {status}"),
            ));
        }

        debug!(title = %track.title, "audio pipeline started");
        Ok(Self {
            title: track.title.clone(),
            fetcher,
            transcoder: None,
            frames: FrameReader::new(stdout),
        })
    }

    #[cfg(test)]
    fn from_children(title: &str, fetcher: Option<Child>, mut transcoder: Child) -> Self {
        let stdout = transcoder.stdout.take().expect("piped stdout");
        Self {
            title: title.to_string(),
            fetcher,
            transcoder: Some(transcoder),
            frames: FrameReader::new(stdout),
        }
    }
}

#[async_trait]
impl AudioSource for StreamingSource {
    fn title(&self) -> &str {
        &self.title
    }

    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let transcoder = &mut self.transcoder;
        let frame = self
            .frames
            .read_frame(|| {
                transcoder
                    .as_mut()
                    .map(|c| matches!(c.try_wait(), Ok(None)))
                    .unwrap_or(false)
            })
            .await?;
        Ok(frame)
    }

    async fn close(&mut self) {
        for child in [self.transcoder.take(), self.fetcher.take()].into_iter().flatten() {
            let mut child = child;
            if let Err(e) = child.start_kill() {
                warn!(title = %self.title, "killing pipeline stage: {e}");
            }
        }
    }
}

/// Default opener used by the controller and preloader.
pub struct PipelineOpener {
    config: Config,
}

impl PipelineOpener {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceOpener for PipelineOpener {
    async fn open(&self, track: &Track) -> Result<Box<dyn AudioSource>> {
        let source = StreamingSource::open(track, &self.config).await?;
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Replays a fixed script of reads; an empty step is an `Ok(0)` read.
    /// Once the script is exhausted every read returns `Ok(0)`.
    struct ScriptedReader {
        script: VecDeque<Vec<u8>>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<Vec<u8>>) -> Self {
            Self {
                script: steps.into(),
            }
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if let Some(step) = self.script.pop_front() {
                let n = step.len().min(buf.remaining());
                buf.put_slice(&step[..n]);
                if n < step.len() {
                    let rest = step[n..].to_vec();
                    self.script.push_front(rest);
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn frames_are_exact_size() {
        let mut data = vec![1u8; FRAME_SIZE * 2];
        data.extend(vec![2u8; FRAME_SIZE / 2]);
        let mut reader = FrameReader::new(ScriptedReader::new(vec![data]));

        let f1 = reader.read_frame(|| false).await.unwrap().unwrap();
        let f2 = reader.read_frame(|| false).await.unwrap().unwrap();
        assert_eq!(f1.len(), FRAME_SIZE);
        assert_eq!(f2.len(), FRAME_SIZE);
        assert!(f1.iter().all(|&b| b == 1));
    }

    #[tokio::test]
    async fn final_frame_is_padded_with_silence() {
        let mut reader =
            FrameReader::new(ScriptedReader::new(vec![vec![7u8; FRAME_SIZE / 2]]));

        let last = reader.read_frame(|| false).await.unwrap().unwrap();
        assert_eq!(last.len(), FRAME_SIZE);
        assert!(last[..FRAME_SIZE / 2].iter().all(|&b| b == 7));
        assert!(last[FRAME_SIZE / 2..].iter().all(|&b| b == 0));

        assert!(reader.read_frame(|| false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_reads_with_live_stage_are_not_end_of_stream() {
        // Half a frame, two stalls, then the rest.
        let mut reader = FrameReader::new(ScriptedReader::new(vec![
            vec![3u8; FRAME_SIZE / 2],
            vec![],
            vec![],
            vec![3u8; FRAME_SIZE / 2],
        ]));

        let frame = reader.read_frame(|| true).await.unwrap().unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert!(frame.iter().all(|&b| b == 3));
    }

    #[tokio::test]
    async fn empty_read_with_dead_stage_ends_stream() {
        let mut reader = FrameReader::new(ScriptedReader::new(vec![vec![]]));
        assert!(reader.read_frame(|| false).await.unwrap().is_none());
        // Sticky after end-of-stream.
        assert!(reader.read_frame(|| true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stall_retries_are_bounded() {
        // The stage claims to be alive forever but never produces another
        // byte; the reader must still conclude end-of-stream.
        let mut reader = FrameReader::new(ScriptedReader::new(vec![vec![9u8; 100]]));
        let frame = reader.read_frame(|| true).await.unwrap().unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert!(reader.read_frame(|| true).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn close_is_idempotent() {
        let child = TokioCommand::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut source = StreamingSource::from_children("test", None, child);

        source.close().await;
        source.close().await;
        assert!(source.read_frame().await.unwrap().is_none());
    }

    #[test]
    fn frame_size_constant() {
        assert_eq!(FRAME_SIZE, 3840);
    }
}
