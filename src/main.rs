use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use kithara::config::Config;
use kithara::controller::{Notifier, PlayerController, VoiceGateway};
use kithara::persist::{Store, spawn_writer};
use kithara::queue::QueueService;
use kithara::recovery::auto_resume;
use kithara::resolver::{TrackResolver, YtDlpResolver};
use kithara::sink::{DiscardSink, VoiceSink};
use kithara::source::PipelineOpener;
use kithara::track::RoomId;

/// Headless stand-in for a chat platform's voice transport: every room is
/// reachable, every channel occupied, and audio drains into a paced discard
/// sink.
#[derive(Default)]
struct LocalGateway {
    connected: Mutex<HashSet<RoomId>>,
}

#[async_trait]
impl VoiceGateway for LocalGateway {
    async fn connect(&self, room: RoomId, channel: u64) -> kithara::error::Result<()> {
        if self.connected.lock().expect("gateway lock").insert(room) {
            info!(%room, channel, "connected to voice");
        }
        Ok(())
    }

    async fn disconnect(&self, room: RoomId) {
        if self.connected.lock().expect("gateway lock").remove(&room) {
            info!(%room, "disconnected from voice");
        }
    }

    fn is_connected(&self, room: RoomId) -> bool {
        self.connected.lock().expect("gateway lock").contains(&room)
    }

    fn open_sink(&self, _room: RoomId) -> Box<dyn VoiceSink> {
        Box::new(DiscardSink::new())
    }

    async fn room_exists(&self, _room: RoomId) -> bool {
        true
    }

    async fn channel_has_listeners(&self, _room: RoomId, _channel: u64) -> bool {
        true
    }
}

struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn track_failed(&self, room: RoomId, title: &str, reason: &str) {
        warn!(%room, title, "track failed: {reason}");
        println!("!! '{title}' failed, moving on: {reason}");
    }

    fn resumed(&self, room: RoomId, title: &str) {
        println!("resumed '{title}' in room {room}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(db = %config.db_path.display(), "starting kithara");

    let store = Store::open(config.db_path.clone())?;
    let (persist, _writer) = spawn_writer(store.clone());
    let queues = Arc::new(QueueService::new(persist.clone(), config.history_cap));
    let resolver: Arc<dyn TrackResolver> = Arc::new(YtDlpResolver::new(&config));
    let opener = Arc::new(PipelineOpener::new(config.clone()));
    let gateway: Arc<dyn VoiceGateway> = Arc::new(LocalGateway::default());

    let controller = PlayerController::spawn(
        queues.clone(),
        resolver.clone(),
        opener,
        gateway.clone(),
        Arc::new(ConsoleNotifier),
        persist,
        Some(store.clone()),
        config.idle_timeout,
    );

    match auto_resume(&controller, &store, &gateway, &queues).await {
        Ok(n) if n > 0 => info!("resumed {n} room(s)"),
        Ok(_) => {}
        Err(e) => warn!("recovery failed: {e}"),
    }

    println!(
        "kithara ready. commands: play <query>, search <query>, skip, pause, resume, stop, \
         queue, history, stats, move <from> <to>, shuffle, previous, volume <0..2>, \
         room <id>, leave, quit"
    );

    let mut room = RoomId(1);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !dispatch(&controller, &queues, &resolver, &store, &config, &mut room, line).await {
                    break;
                }
            }
        }
    }

    info!("shutting down");
    Ok(())
}

async fn dispatch(
    controller: &Arc<PlayerController>,
    queues: &Arc<QueueService>,
    resolver: &Arc<dyn TrackResolver>,
    store: &Store,
    config: &Config,
    room: &mut RoomId,
    line: &str,
) -> bool {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    match cmd {
        "quit" | "exit" => return false,
        "room" => match rest.parse::<u64>() {
            Ok(id) => {
                *room = RoomId(id);
                println!("room set to {room}");
            }
            Err(_) => println!("usage: room <id>"),
        },
        "play" => {
            if rest.is_empty() {
                println!("usage: play <url or search query>");
                return true;
            }
            if let Err(e) = controller.connect(*room, room.0, None).await {
                println!("connect failed: {e}");
                return true;
            }
            match controller.play(*room, rest, None).await {
                Ok(tracks) if tracks.len() == 1 => println!("queued '{}'", tracks[0].title),
                Ok(tracks) => println!("queued {} tracks", tracks.len()),
                Err(e) => println!("play failed: {e}"),
            }
        }
        "search" => {
            if rest.is_empty() {
                println!("usage: search <query>");
                return true;
            }
            match resolver.search(rest, config.search_results).await {
                Ok(tracks) => {
                    for (i, t) in tracks.iter().enumerate() {
                        println!("{:2}. {}", i + 1, t.title);
                    }
                }
                Err(e) => println!("search failed: {e}"),
            }
        }
        "skip" => report(controller.skip(*room).await, "skipped"),
        "pause" => report(controller.pause(*room), "paused"),
        "resume" => report(controller.resume(*room), "resumed"),
        "stop" => report(controller.stop(*room).await, "stopped"),
        "leave" => report(controller.leave(*room).await, "left"),
        "previous" => match controller.previous(*room).await {
            Ok(track) => println!("going back to '{}'", track.title),
            Err(e) => println!("{e}"),
        },
        "shuffle" => {
            queues.shuffle(*room);
            println!("shuffled {} tracks", queues.len(*room));
        }
        "move" => {
            let mut parts = rest.split_whitespace();
            match (
                parts.next().and_then(|s| s.parse::<usize>().ok()),
                parts.next().and_then(|s| s.parse::<usize>().ok()),
            ) {
                (Some(from), Some(to)) => match queues.move_track(*room, from, to) {
                    Some(track) => println!("moved '{}' to position {to}", track.title),
                    None => println!("positions out of range (queue is 1-indexed)"),
                },
                _ => println!("usage: move <from> <to>"),
            }
        }
        "volume" => match rest.parse::<f32>() {
            Ok(v) => println!("volume set to {:.2}", controller.set_volume(*room, v)),
            Err(_) => println!("usage: volume <0..2>"),
        },
        "queue" => {
            let (current, paused) = controller.status(*room);
            match current {
                Some(t) if paused => println!("paused:  {}", t.title),
                Some(t) => println!("playing: {}", t.title),
                None => println!("nothing playing"),
            }
            for (i, t) in queues.snapshot(*room).iter().enumerate() {
                println!("{:2}. {}", i + 1, t.title);
            }
        }
        "history" => {
            for t in queues.history_snapshot(*room).iter().rev() {
                println!("- {}", t.title);
            }
        }
        "stats" => {
            let s = store.clone();
            let r = *room;
            let stats = tokio::task::spawn_blocking(move || {
                let top = s.top_tracks(r, 5)?;
                let total = s.total_listening_time(r)?;
                Ok::<_, kithara::error::PlayerError>((top, total))
            })
            .await;
            match stats {
                Ok(Ok((top, total))) => {
                    println!("total listening time: {total}s");
                    for (t, plays) in top {
                        println!("{plays:3}x {}", t.title);
                    }
                }
                Ok(Err(e)) => println!("stats failed: {e}"),
                Err(e) => println!("stats failed: {e}"),
            }
        }
        _ => println!("unknown command '{cmd}'"),
    }
    true
}

fn report<T>(result: kithara::error::Result<T>, done: &str) {
    match result {
        Ok(_) => println!("{done}"),
        Err(e) => println!("{e}"),
    }
}
