use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use relay_hub::config::{self, HubConfig, SegmentsConfig};
use relay_hub::hub::PlaybackHub;
use relay_hub::notifier::{LoggingNotifier, PlaybackNotifier};
use relay_hub::session::{PlaybackSession, SessionDeps, SessionError};
use relay_player::codec::DefaultCodecFactory;
use relay_player::encode::{self, FrameEncoding};
use relay_player::hls::{HlsSegmentSource, TemplateLocator};
use relay_player::source::{DirectorySegmentSource, SegmentSource};
use relay_types::{RepeatMode, Song};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-hub")]
struct Args {
    /// Optional hub config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local song directory, overrides [segments] in the config
    #[arg(long)]
    segments_dir: Option<PathBuf>,

    /// HLS playlist URL template containing {id}
    #[arg(long)]
    playlist_url: Option<String>,

    /// Song id to queue; repeat for more
    #[arg(long = "song", required = true)]
    songs: Vec<String>,

    /// File receiving length-prefixed transport frames
    #[arg(long)]
    out: PathBuf,

    /// Transport encoding: opus or pcm, overrides [transcode] in the config
    #[arg(long)]
    encoding: Option<String>,

    /// Pull frames at real-time cadence instead of as fast as possible
    #[arg(long)]
    realtime: bool,

    #[arg(long, value_enum, default_value_t = RepeatArg::Off)]
    repeat: RepeatArg,

    #[arg(long)]
    shuffle: bool,

    /// Session id (guild) to play in
    #[arg(long, default_value = "local")]
    session: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RepeatArg {
    Off,
    One,
    All,
}

impl From<RepeatArg> for RepeatMode {
    fn from(value: RepeatArg) -> Self {
        match value {
            RepeatArg::Off => RepeatMode::Off,
            RepeatArg::One => RepeatMode::One,
            RepeatArg::All => RepeatMode::All,
        }
    }
}

/// Logs like [`LoggingNotifier`] and wakes `main` when the queue runs dry.
struct CliNotifier {
    done: Arc<Notify>,
}

impl PlaybackNotifier for CliNotifier {
    fn now_playing(&self, session: &str, song: &Song) {
        LoggingNotifier.now_playing(session, song);
    }

    fn queue_ended(&self, session: &str) {
        LoggingNotifier.queue_ended(session);
        self.done.notify_one();
    }

    fn playback_failed(&self, session: &str, song: &Song, reason: &str) {
        LoggingNotifier.playback_failed(session, song, reason);
    }

    fn inactivity_disconnect(&self, session: &str) {
        LoggingNotifier.inactivity_disconnect(session);
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,relay_hub=info,relay_player=info")
        }))
        .init();

    let cfg = match args.config.as_ref() {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::default(),
    };
    let transcode = config::transcode_from_config(&cfg)?;
    let encoding = match args.encoding.as_deref() {
        Some(name) => FrameEncoding::parse(name)
            .ok_or_else(|| anyhow::anyhow!("--encoding must be opus or pcm, got {name:?}"))?,
        None => config::encoding_from_config(&cfg)?,
    };
    encode::build_encoder(encoding, &transcode)
        .map_err(|err| anyhow::anyhow!("transport encoder: {err}"))?;
    let settings = config::settings_from_config(&cfg);
    let segments = match (&args.segments_dir, &args.playlist_url) {
        (Some(dir), _) => SegmentsConfig::Directory(dir.clone()),
        (None, Some(url)) => SegmentsConfig::Hls {
            playlist_url: url.clone(),
            timeout: Duration::from_secs(
                cfg.segments
                    .as_ref()
                    .and_then(|s| s.http_timeout_secs)
                    .unwrap_or(10),
            ),
        },
        (None, None) => config::segments_from_config(&cfg)?,
    };
    tracing::info!(
        segments = ?segments,
        sample_rate = transcode.sample_rate,
        channels = transcode.channels,
        frame_ms = transcode.frame_duration_ms,
        encoding = ?encoding,
        "starting relay-hub"
    );

    let source: Arc<dyn SegmentSource> = match segments {
        SegmentsConfig::Directory(dir) => Arc::new(DirectorySegmentSource::new(dir)),
        SegmentsConfig::Hls {
            playlist_url,
            timeout,
        } => Arc::new(HlsSegmentSource::new(
            Box::new(TemplateLocator::new(playlist_url)),
            timeout,
        )),
    };
    let done = Arc::new(Notify::new());
    let deps = SessionDeps::new(
        source,
        Arc::new(DefaultCodecFactory::with_encoding(transcode.clone(), encoding)),
    )
        .with_notifier(Arc::new(CliNotifier { done: done.clone() }));
    let hub = PlaybackHub::new(settings, deps, config::registry_shards_from_config(&cfg));

    let session = hub.session(&args.session);
    session.set_repeat(args.repeat.into());
    session.set_shuffle(args.shuffle);

    let stop = Arc::new(AtomicBool::new(false));
    let frame_duration = transcode.frame_duration();
    let sink = {
        let session = session.clone();
        let stop = stop.clone();
        let out = args.out.clone();
        let realtime = args.realtime;
        std::thread::Builder::new()
            .name("frame-sink".to_string())
            .spawn(move || write_frames(&session, &out, realtime, frame_duration, &stop))
            .context("spawn frame sink")?
    };

    for id in &args.songs {
        let song = Song {
            id: id.clone(),
            title: id.clone(),
            ..Song::default()
        };
        let position = session.add(song, "cli").await?;
        tracing::debug!(song = %id, position, "queued");
    }

    tokio::select! {
        _ = done.notified() => tracing::info!("queue finished"),
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    stop.store(true, Ordering::SeqCst);
    let frames = tokio::task::spawn_blocking(move || sink.join())
        .await
        .context("join frame sink")?
        .map_err(|_| anyhow::anyhow!("frame sink panicked"))??;
    hub.close_all();
    tracing::info!(frames, out = %args.out.display(), "done");
    Ok(())
}

/// Pull frames from the session until stopped, writing `u32` LE length + bytes.
fn write_frames(
    session: &PlaybackSession,
    out: &Path,
    realtime: bool,
    frame_duration: Duration,
    stop: &AtomicBool,
) -> Result<u64> {
    let file = File::create(out).with_context(|| format!("create {:?}", out))?;
    let mut writer = BufWriter::new(file);
    let mut frames = 0u64;

    while !stop.load(Ordering::SeqCst) {
        match session.provide_frame() {
            Ok(Some(frame)) => {
                let len = u32::try_from(frame.len()).context("frame too large")?;
                writer.write_all(&len.to_le_bytes())?;
                writer.write_all(&frame)?;
                frames += 1;
                if realtime {
                    std::thread::sleep(frame_duration);
                }
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(5)),
            Err(SessionError::Closed) => break,
            Err(err) => return Err(err.into()),
        }
    }
    writer.flush().with_context(|| format!("flush {:?}", out))?;
    Ok(frames)
}
