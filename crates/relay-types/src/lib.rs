use serde::{Deserialize, Serialize};

/// Requestor label attached to songs queued by autoplay.
pub const AUTOPLAY_REQUESTOR: &str = "AutoPlay";

/// Track duration in whole seconds plus its display form.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SongDuration {
    /// Duration in seconds.
    pub seconds: u64,
    /// Formatted duration (`m:ss`, or `h:mm:ss` past one hour).
    pub formatted: String,
}

impl SongDuration {
    /// Build a duration and its formatted label from a second count.
    pub fn from_seconds(seconds: u64) -> Self {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;
        let formatted = if hours > 0 {
            format!("{hours}:{minutes:02}:{secs:02}")
        } else {
            format!("{minutes}:{secs:02}")
        };
        Self { seconds, formatted }
    }
}

/// Source playlist metadata carried by songs imported from a foreign catalog.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistMeta {
    /// Foreign platform name (for example `spotify`).
    pub platform: String,
    /// 1-based position of the song inside the imported playlist.
    pub index: usize,
    /// Number of items processed from the playlist.
    pub total: usize,
    /// Playlist display name.
    pub name: String,
    /// Playlist id on the foreign platform.
    pub id: String,
}

/// Bookkeeping attached to a song once it enters a queue.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SongInternal {
    /// User (or [`AUTOPLAY_REQUESTOR`]) that queued the song.
    pub requestor: String,
    /// `true` when the song came from the autoplay suggestion pool.
    pub suggested: bool,
    /// Originating playlist, when imported as part of a batch.
    pub playlist: Option<PlaylistMeta>,
}

/// Canonical catalog track.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Song {
    /// Stable catalog id.
    pub id: String,
    /// Track title.
    pub title: String,
    /// Artist names, primary artist first.
    pub artists: Vec<String>,
    /// Album name.
    pub album: String,
    /// Album id in the catalog.
    pub album_id: String,
    /// Track duration.
    pub duration: SongDuration,
    /// Cover art URL.
    pub cover: String,
    /// Mix seed id used to derive autoplay suggestions.
    pub mix_id: Option<String>,
    /// Queue bookkeeping.
    pub internal: SongInternal,
}

impl Song {
    /// First listed artist, if any.
    pub fn primary_artist(&self) -> Option<&str> {
        self.artists.first().map(String::as_str)
    }
}

/// Playback state of one session queue.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No stream is active.
    #[default]
    Idle,
    /// A stream is attached and producing frames.
    Playing,
    /// A stream is attached but frame delivery is held.
    Paused,
}

/// Repeat policy applied when a song finishes.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Advance normally.
    #[default]
    Off,
    /// Replay the current song indefinitely.
    One,
    /// Re-enqueue the current song at the tail of upcoming after it plays.
    All,
}

/// Feature toggles of a session queue.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueFeatures {
    pub repeat: RepeatMode,
    pub shuffle: bool,
    pub autoplay: bool,
    /// Reject control operations coming from observers.
    pub locked: bool,
}

/// One segment of a song's compressed stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentRef {
    /// Absolute URI or path of the segment.
    pub uri: String,
    /// Nominal duration in seconds.
    pub duration_secs: f64,
}

/// Events pushed to attached observers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObserverEvent {
    /// Full snapshot, sent once to each new observer.
    Initial {
        current: Option<Song>,
        previous: Vec<Song>,
        upcoming: Vec<Song>,
        suggestions: Vec<Song>,
        state: PlaybackState,
        elapsed_seconds: u64,
    },
    StateChanged {
        state: PlaybackState,
    },
    QueueUpdated {
        current: Option<Song>,
        previous: Vec<Song>,
        upcoming: Vec<Song>,
        suggestions: Vec<Song>,
    },
    Progress {
        elapsed_seconds: u64,
        segment: usize,
        total_segments: usize,
    },
    Error {
        message: String,
    },
}

/// Control operations observers may send back to a session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlOp {
    Pause,
    Resume,
    Next,
    Last,
    Seek { offset_seconds: f64 },
    /// 1-based position in upcoming.
    Jump { index: usize },
    /// 0-based position in upcoming.
    Remove { index: usize },
    Move { from: usize, to: usize },
    /// 0-based position in previous.
    Replay { index: usize },
}
