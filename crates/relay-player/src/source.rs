//! Segment sources: where a song's compressed segments come from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use relay_types::SegmentRef;

use crate::hls::{Playlist, parse_playlist};

/// Ordered segments of one song.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentPlan {
    pub song_id: String,
    pub segments: Vec<SegmentRef>,
}

impl SegmentPlan {
    pub fn new(song_id: impl Into<String>, segments: Vec<SegmentRef>) -> Self {
        Self {
            song_id: song_id.into(),
            segments,
        }
    }

    pub fn total(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of nominal segment durations.
    pub fn total_duration_secs(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_secs).sum()
    }

    /// Segment containing `offset_secs` and the offset at which that segment starts.
    ///
    /// Returns `None` when durations are unknown or the offset is past the end.
    pub fn segment_for_offset(&self, offset_secs: f64) -> Option<(usize, f64)> {
        if !offset_secs.is_finite() || self.total_duration_secs() <= 0.0 {
            return None;
        }
        let target = offset_secs.max(0.0);
        let mut start = 0.0;
        for (index, segment) in self.segments.iter().enumerate() {
            if target < start + segment.duration_secs {
                return Some((index, start));
            }
            start += segment.duration_secs;
        }
        None
    }
}

/// Resolves songs to segment plans and fetches segment bytes.
///
/// Implementations block; the fetch loop calls them from its own thread.
/// Retries and backoff, if any, belong here rather than in the loop.
pub trait SegmentSource: Send + Sync {
    fn plan(&self, song_id: &str) -> Result<SegmentPlan>;
    fn fetch(&self, segment: &SegmentRef) -> Result<Vec<u8>>;
}

/// Serves songs laid out on disk as `<root>/<song_id>/`.
///
/// A song directory either carries an `index.m3u8` media playlist or plain
/// `.ts`/`.aac` segment files, which are then played in file-name order with
/// unknown durations.
#[derive(Clone, Debug)]
pub struct DirectorySegmentSource {
    root: PathBuf,
}

impl DirectorySegmentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn song_dir(&self, song_id: &str) -> Result<PathBuf> {
        if song_id.is_empty() || song_id.contains(['/', '\\']) || song_id == ".." {
            bail!("invalid song id {song_id:?}");
        }
        Ok(self.root.join(song_id))
    }
}

impl SegmentSource for DirectorySegmentSource {
    fn plan(&self, song_id: &str) -> Result<SegmentPlan> {
        let dir = self.song_dir(song_id)?;
        let playlist_path = dir.join("index.m3u8");
        if playlist_path.is_file() {
            let body = std::fs::read_to_string(&playlist_path)
                .with_context(|| format!("read playlist {:?}", playlist_path))?;
            let segments = match parse_playlist(&body, |uri| resolve_path(&dir, uri))? {
                Playlist::Media(segments) => segments,
                Playlist::Master(_) => bail!("master playlists are not supported on disk"),
            };
            return Ok(SegmentPlan::new(song_id, segments));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("read song dir {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("ts") | Some("aac")
                )
            })
            .collect();
        files.sort();
        if files.is_empty() {
            bail!("no segments found in {:?}", dir);
        }
        let segments = files
            .into_iter()
            .map(|path| SegmentRef {
                uri: path.to_string_lossy().to_string(),
                duration_secs: 0.0,
            })
            .collect();
        Ok(SegmentPlan::new(song_id, segments))
    }

    fn fetch(&self, segment: &SegmentRef) -> Result<Vec<u8>> {
        std::fs::read(&segment.uri).with_context(|| format!("read segment {}", segment.uri))
    }
}

fn resolve_path(dir: &Path, uri: &str) -> String {
    let path = Path::new(uri);
    if path.is_absolute() {
        uri.to_string()
    } else {
        dir.join(path).to_string_lossy().to_string()
    }
}
