//! Configuration loading and parsing.
//!
//! Defines the hub config schema and resolves defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use relay_player::config::TranscodeConfig;
use relay_player::encode::FrameEncoding;
use serde::Deserialize;

use crate::session::SessionSettings;

/// Top-level hub configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct HubConfig {
    /// Transport codec settings.
    pub transcode: Option<TranscodeSection>,
    /// Session and queue policy settings.
    pub playback: Option<PlaybackSection>,
    /// Where song segments come from.
    pub segments: Option<SegmentsSection>,
}

/// `[transcode]` table.
#[derive(Debug, Default, Deserialize)]
pub struct TranscodeSection {
    pub sample_rate: Option<u32>,
    pub channels: Option<usize>,
    pub frame_duration_ms: Option<u32>,
    pub bitrate_bps: Option<u32>,
    pub max_packet_bytes: Option<usize>,
    /// `opus` (default) or `pcm`.
    pub encoding: Option<String>,
}

/// `[playback]` table.
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackSection {
    /// Fetch loop backpressure poll interval (default: 100).
    pub fetch_poll_ms: Option<u64>,
    /// Idle seconds before teardown (default: 3600).
    pub inactivity_secs: Option<u64>,
    /// Idle seconds before teardown with autoplay on (default: 10800).
    pub autoplay_inactivity_secs: Option<u64>,
    pub suggestion_count: Option<usize>,
    pub suggestion_refill_below: Option<usize>,
    pub max_start_failures: Option<u32>,
    /// Per-session observer event buffer (default: 64).
    pub event_capacity: Option<usize>,
    pub registry_shards: Option<usize>,
    /// Sink wait per `provide_frame` call (default: 20).
    pub frame_wait_ms: Option<u64>,
}

/// `[segments]` table.
#[derive(Debug, Default, Deserialize)]
pub struct SegmentsSection {
    /// Local song directory root.
    pub dir: Option<String>,
    /// HLS playlist URL template containing `{id}`.
    pub playlist_url: Option<String>,
    /// HTTP timeout for playlist and segment requests (default: 10).
    pub http_timeout_secs: Option<u64>,
}

/// Resolved segment source choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentsConfig {
    Directory(PathBuf),
    Hls { playlist_url: String, timeout: Duration },
}

impl HubConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<HubConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Resolve the transport codec settings, rejecting unusable values.
pub fn transcode_from_config(cfg: &HubConfig) -> Result<TranscodeConfig> {
    let defaults = TranscodeConfig::default();
    let Some(section) = cfg.transcode.as_ref() else {
        return Ok(defaults);
    };
    let resolved = TranscodeConfig {
        sample_rate: section.sample_rate.unwrap_or(defaults.sample_rate),
        channels: section.channels.unwrap_or(defaults.channels),
        frame_duration_ms: section.frame_duration_ms.unwrap_or(defaults.frame_duration_ms),
        bitrate_bps: section.bitrate_bps.unwrap_or(defaults.bitrate_bps),
        max_packet_bytes: section.max_packet_bytes.unwrap_or(defaults.max_packet_bytes),
    };
    if resolved.sample_rate == 0 {
        anyhow::bail!("transcode.sample_rate must be positive");
    }
    if !(1..=2).contains(&resolved.channels) {
        anyhow::bail!("transcode.channels must be 1 or 2, got {}", resolved.channels);
    }
    if resolved.frame_duration_ms == 0 || resolved.frame_duration_ms > 1000 {
        anyhow::bail!(
            "transcode.frame_duration_ms must be within 1..=1000, got {}",
            resolved.frame_duration_ms
        );
    }
    if resolved.max_packet_bytes == 0 {
        anyhow::bail!("transcode.max_packet_bytes must be positive");
    }
    Ok(resolved)
}

/// Resolve the transport frame encoding (default: opus).
pub fn encoding_from_config(cfg: &HubConfig) -> Result<FrameEncoding> {
    let Some(name) = cfg.transcode.as_ref().and_then(|t| t.encoding.as_deref()) else {
        return Ok(FrameEncoding::default());
    };
    FrameEncoding::parse(name)
        .ok_or_else(|| anyhow::anyhow!("transcode.encoding must be opus or pcm, got {name:?}"))
}

/// Resolve session settings from the `[playback]` table.
pub fn settings_from_config(cfg: &HubConfig) -> SessionSettings {
    let defaults = SessionSettings::default();
    let Some(section) = cfg.playback.as_ref() else {
        return defaults;
    };
    SessionSettings {
        fetch_poll: section
            .fetch_poll_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.fetch_poll),
        inactivity: section
            .inactivity_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.inactivity),
        autoplay_inactivity: section
            .autoplay_inactivity_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.autoplay_inactivity),
        suggestion_count: section.suggestion_count.unwrap_or(defaults.suggestion_count),
        suggestion_refill_below: section
            .suggestion_refill_below
            .unwrap_or(defaults.suggestion_refill_below)
            .max(1),
        max_start_failures: section
            .max_start_failures
            .unwrap_or(defaults.max_start_failures)
            .max(1),
        event_capacity: section.event_capacity.unwrap_or(defaults.event_capacity).max(1),
        frame_wait: section
            .frame_wait_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.frame_wait),
    }
}

/// Number of session registry shards (default: 16).
pub fn registry_shards_from_config(cfg: &HubConfig) -> usize {
    cfg.playback
        .as_ref()
        .and_then(|playback| playback.registry_shards)
        .unwrap_or(16)
        .max(1)
}

/// Pick the segment source: a local directory wins over an HLS template.
pub fn segments_from_config(cfg: &HubConfig) -> Result<SegmentsConfig> {
    let section = cfg
        .segments
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("[segments] is required in config"))?;
    if let Some(dir) = section.dir.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        return Ok(SegmentsConfig::Directory(PathBuf::from(dir)));
    }
    let playlist_url = section
        .playlist_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("segments.dir or segments.playlist_url is required"))?;
    if !playlist_url.contains("{id}") {
        anyhow::bail!("segments.playlist_url must contain {{id}}: {playlist_url}");
    }
    Ok(SegmentsConfig::Hls {
        playlist_url: playlist_url.to_string(),
        timeout: Duration::from_secs(section.http_timeout_secs.unwrap_or(10)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> HubConfig {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn empty_config_resolves_to_defaults() {
        let cfg = parse("");
        assert_eq!(transcode_from_config(&cfg).unwrap(), TranscodeConfig::default());
        let settings = settings_from_config(&cfg);
        assert_eq!(settings.fetch_poll, Duration::from_millis(100));
        assert_eq!(settings.event_capacity, 64);
        assert_eq!(registry_shards_from_config(&cfg), 16);
    }

    #[test]
    fn playback_overrides_apply() {
        let cfg = parse(
            r#"
            [playback]
            inactivity_secs = 30
            suggestion_count = 8
            registry_shards = 4
            "#,
        );
        let settings = settings_from_config(&cfg);
        assert_eq!(settings.inactivity, Duration::from_secs(30));
        assert_eq!(settings.autoplay_inactivity, Duration::from_secs(10_800));
        assert_eq!(settings.suggestion_count, 8);
        assert_eq!(registry_shards_from_config(&cfg), 4);
    }

    #[test]
    fn transcode_rejects_bad_channel_count() {
        let cfg = parse("[transcode]\nchannels = 6\n");
        assert!(transcode_from_config(&cfg).is_err());
        let cfg = parse("[transcode]\nframe_duration_ms = 0\n");
        assert!(transcode_from_config(&cfg).is_err());
    }

    #[test]
    fn transcode_overrides_apply() {
        let cfg = parse("[transcode]\nsample_rate = 24000\nchannels = 1\n");
        let transcode = transcode_from_config(&cfg).unwrap();
        assert_eq!(transcode.sample_rate, 24_000);
        assert_eq!(transcode.channels, 1);
        assert_eq!(transcode.frame_duration_ms, 20);
    }

    #[test]
    fn encoding_defaults_to_opus() {
        assert_eq!(encoding_from_config(&parse("")).unwrap(), FrameEncoding::Opus);
        let cfg = parse("[transcode]\nencoding = \"pcm\"\n");
        assert_eq!(encoding_from_config(&cfg).unwrap(), FrameEncoding::Pcm);
        let cfg = parse("[transcode]\nencoding = \"flac\"\n");
        assert!(encoding_from_config(&cfg).is_err());
    }

    #[test]
    fn segments_prefers_directory() {
        let cfg = parse(
            r#"
            [segments]
            dir = "/srv/songs"
            playlist_url = "https://cdn.example/{id}/index.m3u8"
            "#,
        );
        assert_eq!(
            segments_from_config(&cfg).unwrap(),
            SegmentsConfig::Directory(PathBuf::from("/srv/songs"))
        );
    }

    #[test]
    fn segments_playlist_template_needs_placeholder() {
        let cfg = parse("[segments]\nplaylist_url = \"https://cdn.example/index.m3u8\"\n");
        assert!(segments_from_config(&cfg).is_err());

        let cfg = parse(
            "[segments]\nplaylist_url = \"https://cdn.example/{id}.m3u8\"\nhttp_timeout_secs = 3\n",
        );
        assert_eq!(
            segments_from_config(&cfg).unwrap(),
            SegmentsConfig::Hls {
                playlist_url: "https://cdn.example/{id}.m3u8".into(),
                timeout: Duration::from_secs(3),
            }
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = HubConfig::load(Path::new("/nonexistent/relay-hub.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
