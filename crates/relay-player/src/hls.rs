//! HLS playlists and the HTTP segment source.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use relay_types::SegmentRef;

use crate::source::{SegmentPlan, SegmentSource};

/// A parsed `.m3u8` document.
#[derive(Clone, Debug, PartialEq)]
pub enum Playlist {
    /// Segment list of a single rendition.
    Media(Vec<SegmentRef>),
    /// Variant stream URIs, in document order.
    Master(Vec<String>),
}

/// Parse an m3u8 playlist, resolving every URI through `resolve`.
pub fn parse_playlist(body: &str, resolve: impl Fn(&str) -> String) -> Result<Playlist> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("#EXTM3U") => {}
        _ => bail!("playlist is missing #EXTM3U header"),
    }

    let mut segments = Vec::new();
    let mut variants = Vec::new();
    let mut pending_duration: Option<f64> = None;
    let mut pending_variant = false;

    for line in lines {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let value = rest.split(',').next().unwrap_or_default().trim();
            let duration = value
                .parse::<f64>()
                .with_context(|| format!("parse EXTINF duration {value:?}"))?;
            pending_duration = Some(duration);
        } else if line.starts_with("#EXT-X-STREAM-INF") {
            pending_variant = true;
        } else if line.starts_with('#') {
            continue;
        } else if pending_variant {
            variants.push(resolve(line));
            pending_variant = false;
        } else {
            segments.push(SegmentRef {
                uri: resolve(line),
                duration_secs: pending_duration.take().unwrap_or(0.0),
            });
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Master(variants));
    }
    if segments.is_empty() {
        bail!("playlist has no segments");
    }
    Ok(Playlist::Media(segments))
}

/// Resolve `uri` against the URL of the document that referenced it.
pub fn resolve_url(base: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    let base = base.split(['?', '#']).next().unwrap_or(base);
    // End of "scheme://authority"; a base without a scheme has no origin.
    let origin_end = base.find("://").map(|scheme| {
        let authority = scheme + 3;
        base[authority..]
            .find('/')
            .map_or(base.len(), |i| authority + i)
    });
    if let Some(path) = uri.strip_prefix('/') {
        let end = origin_end.unwrap_or(base.len());
        return format!("{}/{}", &base[..end], path);
    }
    match (origin_end, base.rfind('/')) {
        (Some(origin), _) if origin == base.len() => format!("{base}/{uri}"),
        (_, Some(end)) => format!("{}/{}", &base[..end], uri),
        (_, None) => uri.to_string(),
    }
}

/// Maps a catalog song id to its HLS playlist URL.
pub trait ManifestLocator: Send + Sync {
    fn playlist_url(&self, song_id: &str) -> Result<String>;
}

/// Builds playlist URLs by substituting `{id}` in a template.
#[derive(Clone, Debug)]
pub struct TemplateLocator {
    template: String,
}

impl TemplateLocator {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl ManifestLocator for TemplateLocator {
    fn playlist_url(&self, song_id: &str) -> Result<String> {
        if !self.template.contains("{id}") {
            bail!("manifest template has no {{id}} placeholder");
        }
        Ok(self.template.replace("{id}", song_id))
    }
}

/// Fetches HLS playlists and segments over HTTP.
pub struct HlsSegmentSource {
    agent: ureq::Agent,
    locator: Box<dyn ManifestLocator>,
}

impl HlsSegmentSource {
    pub fn new(locator: Box<dyn ManifestLocator>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            locator,
        }
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        let resp = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("request playlist {url}"))?;
        resp.into_body()
            .read_to_string()
            .with_context(|| format!("read playlist {url}"))
    }
}

impl SegmentSource for HlsSegmentSource {
    fn plan(&self, song_id: &str) -> Result<SegmentPlan> {
        let mut url = self.locator.playlist_url(song_id)?;
        // Master playlists are followed one level, to their first variant.
        for _ in 0..2 {
            let body = self.fetch_text(&url)?;
            match parse_playlist(&body, |uri| resolve_url(&url, uri))? {
                Playlist::Media(segments) => {
                    tracing::debug!(song_id, segments = segments.len(), "segment plan loaded");
                    return Ok(SegmentPlan::new(song_id, segments));
                }
                Playlist::Master(variants) => match variants.into_iter().next() {
                    Some(variant) => url = variant,
                    None => bail!("master playlist without variants"),
                },
            }
        }
        bail!("playlist nesting too deep for {song_id}")
    }

    fn fetch(&self, segment: &SegmentRef) -> Result<Vec<u8>> {
        let resp = self
            .agent
            .get(&segment.uri)
            .call()
            .with_context(|| format!("request segment {}", segment.uri))?;
        resp.into_body()
            .read_to_vec()
            .with_context(|| format!("read segment {}", segment.uri))
    }
}
