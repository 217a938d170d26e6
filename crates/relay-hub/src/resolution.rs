//! Ordered parallel resolution of foreign catalog items into canonical songs.
//!
//! Each item is searched in its own task. Workers hand their result back by
//! value together with the item's position, so the output keeps input order no
//! matter which search finishes first. Items that fail to resolve are left out.

use std::sync::Arc;

use async_trait::async_trait;
use relay_types::{PlaylistMeta, Song};
use thiserror::Error;
use tokio::task::JoinSet;

/// Search over the canonical catalog.
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    /// Songs matching `query`, best hit first.
    async fn search_songs(&self, query: &str) -> anyhow::Result<Vec<Song>>;
}

/// One track from a foreign platform.
pub trait ForeignTrack: Send + Sync + 'static {
    fn title(&self) -> &str;
    fn primary_artist(&self) -> &str;
}

/// Where a batch of foreign tracks came from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaylistSource {
    pub platform: String,
    pub name: String,
    pub id: String,
}

/// A foreign playlist that can list all of its tracks.
#[async_trait]
pub trait ForeignPlaylist: Send + Sync {
    type Item: ForeignTrack;

    fn source(&self) -> PlaylistSource;

    async fn fetch_all_items(&self) -> anyhow::Result<Vec<Self::Item>>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("fetch playlist items: {0:#}")]
    Fetch(anyhow::Error),
    #[error("playlist has no items to resolve")]
    Empty,
    #[error("no catalog match for {0:?}")]
    NoMatch(String),
    #[error("catalog search failed: {0:#}")]
    Search(anyhow::Error),
}

fn search_query(item: &dyn ForeignTrack) -> String {
    format!("{} {}", item.title(), item.primary_artist())
        .trim()
        .to_string()
}

/// Resolve one foreign track to the top catalog hit.
pub async fn resolve_track(
    search: &dyn CatalogSearch,
    item: &dyn ForeignTrack,
) -> Result<Song, ResolveError> {
    let query = search_query(item);
    let hits = search
        .search_songs(&query)
        .await
        .map_err(ResolveError::Search)?;
    hits.into_iter()
        .next()
        .ok_or(ResolveError::NoMatch(query))
}

/// Resolve `items` concurrently, returning the hits in input order.
///
/// Every returned song carries `meta` with `index` set to its 1-based
/// position (0 is left for a separately resolved head) and `total` set to the
/// number of items processed.
pub async fn resolve_items<T: ForeignTrack>(
    items: Vec<T>,
    search: Arc<dyn CatalogSearch>,
    meta: PlaylistMeta,
) -> Vec<Song> {
    let total = items.len();
    let mut slots: Vec<Option<Song>> = vec![None; total];
    let mut tasks = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let search = search.clone();
        tasks.spawn(async move {
            let resolved = resolve_track(search.as_ref(), &item).await;
            (index, resolved)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(mut song))) => {
                song.internal.playlist = Some(PlaylistMeta {
                    index: index + 1,
                    total,
                    ..meta.clone()
                });
                slots[index] = Some(song);
            }
            Ok((index, Err(err))) => {
                tracing::debug!(index, error = %err, "playlist item not resolved");
            }
            Err(err) => {
                tracing::warn!(error = %err, "resolution task failed");
            }
        }
    }

    slots.into_iter().flatten().collect()
}

/// Fetch every item of `playlist` and resolve them in order.
///
/// With `ignore_first` the head item is skipped; callers use this when they
/// already resolved it with [`resolve_track`] to start playback early.
pub async fn resolve_playlist<P: ForeignPlaylist>(
    playlist: &P,
    search: Arc<dyn CatalogSearch>,
    ignore_first: bool,
) -> Result<Vec<Song>, ResolveError> {
    let mut items = playlist
        .fetch_all_items()
        .await
        .map_err(ResolveError::Fetch)?;
    if ignore_first && !items.is_empty() {
        items.remove(0);
    }
    if items.is_empty() {
        return Err(ResolveError::Empty);
    }

    let source = playlist.source();
    let meta = PlaylistMeta {
        platform: source.platform,
        index: 0,
        total: items.len(),
        name: source.name,
        id: source.id,
    };
    let requested = items.len();
    let songs = resolve_items(items, search, meta).await;
    tracing::info!(
        playlist = %playlist.source().id,
        requested,
        resolved = songs.len(),
        "playlist resolved"
    );
    Ok(songs)
}
