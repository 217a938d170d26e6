//! Autoplay suggestions derived from a seed song's mix.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use relay_types::{AUTOPLAY_REQUESTOR, Song};

#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    /// Resolve the mix seeded by a catalog track.
    async fn fetch_mix_id(&self, track_id: &str) -> Result<String>;
    /// Ordered member tracks of a mix.
    async fn fetch_mix_items(&self, mix_id: &str) -> Result<Vec<Song>>;
}

/// Provider for deployments without a catalog; every lookup fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSuggestions;

#[async_trait]
impl SuggestionProvider for NoSuggestions {
    async fn fetch_mix_id(&self, track_id: &str) -> Result<String> {
        anyhow::bail!("no suggestion provider configured (track {track_id})")
    }

    async fn fetch_mix_items(&self, mix_id: &str) -> Result<Vec<Song>> {
        anyhow::bail!("no suggestion provider configured (mix {mix_id})")
    }
}

/// Fetch the mix members for `seed`, looking up its mix id when it has none.
pub async fn fetch_mix(provider: &dyn SuggestionProvider, seed: &Song) -> Result<Vec<Song>> {
    let mix_id = match seed.mix_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => provider
            .fetch_mix_id(&seed.id)
            .await
            .with_context(|| format!("fetch mix id for {}", seed.id))?,
    };
    provider
        .fetch_mix_items(&mix_id)
        .await
        .with_context(|| format!("fetch mix {mix_id}"))
}

/// Drop the seed, shuffle, keep `count` and mark the survivors as suggestions.
pub fn pick_suggestions<R: Rng + ?Sized>(
    items: Vec<Song>,
    seed_id: &str,
    count: usize,
    rng: &mut R,
) -> Vec<Song> {
    let mut picked: Vec<Song> = items.into_iter().filter(|song| song.id != seed_id).collect();
    picked.shuffle(rng);
    picked.truncate(count);
    for song in &mut picked {
        song.internal.suggested = true;
        song.internal.requestor = AUTOPLAY_REQUESTOR.to_string();
    }
    picked
}

/// Fetch and pick suggestions for `seed` in one step.
pub async fn generate_suggestions(
    provider: &dyn SuggestionProvider,
    seed: &Song,
    count: usize,
) -> Result<Vec<Song>> {
    let items = fetch_mix(provider, seed).await?;
    let picked = pick_suggestions(items, &seed.id, count, &mut rand::thread_rng());
    tracing::debug!(seed = %seed.id, count = picked.len(), "autoplay suggestions generated");
    Ok(picked)
}
