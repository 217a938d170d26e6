//! Playback queue model: history, current song, upcoming and suggestions.
//!
//! Pure state, no I/O. The owning session serializes access behind its queue
//! lock, starts streams for whatever ends up in `current`, and broadcasts
//! snapshots after each mutation.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use relay_types::{PlaybackState, QueueFeatures, RepeatMode, Song};
use thiserror::Error;

/// Rejected queue navigation. The queue is left untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("position 0 is not a valid queue position")]
    ZeroIndex,
    #[error("position {index} is out of range ({len} songs)")]
    OutOfRange { index: isize, len: usize },
    #[error("nothing left to play")]
    Exhausted,
}

/// Owned copy of the queue for observers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueSnapshot {
    pub current: Option<Song>,
    pub previous: Vec<Song>,
    pub upcoming: Vec<Song>,
    pub suggestions: Vec<Song>,
    pub state: PlaybackState,
    pub features: QueueFeatures,
}

pub struct PlaybackQueue {
    previous: Vec<Song>,
    current: Option<Song>,
    upcoming: Vec<Song>,
    suggestions: Vec<Song>,
    state: PlaybackState,
    features: QueueFeatures,
    rng: StdRng,
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue with a deterministic shuffle order.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            previous: Vec::new(),
            current: None,
            upcoming: Vec::new(),
            suggestions: Vec::new(),
            state: PlaybackState::Idle,
            features: QueueFeatures::default(),
            rng,
        }
    }

    pub fn current(&self) -> Option<&Song> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> &[Song] {
        &self.previous
    }

    pub fn upcoming(&self) -> &[Song] {
        &self.upcoming
    }

    pub fn suggestions(&self) -> &[Song] {
        &self.suggestions
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn set_state(&mut self, state: PlaybackState) {
        self.state = state;
    }

    pub fn features(&self) -> QueueFeatures {
        self.features
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        self.features.repeat = repeat;
    }

    /// Enabling shuffle also reshuffles what is already upcoming.
    pub fn set_shuffle(&mut self, shuffle: bool) {
        if shuffle && !self.features.shuffle {
            self.upcoming.shuffle(&mut self.rng);
        }
        self.features.shuffle = shuffle;
    }

    pub fn set_autoplay(&mut self, autoplay: bool) {
        self.features.autoplay = autoplay;
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.features.locked = locked;
    }

    /// Unified navigation.
    ///
    /// `index > 0` is a 1-based position in upcoming; skipped songs move to
    /// history. `index < 0` counts back through history (`-1` is the most recent
    /// entry); the current song and every newer history entry return to the
    /// front of upcoming in their original order.
    pub fn move_to(&mut self, index: isize) -> Result<(), QueueError> {
        match index {
            0 => Err(QueueError::ZeroIndex),
            i if i > 0 => self.move_forward(i as usize),
            i => self.move_back(i.unsigned_abs()),
        }
    }

    fn move_forward(&mut self, position: usize) -> Result<(), QueueError> {
        if position > self.upcoming.len() {
            return Err(QueueError::OutOfRange {
                index: position as isize,
                len: self.upcoming.len(),
            });
        }

        if let Some(current) = self.current.take() {
            if self.features.repeat == RepeatMode::All {
                self.upcoming.push(current.clone());
            }
            self.previous.push(current);
        }

        let rest = self.upcoming.split_off(position);
        let mut skipped = std::mem::replace(&mut self.upcoming, rest);
        self.current = skipped.pop();
        self.previous.extend(skipped);

        if self.features.shuffle {
            self.upcoming.shuffle(&mut self.rng);
        }
        Ok(())
    }

    fn move_back(&mut self, steps: usize) -> Result<(), QueueError> {
        if steps > self.previous.len() {
            return Err(QueueError::OutOfRange {
                index: -(steps as isize),
                len: self.previous.len(),
            });
        }

        let target_at = self.previous.len() - steps;
        let mut newer = self.previous.split_off(target_at);
        let target = newer.remove(0);

        let mut restored = newer;
        restored.extend(self.current.take());
        restored.append(&mut self.upcoming);
        self.upcoming = restored;
        self.current = Some(target);
        Ok(())
    }

    /// Advance to the next song.
    ///
    /// With nothing upcoming, autoplay pulls the head suggestion in first; under
    /// Repeat-All a lone current song replays (it is still recorded in history).
    pub fn next(&mut self) -> Result<(), QueueError> {
        if self.upcoming.is_empty() {
            if self.features.autoplay && !self.suggestions.is_empty() {
                let suggestion = self.suggestions.remove(0);
                self.upcoming.push(suggestion);
            } else if self.features.repeat == RepeatMode::All {
                if let Some(current) = self.current.as_ref() {
                    self.previous.push(current.clone());
                    return Ok(());
                }
            }
        }
        if self.upcoming.is_empty() {
            return Err(QueueError::Exhausted);
        }
        self.move_to(1)
    }

    pub fn last(&mut self) -> Result<(), QueueError> {
        self.move_to(-1)
    }

    /// Jump to the 1-based upcoming position `n`.
    pub fn jump(&mut self, n: usize) -> Result<(), QueueError> {
        self.move_to(n as isize)
    }

    /// Make the 0-based history entry `i` current again.
    pub fn replay(&mut self, i: usize) -> Result<(), QueueError> {
        if i >= self.previous.len() {
            return Err(QueueError::OutOfRange {
                index: i as isize,
                len: self.previous.len(),
            });
        }
        let steps = self.previous.len() - i;
        self.move_to(-(steps as isize))
    }

    /// Remove the 0-based upcoming entry `i`.
    pub fn remove(&mut self, i: usize) -> Result<Song, QueueError> {
        if i >= self.upcoming.len() {
            return Err(QueueError::OutOfRange {
                index: i as isize,
                len: self.upcoming.len(),
            });
        }
        Ok(self.upcoming.remove(i))
    }

    /// Relocate one upcoming entry. `to` refers to positions before the removal.
    pub fn move_upcoming(&mut self, from: usize, to: usize) -> Result<(), QueueError> {
        let len = self.upcoming.len();
        for index in [from, to] {
            if index >= len {
                return Err(QueueError::OutOfRange {
                    index: index as isize,
                    len,
                });
            }
        }
        if from == to {
            return Ok(());
        }
        let song = self.upcoming.remove(from);
        let target = if to > from { to - 1 } else { to };
        self.upcoming.insert(target, song);
        Ok(())
    }

    /// Drop history, current and upcoming. Suggestions survive.
    pub fn clear(&mut self) {
        self.previous.clear();
        self.current = None;
        self.upcoming.clear();
    }

    /// Queue `song` for `requestor`.
    ///
    /// Returns 0 when it became current, else its 1-based upcoming position.
    pub fn add(&mut self, mut song: Song, requestor: &str) -> usize {
        song.internal.requestor = requestor.to_string();
        if self.current.is_none() {
            self.current = Some(song);
            return 0;
        }
        self.upcoming.push(song);
        self.upcoming.len()
    }

    /// Retire the current song into history once nothing follows it.
    pub fn finish_current(&mut self) {
        if let Some(current) = self.current.take() {
            self.previous.push(current);
        }
    }

    /// Song autoplay derives suggestions from: latest history entry, else current.
    pub fn seed_song(&self) -> Option<&Song> {
        self.previous.last().or(self.current.as_ref())
    }

    /// Whether autoplay should top up suggestions.
    pub fn needs_suggestions(&self, refill_below: usize) -> bool {
        self.features.autoplay
            && self.suggestions.len() < refill_below
            && self.seed_song().is_some()
    }

    pub fn extend_suggestions(&mut self, songs: Vec<Song>) {
        self.suggestions.extend(songs);
    }

    pub fn replace_suggestions(&mut self, songs: Vec<Song>) {
        self.suggestions = songs;
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.clone(),
            previous: self.previous.clone(),
            upcoming: self.upcoming.clone(),
            suggestions: self.suggestions.clone(),
            state: self.state,
            features: self.features,
        }
    }
}

#[cfg(test)]
pub(crate) fn song(id: &str) -> Song {
    Song {
        id: id.to_string(),
        title: format!("Title {id}"),
        artists: vec![format!("Artist {id}")],
        ..Song::default()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn ids(songs: &[Song]) -> Vec<&str> {
        songs.iter().map(|s| s.id.as_str()).collect()
    }

    fn current_id(q: &PlaybackQueue) -> Option<&str> {
        q.current().map(|s| s.id.as_str())
    }

    fn queue_with(current: &str, upcoming: &[&str]) -> PlaybackQueue {
        let mut q = PlaybackQueue::seeded(7);
        q.add(song(current), "user");
        for id in upcoming {
            q.add(song(id), "user");
        }
        q
    }

    #[test]
    fn add_returns_positions() {
        let mut q = PlaybackQueue::seeded(1);
        assert_eq!(q.add(song("X"), "u"), 0);
        assert_eq!(q.add(song("A"), "u"), 1);
        assert_eq!(q.add(song("B"), "u"), 2);
        assert_eq!(q.current().unwrap().internal.requestor, "u");
    }

    #[test]
    fn jump_moves_skipped_songs_to_history() {
        let mut q = queue_with("X", &["A", "B", "C"]);
        q.jump(2).unwrap();
        assert_eq!(current_id(&q), Some("B"));
        assert_eq!(ids(q.previous()), vec!["X", "A"]);
        assert_eq!(ids(q.upcoming()), vec!["C"]);
    }

    #[test]
    fn move_adjusts_target_after_removal() {
        let mut q = queue_with("X", &["A", "B", "C"]);
        q.move_upcoming(0, 2).unwrap();
        assert_eq!(ids(q.upcoming()), vec!["B", "A", "C"]);
        q.move_upcoming(2, 0).unwrap();
        assert_eq!(ids(q.upcoming()), vec!["C", "B", "A"]);
        q.move_upcoming(1, 1).unwrap();
        assert_eq!(ids(q.upcoming()), vec!["C", "B", "A"]);
        assert!(q.move_upcoming(0, 3).is_err());
    }

    #[test]
    fn replay_restores_newer_history_in_order() {
        let mut q = queue_with("A", &["B", "C", "D", "E"]);
        q.jump(3).unwrap();
        assert_eq!(ids(q.previous()), vec!["A", "B", "C"]);
        assert_eq!(current_id(&q), Some("D"));

        q.replay(1).unwrap();
        assert_eq!(current_id(&q), Some("B"));
        assert_eq!(ids(q.previous()), vec!["A"]);
        assert_eq!(ids(q.upcoming()), vec!["C", "D", "E"]);
    }

    #[test]
    fn last_steps_back_once() {
        let mut q = queue_with("A", &["B", "C"]);
        q.next().unwrap();
        q.last().unwrap();
        assert_eq!(current_id(&q), Some("A"));
        assert!(q.previous().is_empty());
        assert_eq!(ids(q.upcoming()), vec!["B", "C"]);
    }

    #[test]
    fn repeat_all_reappends_finished_song() {
        let mut q = queue_with("X", &["A"]);
        q.set_repeat(RepeatMode::All);
        q.next().unwrap();
        assert_eq!(current_id(&q), Some("A"));
        assert_eq!(ids(q.previous()), vec!["X"]);
        assert_eq!(ids(q.upcoming()), vec!["X"]);
    }

    #[test]
    fn repeat_all_with_single_song_keeps_playing_it() {
        let mut q = queue_with("X", &[]);
        q.set_repeat(RepeatMode::All);
        q.next().unwrap();
        assert_eq!(current_id(&q), Some("X"));
        assert_eq!(ids(q.previous()), vec!["X"]);
    }

    #[test]
    fn next_pulls_suggestion_when_autoplay_is_on() {
        let mut q = queue_with("X", &[]);
        q.extend_suggestions(vec![song("S1"), song("S2")]);
        assert_eq!(q.next(), Err(QueueError::Exhausted));

        q.set_autoplay(true);
        q.next().unwrap();
        assert_eq!(current_id(&q), Some("S1"));
        assert_eq!(ids(q.suggestions()), vec!["S2"]);
    }

    #[test]
    fn invalid_navigation_leaves_queue_untouched() {
        let mut q = queue_with("X", &["A", "B"]);
        let before = q.snapshot();
        assert_eq!(q.move_to(0), Err(QueueError::ZeroIndex));
        assert!(matches!(q.jump(3), Err(QueueError::OutOfRange { .. })));
        assert!(matches!(q.last(), Err(QueueError::OutOfRange { .. })));
        assert!(matches!(q.replay(0), Err(QueueError::OutOfRange { .. })));
        assert!(matches!(q.remove(2), Err(QueueError::OutOfRange { .. })));
        assert_eq!(q.snapshot(), before);
    }

    #[test]
    fn clear_keeps_suggestions() {
        let mut q = queue_with("X", &["A"]);
        q.next().unwrap();
        q.extend_suggestions(vec![song("S")]);
        q.clear();
        assert!(q.current().is_none());
        assert!(q.previous().is_empty());
        assert!(q.upcoming().is_empty());
        assert_eq!(ids(q.suggestions()), vec!["S"]);
    }

    #[test]
    fn shuffle_keeps_the_same_songs() {
        let mut q = queue_with("X", &["A", "B", "C", "D", "E", "F"]);
        q.set_shuffle(true);
        q.next().unwrap();
        let mut rest: Vec<&str> = ids(q.upcoming());
        rest.push(current_id(&q).unwrap());
        rest.sort();
        assert_eq!(rest, vec!["A", "B", "C", "D", "E", "F"]);
    }

    #[test]
    fn seed_prefers_latest_history() {
        let mut q = queue_with("X", &["A"]);
        assert_eq!(q.seed_song().unwrap().id, "X");
        q.next().unwrap();
        assert_eq!(q.seed_song().unwrap().id, "X");
        q.finish_current();
        assert_eq!(q.seed_song().unwrap().id, "A");
        assert!(PlaybackQueue::seeded(0).seed_song().is_none());
    }

    #[test]
    fn needs_suggestions_only_with_autoplay_and_history() {
        let mut q = PlaybackQueue::seeded(3);
        q.set_autoplay(true);
        assert!(!q.needs_suggestions(2));
        q.add(song("X"), "u");
        assert!(q.needs_suggestions(2));
        q.extend_suggestions(vec![song("S1"), song("S2")]);
        assert!(!q.needs_suggestions(2));
    }

    #[test]
    fn navigation_conserves_added_songs() {
        let mut rng = StdRng::seed_from_u64(99);
        for round in 0..50 {
            let mut q = PlaybackQueue::seeded(round);
            let mut added: Vec<String> = Vec::new();
            for i in 0..rng.gen_range(1..12) {
                let id = format!("song-{i}");
                q.add(song(&id), "u");
                added.push(id);
            }
            q.set_shuffle(rng.gen_bool(0.5));

            for _ in 0..40 {
                let _ = match rng.gen_range(0..4) {
                    0 => q.next(),
                    1 => q.last(),
                    2 => q.jump(rng.gen_range(1..4)),
                    _ => q.replay(rng.gen_range(0..4)),
                };
                let mut seen: Vec<String> = q
                    .previous()
                    .iter()
                    .chain(q.current())
                    .chain(q.upcoming())
                    .map(|s| s.id.clone())
                    .collect();
                seen.sort();
                let mut expected = added.clone();
                expected.sort();
                assert_eq!(seen, expected);
            }
        }
    }
}
