//! Outbound playback notifications (chat messages in the embedding bot).

use relay_types::Song;

/// Receives user-facing playback notifications for a session.
///
/// Every method defaults to a no-op so integrations implement only what they show.
pub trait PlaybackNotifier: Send + Sync {
    fn now_playing(&self, _session: &str, _song: &Song) {}

    fn queue_ended(&self, _session: &str) {}

    fn playback_failed(&self, _session: &str, _song: &Song, _reason: &str) {}

    fn inactivity_disconnect(&self, _session: &str) {}
}

/// Writes notifications to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingNotifier;

impl PlaybackNotifier for LoggingNotifier {
    fn now_playing(&self, session: &str, song: &Song) {
        tracing::info!(
            session,
            song = %song.title,
            artist = song.primary_artist().unwrap_or_default(),
            requestor = %song.internal.requestor,
            "now playing"
        );
    }

    fn queue_ended(&self, session: &str) {
        tracing::info!(session, "queue ended");
    }

    fn playback_failed(&self, session: &str, song: &Song, reason: &str) {
        tracing::warn!(session, song = %song.title, reason, "playback failed");
    }

    fn inactivity_disconnect(&self, session: &str) {
        tracing::info!(session, "disconnecting after inactivity");
    }
}
