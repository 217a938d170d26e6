//! Background task that serializes a session's asynchronous reactions.
//!
//! Stream ends and timer expiry run inline, in arrival order. Suggestion and
//! plan lookups are spawned so they never delay a stream end. The worker holds
//! only a weak reference; dropping the last session handle ends it.

use std::sync::Weak;

use tokio::sync::mpsc;

use crate::session::PlaybackSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCommand {
    /// The sink drained a stream; stale generations are ignored.
    StreamEnded { generation: u64 },
    RefreshSuggestions { replace: bool },
    Prewarm { song_id: String },
    InactivityExpired,
    Shutdown,
}

pub(crate) async fn run(
    session: Weak<PlaybackSession>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    while let Some(command) = commands.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match command {
            SessionCommand::Shutdown => {
                tracing::debug!(session = %session.id(), "session worker stopping");
                break;
            }
            SessionCommand::StreamEnded { generation } => {
                session.handle_stream_ended(generation).await;
            }
            SessionCommand::RefreshSuggestions { replace } => {
                tokio::spawn(async move {
                    session.refresh_suggestions(replace).await;
                });
            }
            SessionCommand::Prewarm { song_id } => {
                tokio::spawn(async move {
                    session.prewarm(song_id).await;
                });
            }
            SessionCommand::InactivityExpired => session.inactivity_expired(),
        }
    }
}
