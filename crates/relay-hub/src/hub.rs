//! Process-wide entry point: builds sessions on demand and tracks them.

use std::sync::{Arc, Weak};

use crate::registry::SessionRegistry;
use crate::session::{PlaybackSession, SessionDeps, SessionSettings};

pub struct PlaybackHub {
    registry: Arc<SessionRegistry<PlaybackSession>>,
    settings: SessionSettings,
    deps: SessionDeps,
}

impl PlaybackHub {
    pub fn new(settings: SessionSettings, deps: SessionDeps, shards: usize) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(shards)),
            settings,
            deps,
        }
    }

    /// Session for `id`, created on first use. Must run inside a tokio runtime.
    ///
    /// A closed session unregisters itself, so the next call builds a fresh one.
    pub fn session(&self, id: &str) -> Arc<PlaybackSession> {
        self.registry.get_or_create(id, || {
            let session = PlaybackSession::spawn(id, self.settings.clone(), self.deps.clone());
            let registry = Arc::downgrade(&self.registry);
            let this = Arc::downgrade(&session);
            session.on_closed(move |id| unregister(&registry, &this, id));
            session
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<PlaybackSession>> {
        self.registry.get(id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Close every session, e.g. on shutdown.
    pub fn close_all(&self) {
        for session in self.registry.sessions() {
            session.close();
        }
    }
}

fn unregister(
    registry: &Weak<SessionRegistry<PlaybackSession>>,
    session: &Weak<PlaybackSession>,
    id: &str,
) {
    if let Some(registry) = registry.upgrade() {
        registry.remove_if(id, |stored| std::ptr::eq(Arc::as_ptr(stored), session.as_ptr()));
    }
}
