//! Per-session event bus for attached observers.
//!
//! Events are fanned out over a bounded tokio broadcast channel. Delivery is
//! in publish order and at-most-once: an observer that falls more than the
//! channel capacity behind is told how many events it missed and is expected
//! to resynchronise from a fresh `Initial` snapshot.
//!
//! Publishing never takes the queue lock. Sessions snapshot the queue under
//! their own lock, release it, then publish, so a `QueueUpdated` payload can
//! trail a mutation that lands between snapshot and send. Observers converge
//! on the next update; the queue never waits on a slow observer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use relay_types::{ObserverEvent, PlaybackState};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::queue::QueueSnapshot;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ObserverEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ObserverEvent) {
        let _ = self.sender.send(event);
    }

    pub fn state_changed(&self, state: PlaybackState) {
        self.publish(ObserverEvent::StateChanged { state });
    }

    pub fn queue_updated(&self, snapshot: &QueueSnapshot) {
        self.publish(queue_updated_event(snapshot));
    }

    pub fn progress(&self, elapsed_seconds: u64, segment: usize, total_segments: usize) {
        self.publish(ObserverEvent::Progress {
            elapsed_seconds,
            segment,
            total_segments,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(ObserverEvent::Error {
            message: message.into(),
        });
    }
}

pub fn queue_updated_event(snapshot: &QueueSnapshot) -> ObserverEvent {
    ObserverEvent::QueueUpdated {
        current: snapshot.current.clone(),
        previous: snapshot.previous.clone(),
        upcoming: snapshot.upcoming.clone(),
        suggestions: snapshot.suggestions.clone(),
    }
}

pub fn initial_event(snapshot: QueueSnapshot, elapsed_seconds: u64) -> ObserverEvent {
    ObserverEvent::Initial {
        current: snapshot.current,
        previous: snapshot.previous,
        upcoming: snapshot.upcoming,
        suggestions: snapshot.suggestions,
        state: snapshot.state,
        elapsed_seconds,
    }
}

/// Attached observers, guarded separately from the queue.
#[derive(Default)]
pub struct ObserverRegistry {
    attached: Mutex<HashMap<Uuid, Instant>>,
}

impl ObserverRegistry {
    pub fn attach(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id, Instant::now());
        id
    }

    pub fn detach(&self, id: &Uuid) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Instant>> {
        self.attached.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// What an observer's next receive produced.
#[derive(Debug, PartialEq)]
pub enum ObserverRecv {
    Event(ObserverEvent),
    /// This many events were dropped; request a new snapshot.
    Lagged(u64),
    /// The session is gone.
    Closed,
}

/// One attached observer: its initial snapshot plus the live event stream.
pub struct ObserverHandle {
    pub id: Uuid,
    pub initial: ObserverEvent,
    events: broadcast::Receiver<ObserverEvent>,
}

impl ObserverHandle {
    pub(crate) fn new(
        id: Uuid,
        initial: ObserverEvent,
        events: broadcast::Receiver<ObserverEvent>,
    ) -> Self {
        Self {
            id,
            initial,
            events,
        }
    }

    pub async fn recv(&mut self) -> ObserverRecv {
        match self.events.recv().await {
            Ok(event) => ObserverRecv::Event(event),
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(observer = %self.id, missed, "observer lagged");
                ObserverRecv::Lagged(missed)
            }
            Err(RecvError::Closed) => ObserverRecv::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::song;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.state_changed(PlaybackState::Playing);
        bus.error("boom");
        assert_eq!(
            rx.recv().await.unwrap(),
            ObserverEvent::StateChanged {
                state: PlaybackState::Playing
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ObserverEvent::Error {
                message: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn lagging_observer_is_told_how_much_it_missed() {
        let bus = EventBus::new(2);
        let mut handle = ObserverHandle::new(
            Uuid::new_v4(),
            ObserverEvent::StateChanged {
                state: PlaybackState::Idle,
            },
            bus.subscribe(),
        );
        for _ in 0..5 {
            bus.state_changed(PlaybackState::Paused);
        }
        assert_eq!(handle.recv().await, ObserverRecv::Lagged(3));
        assert!(matches!(handle.recv().await, ObserverRecv::Event(_)));
    }

    #[tokio::test]
    async fn dropped_bus_closes_observers() {
        let bus = EventBus::new(2);
        let mut handle = ObserverHandle::new(
            Uuid::new_v4(),
            ObserverEvent::StateChanged {
                state: PlaybackState::Idle,
            },
            bus.subscribe(),
        );
        drop(bus);
        assert_eq!(handle.recv().await, ObserverRecv::Closed);
    }

    #[test]
    fn snapshot_events_carry_queue_lists() {
        let snapshot = QueueSnapshot {
            current: Some(song("X")),
            previous: vec![song("P")],
            upcoming: vec![song("U")],
            ..QueueSnapshot::default()
        };
        let ObserverEvent::QueueUpdated { current, previous, upcoming, .. } =
            queue_updated_event(&snapshot)
        else {
            panic!("expected queue update");
        };
        assert_eq!(current.unwrap().id, "X");
        assert_eq!(previous[0].id, "P");
        assert_eq!(upcoming[0].id, "U");

        let ObserverEvent::Initial { elapsed_seconds, state, .. } = initial_event(snapshot, 42)
        else {
            panic!("expected initial");
        };
        assert_eq!(elapsed_seconds, 42);
        assert_eq!(state, PlaybackState::Idle);
    }

    #[test]
    fn registry_tracks_attach_and_detach() {
        let registry = ObserverRegistry::default();
        let a = registry.attach();
        let b = registry.attach();
        assert_eq!(registry.len(), 2);
        assert!(registry.detach(&a));
        assert!(!registry.detach(&a));
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.detach(&b));
    }
}
