//! One playback session per guild: queue, active stream, observers and policy.
//!
//! Public navigation operations and the worker's idle transitions are
//! serialized by an async control lock. The queue itself sits behind a std
//! mutex that is only ever held for synchronous mutations, never across an
//! `.await`. The sink side (`provide_frame`) takes neither lock beyond a short
//! clone of the active controller.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use relay_player::codec::CodecFactory;
use relay_player::controller::{StreamController, StreamProgress, TransportFrame};
use relay_player::pipeline::{StreamOutcome, spawn_fetch_loop};
use relay_player::source::{SegmentPlan, SegmentSource};
use relay_types::{ControlOp, ObserverEvent, PlaybackState, QueueFeatures, RepeatMode, Song};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::autoplay::{self, NoSuggestions, SuggestionProvider};
use crate::events::{self, EventBus, ObserverHandle, ObserverRegistry};
use crate::notifier::{LoggingNotifier, PlaybackNotifier};
use crate::queue::{PlaybackQueue, QueueError, QueueSnapshot};
use crate::resolution::{self, CatalogSearch, ForeignPlaylist};
use crate::session_worker::{self, SessionCommand};

/// Errors surfaced to callers of session operations.
#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("Web controls are locked")]
    Locked,
    #[error("nothing is playing")]
    NotPlaying,
    #[error("cannot seek to {0:.1}s in this stream")]
    SeekOutOfRange(f64),
    #[error("stream failed to start: {0}")]
    Stream(String),
    #[error("playlist could not be queued: {0}")]
    Resolve(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Tunables shared by every session of a hub.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Sleep between backpressure checks in the fetch loop.
    pub fetch_poll: Duration,
    /// Idle time before teardown.
    pub inactivity: Duration,
    /// Idle time before teardown while autoplay is on.
    pub autoplay_inactivity: Duration,
    pub suggestion_count: usize,
    /// Refill suggestions once fewer than this many remain.
    pub suggestion_refill_below: usize,
    /// Consecutive start failures tolerated before the session stops advancing.
    pub max_start_failures: u32,
    pub event_capacity: usize,
    /// How long `provide_frame` waits for a frame before returning nothing.
    pub frame_wait: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            fetch_poll: Duration::from_millis(100),
            inactivity: Duration::from_secs(60 * 60),
            autoplay_inactivity: Duration::from_secs(3 * 60 * 60),
            suggestion_count: 5,
            suggestion_refill_below: 2,
            max_start_failures: 3,
            event_capacity: 64,
            frame_wait: Duration::from_millis(20),
        }
    }
}

/// External collaborators a session streams and reports through.
#[derive(Clone)]
pub struct SessionDeps {
    pub segments: Arc<dyn SegmentSource>,
    pub codecs: Arc<dyn CodecFactory>,
    pub suggestions: Arc<dyn SuggestionProvider>,
    pub notifier: Arc<dyn PlaybackNotifier>,
}

impl SessionDeps {
    pub fn new(segments: Arc<dyn SegmentSource>, codecs: Arc<dyn CodecFactory>) -> Self {
        Self {
            segments,
            codecs,
            suggestions: Arc::new(NoSuggestions),
            notifier: Arc::new(LoggingNotifier),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Arc<dyn SuggestionProvider>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn PlaybackNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Why the session is leaving playback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IdleCause {
    Finished,
    Failed,
}

enum Started {
    Playing,
    NothingToPlay,
    Failed,
}

struct ActiveStream {
    generation: u64,
    song_id: String,
    controller: Arc<StreamController>,
    plan: Arc<SegmentPlan>,
    fetch: Option<thread::JoinHandle<()>>,
    outcome: Arc<Mutex<Option<StreamOutcome>>>,
    end_reported: Arc<AtomicBool>,
}

type ClosedHook = Box<dyn FnOnce(&str) + Send>;

pub struct PlaybackSession {
    id: String,
    settings: SessionSettings,
    deps: SessionDeps,
    queue: Mutex<PlaybackQueue>,
    stream: Mutex<Option<ActiveStream>>,
    generation: AtomicU64,
    control: tokio::sync::Mutex<()>,
    events: EventBus,
    observers: ObserverRegistry,
    prewarmed: Mutex<Option<Arc<SegmentPlan>>>,
    prewarm_requested: Mutex<Option<String>>,
    inactivity: Mutex<Option<JoinHandle<()>>>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    /// Held while suggestions are being generated.
    refresh: tokio::sync::Mutex<()>,
    /// Autoplay ran dry with nothing to seed from; a later refresh resumes.
    autoplay_stalled: AtomicBool,
    start_failures: AtomicU32,
    closed: AtomicBool,
    on_closed: Mutex<Option<ClosedHook>>,
}

impl PlaybackSession {
    /// Create a session and its worker task. Must run inside a tokio runtime.
    pub fn spawn(id: impl Into<String>, settings: SessionSettings, deps: SessionDeps) -> Arc<Self> {
        Self::spawn_with_queue(id, settings, deps, PlaybackQueue::new())
    }

    /// Like [`PlaybackSession::spawn`] with a caller-built queue (seeded shuffles in tests).
    pub fn spawn_with_queue(
        id: impl Into<String>,
        settings: SessionSettings,
        deps: SessionDeps,
        queue: PlaybackQueue,
    ) -> Arc<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: id.into(),
            events: EventBus::new(settings.event_capacity),
            settings,
            deps,
            queue: Mutex::new(queue),
            stream: Mutex::new(None),
            generation: AtomicU64::new(0),
            control: tokio::sync::Mutex::new(()),
            observers: ObserverRegistry::default(),
            prewarmed: Mutex::new(None),
            prewarm_requested: Mutex::new(None),
            inactivity: Mutex::new(None),
            commands,
            refresh: tokio::sync::Mutex::new(()),
            autoplay_stalled: AtomicBool::new(false),
            start_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            on_closed: Mutex::new(None),
        });
        tokio::spawn(session_worker::run(Arc::downgrade(&session), receiver));
        tracing::info!(session = %session.id, "session created");
        session
    }

    /// Called once with the session id after [`PlaybackSession::close`].
    pub fn on_closed(&self, hook: impl FnOnce(&str) + Send + 'static) {
        *lock(&self.on_closed) = Some(Box::new(hook));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue().snapshot()
    }

    pub fn state(&self) -> PlaybackState {
        self.queue().state()
    }

    pub fn features(&self) -> QueueFeatures {
        self.queue().features()
    }

    /// Progress of the active stream, if any.
    pub fn progress(&self) -> Option<StreamProgress> {
        self.active_controller().map(|controller| controller.progress())
    }

    // ---- queue operations ----

    /// Queue a song. Returns 0 when it started playing, else its upcoming position.
    pub async fn add(&self, song: Song, requestor: &str) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let _control = self.control.lock().await;
        let suggested = song.internal.suggested;
        let title = song.title.clone();
        let (position, autoplay) = {
            let mut queue = self.queue();
            let position = queue.add(song, requestor);
            (position, queue.features().autoplay)
        };
        tracing::info!(session = %self.id, song = %title, requestor, position, "song queued");
        if autoplay && !suggested {
            self.send(SessionCommand::RefreshSuggestions { replace: true });
        }
        self.queue_changed();
        if position == 0 {
            self.play_current_or_idle().await;
        }
        Ok(position)
    }

    /// Resolve a foreign playlist against the catalog and queue every match in
    /// playlist order. Returns how many songs were queued.
    pub async fn add_playlist<P: ForeignPlaylist>(
        &self,
        playlist: &P,
        search: Arc<dyn CatalogSearch>,
        requestor: &str,
    ) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let songs = resolution::resolve_playlist(playlist, search, false)
            .await
            .map_err(|err| SessionError::Resolve(err.to_string()))?;
        if songs.is_empty() {
            return Err(SessionError::Resolve("no item matched the catalog".to_string()));
        }

        let _control = self.control.lock().await;
        self.ensure_open()?;
        let count = songs.len();
        let (started, autoplay) = {
            let mut queue = self.queue();
            let mut started = false;
            for song in songs {
                started |= queue.add(song, requestor) == 0;
            }
            (started, queue.features().autoplay)
        };
        tracing::info!(session = %self.id, playlist = %playlist.source().id, requestor, count, "playlist queued");
        if autoplay {
            self.send(SessionCommand::RefreshSuggestions { replace: true });
        }
        self.queue_changed();
        if started {
            self.play_current_or_idle().await;
        }
        Ok(count)
    }

    /// Advance to the next song, seeding autoplay first when nothing is left.
    pub async fn next(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let _control = self.control.lock().await;
        self.seed_suggestions_if_exhausted().await;
        self.queue().next()?;
        self.queue_changed();
        self.play_current_or_idle().await;
        Ok(())
    }

    /// Step back to the most recent history entry.
    pub async fn last(&self) -> Result<(), SessionError> {
        self.navigate(|queue| queue.last()).await
    }

    /// Skip to the 1-based upcoming position `n`.
    pub async fn jump(&self, n: usize) -> Result<(), SessionError> {
        self.navigate(|queue| queue.jump(n)).await
    }

    /// Play the 0-based history entry `index` again.
    pub async fn replay(&self, index: usize) -> Result<(), SessionError> {
        self.navigate(|queue| queue.replay(index)).await
    }

    pub fn remove(&self, index: usize) -> Result<Song, SessionError> {
        self.ensure_open()?;
        let removed = self.queue().remove(index)?;
        self.queue_changed();
        Ok(removed)
    }

    pub fn move_song(&self, from: usize, to: usize) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.queue().move_upcoming(from, to)?;
        self.queue_changed();
        Ok(())
    }

    /// Stop playback and empty the queue, keeping suggestions.
    pub async fn clear(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let _control = self.control.lock().await;
        self.stop_stream();
        self.autoplay_stalled.store(false, Ordering::SeqCst);
        self.queue().clear();
        self.set_state(PlaybackState::Idle);
        self.publish_queue(true);
        self.start_inactivity();
        Ok(())
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let controller = self.active_controller().ok_or(SessionError::NotPlaying)?;
        if self.state() == PlaybackState::Playing {
            controller.pause();
            self.set_state(PlaybackState::Paused);
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let controller = self.active_controller().ok_or(SessionError::NotPlaying)?;
        if self.state() == PlaybackState::Paused {
            controller.resume();
            self.set_state(PlaybackState::Playing);
        }
        Ok(())
    }

    /// Restart the current song's stream at the segment holding `offset_secs`.
    pub async fn seek(&self, offset_secs: f64) -> Result<(), SessionError> {
        self.ensure_open()?;
        let _control = self.control.lock().await;
        let (plan, song) = {
            let stream = lock(&self.stream);
            let active = stream.as_ref().ok_or(SessionError::NotPlaying)?;
            let song = self.queue().current().cloned();
            match song {
                Some(song) if song.id == active.song_id => (active.plan.clone(), song),
                _ => return Err(SessionError::NotPlaying),
            }
        };
        let (index, start) = plan
            .segment_for_offset(offset_secs)
            .ok_or(SessionError::SeekOutOfRange(offset_secs))?;
        let paused = self.state() == PlaybackState::Paused;

        let restart = AssertUnwindSafe(self.start_stream(
            &song,
            Some(plan),
            index,
            start_offset(start),
        ))
        .catch_unwind()
        .await;
        let reason = match restart {
            Ok(Ok(())) => {
                if paused {
                    if let Some(controller) = self.active_controller() {
                        controller.pause();
                    }
                }
                tracing::info!(session = %self.id, song = %song.id, offset_secs, index, "seeked");
                return Ok(());
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };
        self.report_failure(&song, &reason);
        self.transition_to_idle(IdleCause::Failed).await;
        Err(SessionError::Stream(reason))
    }

    pub fn set_repeat(&self, repeat: RepeatMode) {
        self.queue().set_repeat(repeat);
        self.publish_queue(true);
    }

    pub fn set_shuffle(&self, shuffle: bool) {
        self.queue().set_shuffle(shuffle);
        self.publish_queue(true);
    }

    pub fn set_autoplay(&self, autoplay: bool) {
        self.queue().set_autoplay(autoplay);
        self.publish_queue(true);
    }

    pub fn set_locked(&self, locked: bool) {
        self.queue().set_locked(locked);
    }

    // ---- observers ----

    /// Attach an observer; its handle carries the `Initial` snapshot.
    pub fn attach_observer(&self) -> ObserverHandle {
        let receiver = self.events.subscribe();
        let id = self.observers.attach();
        tracing::debug!(session = %self.id, observer = %id, "observer attached");
        ObserverHandle::new(id, self.initial_event(), receiver)
    }

    pub fn detach_observer(&self, id: &Uuid) -> bool {
        self.observers.detach(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Fresh `Initial` snapshot, also used to resync a lagging observer.
    pub fn initial_event(&self) -> ObserverEvent {
        let snapshot = self.snapshot();
        let elapsed = self
            .progress()
            .map(|progress| progress.elapsed.as_secs())
            .unwrap_or(0);
        events::initial_event(snapshot, elapsed)
    }

    /// Apply a control operation sent by an observer.
    pub async fn handle_control(&self, op: ControlOp) -> Result<(), SessionError> {
        if self.features().locked {
            self.events.error(SessionError::Locked.to_string());
            return Err(SessionError::Locked);
        }
        let result = match op {
            ControlOp::Pause => self.pause(),
            ControlOp::Resume => self.resume(),
            ControlOp::Next => self.next().await,
            ControlOp::Last => self.last().await,
            ControlOp::Seek { offset_seconds } => self.seek(offset_seconds).await,
            ControlOp::Jump { index } => self.jump(index).await,
            ControlOp::Remove { index } => self.remove(index).map(|_| ()),
            ControlOp::Move { from, to } => self.move_song(from, to),
            ControlOp::Replay { index } => self.replay(index).await,
        };
        if let Err(err) = &result {
            self.events.error(err.to_string());
        }
        result
    }

    // ---- sink ----

    /// Next transport frame for the voice sink, or `None` when nothing is ready.
    pub fn provide_frame(&self) -> Result<Option<TransportFrame>, SessionError> {
        self.ensure_open()?;
        let active = {
            let stream = lock(&self.stream);
            stream.as_ref().map(|active| {
                (
                    active.controller.clone(),
                    active.generation,
                    active.end_reported.clone(),
                )
            })
        };
        let Some((controller, generation, end_reported)) = active else {
            return Ok(None);
        };

        let (frame, open) = controller.next_frame_timeout(self.settings.frame_wait);
        if frame.is_some() {
            self.publish_progress(&controller);
        } else if !open && !controller.is_stopped() && !end_reported.swap(true, Ordering::SeqCst) {
            self.send(SessionCommand::StreamEnded { generation });
        }
        Ok(frame)
    }

    /// Tear the session down. Later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_inactivity();
        self.stop_stream();
        {
            let mut queue = self.queue();
            queue.clear();
            queue.replace_suggestions(Vec::new());
        }
        self.set_state(PlaybackState::Idle);
        self.observers.clear();
        lock(&self.prewarmed).take();
        self.send(SessionCommand::Shutdown);
        let hook = lock(&self.on_closed).take();
        if let Some(hook) = hook {
            hook(&self.id);
        }
        tracing::info!(session = %self.id, "session closed");
    }

    // ---- worker entry points ----

    pub(crate) async fn handle_stream_ended(&self, generation: u64) {
        let _control = self.control.lock().await;
        let active = {
            let mut stream = lock(&self.stream);
            let current = stream.as_ref().map(|active| active.generation) == Some(generation);
            if current { stream.take() } else { None }
        };
        let Some(mut active) = active else {
            tracing::debug!(session = %self.id, generation, "ignoring stale stream end");
            return;
        };

        if let Some(fetch) = active.fetch.take() {
            if let Ok(Err(_)) = tokio::task::spawn_blocking(move || fetch.join()).await {
                tracing::error!(session = %self.id, song = %active.song_id, "fetch thread panicked");
            }
        }
        active.controller.stop();
        let outcome = lock(&active.outcome).take();

        match outcome {
            Some(StreamOutcome::Failed { reason }) => {
                let song = self.queue().current().cloned();
                if let Some(song) = song {
                    self.report_failure(&song, &reason);
                }
                self.transition_to_idle(IdleCause::Failed).await;
            }
            Some(StreamOutcome::Stopped) => {
                tracing::debug!(session = %self.id, song = %active.song_id, "stream was stopped");
            }
            Some(StreamOutcome::Exhausted { frames, failed_segments }) => {
                tracing::info!(
                    session = %self.id,
                    song = %active.song_id,
                    frames,
                    failed_segments,
                    "song finished"
                );
                self.transition_to_idle(IdleCause::Finished).await;
            }
            None => {
                self.report_failure_by_id(&active.song_id, "segment fetch ended unexpectedly");
                self.transition_to_idle(IdleCause::Failed).await;
            }
        }
    }

    /// Idle-transition policy: repeat, advance, or go idle and start the countdown.
    pub(crate) async fn transition_to_idle(&self, mut cause: IdleCause) {
        loop {
            self.stop_stream();
            self.set_state(PlaybackState::Idle);
            if self.is_closed() {
                return;
            }

            let replay = cause == IdleCause::Finished && {
                let queue = self.queue();
                queue.features().repeat == RepeatMode::One && queue.current().is_some()
            };
            if !replay {
                let failures = self.start_failures.load(Ordering::SeqCst);
                if failures >= self.settings.max_start_failures {
                    tracing::warn!(session = %self.id, failures, "too many failed starts, going idle");
                    self.start_failures.store(0, Ordering::SeqCst);
                    self.queue().finish_current();
                    self.go_idle();
                    return;
                }

                self.seed_suggestions_if_exhausted().await;
                let (advanced, autoplay) = {
                    let mut queue = self.queue();
                    let autoplay = queue.features().autoplay;
                    match queue.next() {
                        Ok(()) => (true, autoplay),
                        Err(_) => {
                            queue.finish_current();
                            (false, autoplay)
                        }
                    }
                };
                if !advanced {
                    self.autoplay_stalled.store(autoplay, Ordering::SeqCst);
                    self.go_idle();
                    return;
                }
                self.queue_changed();
            }

            match self.start_current(true).await {
                Started::Playing => return,
                Started::NothingToPlay => {
                    self.go_idle();
                    return;
                }
                Started::Failed => cause = IdleCause::Failed,
            }
        }
    }

    /// Regenerate suggestions from the seed song. At most one runs at a time:
    /// a top-up is skipped while another is in flight, a replacement waits.
    pub(crate) async fn refresh_suggestions(&self, replace: bool) {
        let refreshed = {
            let _guard = if replace {
                self.refresh.lock().await
            } else {
                match self.refresh.try_lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                }
            };
            self.generate_suggestions(replace).await
        };
        if refreshed && self.autoplay_stalled.swap(false, Ordering::SeqCst) {
            self.resume_autoplay().await;
        }
    }

    /// Fetch suggestions for the current seed. Callers hold `refresh`.
    async fn generate_suggestions(&self, replace: bool) -> bool {
        let seed = {
            let queue = self.queue();
            let wanted = if replace {
                queue.features().autoplay
            } else {
                queue.needs_suggestions(self.settings.suggestion_refill_below)
            };
            if wanted { queue.seed_song().cloned() } else { None }
        };
        let Some(seed) = seed else {
            return false;
        };
        let result = autoplay::generate_suggestions(
            self.deps.suggestions.as_ref(),
            &seed,
            self.settings.suggestion_count,
        )
        .await;

        match result {
            Ok(songs) => {
                tracing::debug!(session = %self.id, seed = %seed.id, count = songs.len(), replace, "suggestions refreshed");
                let added = !songs.is_empty();
                {
                    let mut queue = self.queue();
                    if replace {
                        queue.replace_suggestions(songs);
                    } else {
                        queue.extend_suggestions(songs);
                    }
                }
                self.publish_queue(false);
                added
            }
            Err(err) => {
                tracing::warn!(session = %self.id, seed = %seed.id, error = %format!("{err:#}"), "autoplay suggestions unavailable");
                false
            }
        }
    }

    /// Pick up autoplay again after suggestions arrived too late for the idle transition.
    async fn resume_autoplay(&self) {
        if self.is_closed() {
            return;
        }
        let _control = self.control.lock().await;
        let advanced = {
            let mut queue = self.queue();
            let ready = queue.state() == PlaybackState::Idle
                && queue.current().is_none()
                && queue.upcoming().is_empty()
                && queue.features().autoplay;
            ready && queue.next().is_ok()
        };
        if advanced {
            tracing::info!(session = %self.id, "autoplay resumed with fresh suggestions");
            self.queue_changed();
            self.play_current_or_idle().await;
        }
    }

    /// Resolve and cache the segment plan of an upcoming song.
    pub(crate) async fn prewarm(&self, song_id: String) {
        let cached = lock(&self.prewarmed)
            .as_ref()
            .is_some_and(|plan| plan.song_id == song_id);
        if cached {
            return;
        }
        match self.fetch_plan(&song_id).await {
            Ok(plan) => {
                tracing::debug!(session = %self.id, song = %song_id, segments = plan.total(), "segment plan prewarmed");
                *lock(&self.prewarmed) = Some(plan);
            }
            Err(err) => {
                tracing::debug!(session = %self.id, song = %song_id, error = %format!("{err:#}"), "prewarm failed");
            }
        }
    }

    pub(crate) fn inactivity_expired(&self) {
        if self.is_closed() || self.state() != PlaybackState::Idle {
            return;
        }
        self.deps.notifier.inactivity_disconnect(&self.id);
        self.close();
    }

    // ---- internals ----

    async fn navigate<F>(&self, op: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut PlaybackQueue) -> Result<(), QueueError>,
    {
        self.ensure_open()?;
        let _control = self.control.lock().await;
        op(&mut self.queue())?;
        self.queue_changed();
        self.play_current_or_idle().await;
        Ok(())
    }

    async fn play_current_or_idle(&self) {
        if let Started::Failed = self.start_current(true).await {
            self.transition_to_idle(IdleCause::Failed).await;
        }
    }

    /// Start streaming the current song, recovering errors and panics.
    async fn start_current(&self, announce: bool) -> Started {
        let Some(song) = self.queue().current().cloned() else {
            return Started::NothingToPlay;
        };
        let attempt = AssertUnwindSafe(self.start_stream(&song, None, 0, Duration::ZERO))
            .catch_unwind()
            .await;
        let reason = match attempt {
            Ok(Ok(())) => {
                self.start_failures.store(0, Ordering::SeqCst);
                self.autoplay_stalled.store(false, Ordering::SeqCst);
                self.cancel_inactivity();
                self.set_state(PlaybackState::Playing);
                if announce {
                    self.deps.notifier.now_playing(&self.id, &song);
                }
                return Started::Playing;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };
        tracing::error!(session = %self.id, song = %song.id, %reason, "failed to start playback");
        self.report_failure(&song, &reason);
        Started::Failed
    }

    async fn start_stream(
        &self,
        song: &Song,
        plan: Option<Arc<SegmentPlan>>,
        start_index: usize,
        offset: Duration,
    ) -> Result<()> {
        self.stop_stream();
        let plan = match plan.or_else(|| self.take_prewarmed(&song.id)) {
            Some(plan) => plan,
            None => self.fetch_plan(&song.id).await?,
        };
        if plan.is_empty() {
            anyhow::bail!("no segments available for {}", song.id);
        }

        let codec = self.deps.codecs.create().context("create frame codec")?;
        let controller = Arc::new(StreamController::starting_at(
            codec,
            plan.total(),
            start_index,
            offset,
        ));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let fetch = spawn_fetch_loop(
            controller.clone(),
            self.deps.segments.clone(),
            plan.clone(),
            start_index,
            self.settings.fetch_poll,
            move |result| {
                *lock(&slot) = Some(result);
            },
        )?;

        let replaced = lock(&self.stream).replace(ActiveStream {
            generation,
            song_id: song.id.clone(),
            controller,
            plan: plan.clone(),
            fetch: Some(fetch),
            outcome,
            end_reported: Arc::new(AtomicBool::new(false)),
        });
        if let Some(replaced) = replaced {
            replaced.controller.stop();
        }
        tracing::info!(
            session = %self.id,
            song = %song.id,
            generation,
            segments = plan.total(),
            start_index,
            "stream started"
        );
        Ok(())
    }

    async fn fetch_plan(&self, song_id: &str) -> Result<Arc<SegmentPlan>> {
        let source = self.deps.segments.clone();
        let id = song_id.to_string();
        let plan = tokio::task::spawn_blocking(move || source.plan(&id))
            .await
            .context("segment plan task")?
            .with_context(|| format!("segment plan for {song_id}"))?;
        Ok(Arc::new(plan))
    }

    fn take_prewarmed(&self, song_id: &str) -> Option<Arc<SegmentPlan>> {
        let mut slot = lock(&self.prewarmed);
        let matches = slot.as_ref().is_some_and(|plan| plan.song_id == song_id);
        if matches { slot.take() } else { None }
    }

    fn stop_stream(&self) {
        let active = lock(&self.stream).take();
        if let Some(active) = active {
            active.controller.stop();
            tracing::debug!(session = %self.id, song = %active.song_id, generation = active.generation, "stream stopped");
        }
    }

    fn active_controller(&self) -> Option<Arc<StreamController>> {
        lock(&self.stream)
            .as_ref()
            .map(|active| active.controller.clone())
    }

    async fn seed_suggestions_if_exhausted(&self) {
        let exhausted = {
            let queue = self.queue();
            queue.features().autoplay && queue.upcoming().is_empty() && queue.suggestions().is_empty()
        };
        if !exhausted {
            return;
        }
        let _guard = self.refresh.lock().await;
        let still_exhausted = {
            let queue = self.queue();
            queue.upcoming().is_empty() && queue.suggestions().is_empty()
        };
        if still_exhausted {
            self.generate_suggestions(false).await;
        }
    }

    fn report_failure(&self, song: &Song, reason: &str) {
        self.start_failures.fetch_add(1, Ordering::SeqCst);
        self.deps.notifier.playback_failed(&self.id, song, reason);
        self.events.error(format!("could not play {}: {reason}", song.title));
    }

    fn report_failure_by_id(&self, song_id: &str, reason: &str) {
        let song = self.queue().current().cloned();
        match song {
            Some(song) if song.id == song_id => self.report_failure(&song, reason),
            _ => {
                self.start_failures.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(session = %self.id, song = %song_id, reason, "stream failed");
            }
        }
    }

    fn go_idle(&self) {
        self.set_state(PlaybackState::Idle);
        self.publish_queue(true);
        self.deps.notifier.queue_ended(&self.id);
        self.start_inactivity();
    }

    fn set_state(&self, state: PlaybackState) {
        let changed = {
            let mut queue = self.queue();
            let changed = queue.state() != state;
            queue.set_state(state);
            changed
        };
        if changed {
            self.events.state_changed(state);
        }
    }

    fn queue_changed(&self) {
        self.publish_queue(true);
    }

    /// Broadcast the queue; optionally schedule a suggestion top-up.
    fn publish_queue(&self, check_suggestions: bool) {
        let (snapshot, needs_suggestions) = {
            let queue = self.queue();
            (
                queue.snapshot(),
                queue.needs_suggestions(self.settings.suggestion_refill_below),
            )
        };
        self.events.queue_updated(&snapshot);
        if let Some(head) = snapshot.upcoming.first() {
            self.request_prewarm(&head.id);
        }
        if check_suggestions && needs_suggestions {
            self.send(SessionCommand::RefreshSuggestions { replace: false });
        }
    }

    fn publish_progress(&self, controller: &StreamController) {
        let progress = controller.progress();
        let every = progress.capacity.max(1) as u64;
        if progress.frames_emitted % every == 0 {
            self.events.progress(
                progress.elapsed.as_secs(),
                progress.current_segment,
                progress.total_segments,
            );
        }
    }

    fn request_prewarm(&self, song_id: &str) {
        {
            let mut requested = lock(&self.prewarm_requested);
            if requested.as_deref() == Some(song_id) {
                return;
            }
            *requested = Some(song_id.to_string());
        }
        self.send(SessionCommand::Prewarm {
            song_id: song_id.to_string(),
        });
    }

    fn start_inactivity(&self) {
        let window = if self.features().autoplay {
            self.settings.autoplay_inactivity
        } else {
            self.settings.inactivity
        };
        let commands = self.commands.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = commands.send(SessionCommand::InactivityExpired);
        });
        let previous = lock(&self.inactivity).replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::debug!(session = %self.id, window_secs = window.as_secs(), "inactivity countdown started");
    }

    fn cancel_inactivity(&self) {
        let timer = lock(&self.inactivity).take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(session = %self.id, "session worker has exited");
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn queue(&self) -> MutexGuard<'_, PlaybackQueue> {
        lock(&self.queue)
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        let active = lock(&self.stream).take();
        if let Some(active) = active {
            active.controller.stop();
        }
        let timer = lock(&self.inactivity).take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Playlist durations are untrusted; anything negative or non-finite starts at zero.
fn start_offset(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic while starting playback".to_string()
    }
}
