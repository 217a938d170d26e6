//! Bounded, pull-based transport frame buffer for one stream.
//!
//! The fetch loop pushes frames produced by [`FrameCodec`] into a bounded
//! crossbeam channel; the voice sink pulls them at real-time cadence. The
//! channel capacity (about one second of audio) is the backpressure point:
//! once full, the producer parks on a blocking send until the sink catches up
//! or the stream is stopped.
//!
//! Shutdown is deterministic:
//! - [`StreamController::finish`] closes the producer side after the last
//!   segment, so the sink drains what is left and then sees end-of-stream.
//! - [`StreamController::stop`] aborts: a parked send is released through a
//!   separate stop signal, the frame channel is closed and the codec released.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};

use crate::codec::FrameCodec;
use crate::config::TranscodeConfig;
use crate::error::CodecError;

/// One encoded transport frame.
pub type TransportFrame = Vec<u8>;

/// Point-in-time progress of a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamProgress {
    /// Segments fully enqueued so far (including any seek offset).
    pub current_segment: usize,
    pub total_segments: usize,
    /// Bytes handed to the sink.
    pub bytes_emitted: u64,
    /// Frames handed to the sink.
    pub frames_emitted: u64,
    /// Playback clock: start offset plus delivered frame time.
    pub elapsed: Duration,
    pub buffered_frames: usize,
    pub capacity: usize,
}

impl StreamProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_segments == 0 {
            return 0.0;
        }
        (self.current_segment as f64 / self.total_segments as f64 * 100.0).min(100.0)
    }

    /// Average delivered bitrate over the frames emitted by this controller.
    pub fn bitrate_kbps(&self, frame_duration: Duration) -> f64 {
        let secs = frame_duration.as_secs_f64() * self.frames_emitted as f64;
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_emitted as f64 * 8.0 / secs / 1000.0
    }
}

/// Drives segment transcoding into a bounded frame channel.
pub struct StreamController {
    config: TranscodeConfig,
    codec: Mutex<Option<FrameCodec>>,
    frames_tx: Mutex<Option<Sender<TransportFrame>>>,
    frames_rx: Receiver<TransportFrame>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    capacity: usize,
    paused: AtomicBool,
    stopped: AtomicBool,
    current_segment: AtomicUsize,
    total_segments: usize,
    bytes_emitted: AtomicU64,
    frames_emitted: AtomicU64,
    start_offset: Duration,
}

impl StreamController {
    /// Controller for a stream starting at its first segment.
    pub fn new(codec: FrameCodec, total_segments: usize) -> Self {
        Self::starting_at(codec, total_segments, 0, Duration::ZERO)
    }

    /// Controller for a stream restarted at `start_segment` (seek), whose clock
    /// begins at `start_offset`.
    pub fn starting_at(
        codec: FrameCodec,
        total_segments: usize,
        start_segment: usize,
        start_offset: Duration,
    ) -> Self {
        let config = codec.config().clone();
        let capacity = config.buffer_frames();
        let (frames_tx, frames_rx) = bounded(capacity);
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            config,
            codec: Mutex::new(Some(codec)),
            frames_tx: Mutex::new(Some(frames_tx)),
            frames_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            capacity,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            current_segment: AtomicUsize::new(start_segment.min(total_segments)),
            total_segments,
            bytes_emitted: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            start_offset,
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Frame channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently buffered (best-effort snapshot).
    pub fn buffered(&self) -> usize {
        self.frames_rx.len()
    }

    pub fn total_segments(&self) -> usize {
        self.total_segments
    }

    pub fn current_segment(&self) -> usize {
        self.current_segment.load(Ordering::Acquire)
    }

    /// Transcode one segment and enqueue its frames in order.
    ///
    /// Returns the number of frames enqueued. Codec failures are logged and
    /// returned without advancing the segment counter. A stop during the
    /// blocking sends aborts with [`CodecError::Closed`].
    pub fn process_next_segment(&self, segment: &[u8]) -> Result<usize, CodecError> {
        if self.is_stopped() {
            return Err(CodecError::Closed);
        }

        let frames = {
            let mut codec = lock(&self.codec);
            let Some(active) = codec.as_mut() else {
                return Err(CodecError::Closed);
            };
            let result = active.process_segment(segment);
            if self.is_stopped() {
                // stop() could not take the codec while we held it
                if let Some(mut released) = codec.take() {
                    released.close();
                }
                return Err(CodecError::Closed);
            }
            result
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(
                    segment = self.current_segment(),
                    error = %err,
                    "segment transcode failed"
                );
                return Err(err);
            }
        };

        let Some(tx) = lock(&self.frames_tx).clone() else {
            return Err(CodecError::Closed);
        };
        let count = frames.len();
        for frame in frames {
            select! {
                send(tx, frame) -> sent => {
                    if sent.is_err() {
                        return Err(CodecError::Closed);
                    }
                }
                recv(self.stop_rx) -> _ => return Err(CodecError::Closed),
            }
        }

        self.current_segment.fetch_add(1, Ordering::AcqRel);
        Ok(count)
    }

    /// Next frame for the sink, blocking until one is available.
    ///
    /// Returns `(None, true)` while paused (nothing is consumed) and
    /// `(None, false)` once the stream has ended or been stopped.
    pub fn get_next_frame(&self) -> (Option<TransportFrame>, bool) {
        if self.is_stopped() {
            return (None, false);
        }
        if self.is_paused() {
            return (None, true);
        }
        match self.frames_rx.recv() {
            Ok(frame) => self.deliver(frame),
            Err(_) => (None, false),
        }
    }

    /// Like [`get_next_frame`](Self::get_next_frame) but gives up after `timeout`
    /// with `(None, true)`, for sinks that must keep their own cadence.
    pub fn next_frame_timeout(&self, timeout: Duration) -> (Option<TransportFrame>, bool) {
        if self.is_stopped() {
            return (None, false);
        }
        if self.is_paused() {
            return (None, true);
        }
        match self.frames_rx.recv_timeout(timeout) {
            Ok(frame) => self.deliver(frame),
            Err(RecvTimeoutError::Timeout) => (None, true),
            Err(RecvTimeoutError::Disconnected) => (None, false),
        }
    }

    fn deliver(&self, frame: TransportFrame) -> (Option<TransportFrame>, bool) {
        if self.is_stopped() {
            return (None, false);
        }
        self.bytes_emitted
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
        (Some(frame), true)
    }

    /// Whether the fetch loop may pull another segment.
    pub fn should_fetch_next(&self) -> bool {
        !self.is_stopped()
            && self.current_segment() < self.total_segments
            && self.buffered() < self.capacity
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Close the producer side after the final segment.
    ///
    /// Buffered frames stay readable; the sink sees end-of-stream once drained.
    pub fn finish(&self) {
        lock(&self.frames_tx).take();
    }

    /// Abort the stream. Only the first call has any effect.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.stop_tx).take();
        lock(&self.frames_tx).take();
        self.release_codec();
        tracing::debug!(
            segment = self.current_segment(),
            total = self.total_segments,
            "stream stopped"
        );
    }

    fn release_codec(&self) {
        let mut guard = match self.codec.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // A segment is mid-transcode; process_next_segment releases it.
            Err(TryLockError::WouldBlock) => return,
        };
        if let Some(mut codec) = guard.take() {
            codec.close();
        }
    }

    pub fn progress(&self) -> StreamProgress {
        let frames_emitted = self.frames_emitted.load(Ordering::Relaxed);
        let frame_time = self.config.frame_duration_ms as u64 * frames_emitted;
        StreamProgress {
            current_segment: self.current_segment(),
            total_segments: self.total_segments,
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            frames_emitted,
            elapsed: self.start_offset + Duration::from_millis(frame_time),
            buffered_frames: self.buffered(),
            capacity: self.capacity,
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::{script_codec, segment};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn controller(total: usize) -> StreamController {
        StreamController::new(script_codec().0, total)
    }

    #[test]
    fn capacity_is_one_second_of_frames() {
        let c = controller(3);
        assert_eq!(c.capacity(), 100);
        assert!(c.should_fetch_next());
    }

    #[test]
    fn frames_are_delivered_in_order_and_counted() {
        let c = controller(2);
        assert_eq!(c.process_next_segment(&segment(3)).unwrap(), 3);
        assert_eq!(c.current_segment(), 1);
        for _ in 0..3 {
            let (frame, open) = c.get_next_frame();
            assert!(open);
            assert_eq!(frame.unwrap().len(), 40);
        }
        let progress = c.progress();
        assert_eq!(progress.frames_emitted, 3);
        assert_eq!(progress.bytes_emitted, 120);
        assert_eq!(progress.elapsed, Duration::from_millis(30));
        assert_eq!(progress.percent_complete(), 50.0);
    }

    #[test]
    fn failed_segment_does_not_advance() {
        let c = controller(2);
        assert!(c.process_next_segment(&[1, 0xEE]).is_err());
        assert_eq!(c.current_segment(), 0);
        assert_eq!(c.buffered(), 0);
    }

    #[test]
    fn backpressure_stops_fetching_at_capacity() {
        let c = controller(10);
        c.process_next_segment(&segment(100)).unwrap();
        assert_eq!(c.buffered(), c.capacity());
        assert!(!c.should_fetch_next());
        let _ = c.get_next_frame();
        assert!(c.buffered() < c.capacity());
        assert!(c.should_fetch_next());
    }

    #[test]
    fn no_fetch_once_all_segments_are_enqueued() {
        let c = controller(1);
        c.process_next_segment(&segment(1)).unwrap();
        assert!(!c.should_fetch_next());
    }

    #[test]
    fn paused_controller_holds_frames() {
        let c = controller(1);
        c.process_next_segment(&segment(2)).unwrap();
        c.pause();
        c.pause();
        assert_eq!(c.get_next_frame(), (None, true));
        assert_eq!(c.buffered(), 2);
        c.resume();
        c.resume();
        assert!(c.get_next_frame().0.is_some());
        assert_eq!(c.buffered(), 1);
    }

    #[test]
    fn finish_drains_then_reports_end() {
        let c = controller(1);
        c.process_next_segment(&segment(2)).unwrap();
        c.finish();
        assert!(c.get_next_frame().0.is_some());
        assert!(c.get_next_frame().0.is_some());
        assert_eq!(c.get_next_frame(), (None, false));
    }

    #[test]
    fn stop_is_idempotent() {
        let (codec, closes) = script_codec();
        let c = StreamController::new(codec, 4);
        c.process_next_segment(&segment(1)).unwrap();
        c.stop();
        let after_first = c.progress();
        c.stop();
        assert_eq!(c.progress(), after_first);
        assert!(c.is_stopped());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(c.get_next_frame(), (None, false));
        assert!(!c.should_fetch_next());
        assert!(matches!(
            c.process_next_segment(&segment(1)),
            Err(CodecError::Closed)
        ));
    }

    #[test]
    fn stop_releases_a_parked_producer() {
        let c = Arc::new(controller(4));
        let producer = c.clone();
        let barrier = Arc::new(Barrier::new(2));
        let started = barrier.clone();

        let handle = thread::spawn(move || {
            started.wait();
            // 150 frames into a 100-frame channel parks on send.
            producer.process_next_segment(&segment(150))
        });

        barrier.wait();
        while c.buffered() < c.capacity() {
            thread::sleep(Duration::from_millis(1));
        }
        c.stop();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(CodecError::Closed)));
        assert_eq!(c.current_segment(), 0);
    }

    #[test]
    fn timeout_read_reports_still_open() {
        let c = controller(1);
        assert_eq!(c.next_frame_timeout(Duration::from_millis(5)), (None, true));
        c.finish();
        assert_eq!(c.next_frame_timeout(Duration::from_millis(5)), (None, false));
    }

    #[test]
    fn seek_restart_offsets_clock_and_segment() {
        let c = StreamController::starting_at(
            script_codec().0,
            10,
            4,
            Duration::from_secs(24),
        );
        assert_eq!(c.current_segment(), 4);
        c.process_next_segment(&segment(1)).unwrap();
        let _ = c.get_next_frame();
        let progress = c.progress();
        assert_eq!(progress.current_segment, 5);
        assert_eq!(progress.elapsed, Duration::from_millis(24_010));
    }

    #[test]
    fn bitrate_reflects_delivered_bytes() {
        let progress = StreamProgress {
            current_segment: 1,
            total_segments: 1,
            bytes_emitted: 400,
            frames_emitted: 10,
            elapsed: Duration::from_millis(100),
            buffered_frames: 0,
            capacity: 100,
        };
        // 400 bytes over 100 ms = 32 kbps
        assert!((progress.bitrate_kbps(Duration::from_millis(10)) - 32.0).abs() < 1e-9);
    }
}
