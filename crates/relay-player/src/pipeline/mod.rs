//! Segment fetch loop: source → codec → frame channel.
//!
//! One loop runs per active stream, on its own thread. It consults
//! [`StreamController::should_fetch_next`] before every network pull, so a
//! slow sink throttles fetching instead of growing memory.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::controller::StreamController;
use crate::error::CodecError;
use crate::source::{SegmentPlan, SegmentSource};

/// How a fetch loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every segment was attempted; the sink drains what was enqueued.
    Exhausted { frames: usize, failed_segments: usize },
    /// Nothing playable could be produced.
    Failed { reason: String },
    /// The controller was stopped before the loop finished.
    Stopped,
}

/// Run the fetch loop on a named background thread.
///
/// `on_end` is called exactly once with the loop's outcome.
pub fn spawn_fetch_loop<F>(
    controller: Arc<StreamController>,
    source: Arc<dyn SegmentSource>,
    plan: Arc<SegmentPlan>,
    start_index: usize,
    poll: Duration,
    on_end: F,
) -> Result<thread::JoinHandle<()>>
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    let name = format!("segment-fetch-{}", plan.song_id);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let outcome = run_fetch_loop(&controller, source.as_ref(), &plan, start_index, poll);
            on_end(outcome);
        })
        .context("spawn segment fetch thread")
}

/// Fetch and transcode `plan` from `start_index` on the calling thread.
///
/// Fetch and per-segment codec failures are logged and skipped. A missing
/// audio track before any frame was produced aborts the stream. The producer
/// side is finished on every exit path except a stop.
pub fn run_fetch_loop(
    controller: &StreamController,
    source: &dyn SegmentSource,
    plan: &SegmentPlan,
    start_index: usize,
    poll: Duration,
) -> StreamOutcome {
    let mut frames = 0usize;
    let mut failed_segments = 0usize;
    let mut last_error: Option<String> = None;

    for (index, segment) in plan.segments.iter().enumerate().skip(start_index) {
        while !controller.should_fetch_next() {
            if controller.is_stopped() {
                return StreamOutcome::Stopped;
            }
            thread::sleep(poll);
        }

        let bytes = match source.fetch(segment) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(song = %plan.song_id, index, error = %err, "segment fetch failed");
                failed_segments += 1;
                last_error = Some(format!("{err:#}"));
                continue;
            }
        };

        match controller.process_next_segment(&bytes) {
            Ok(count) => frames += count,
            Err(CodecError::Closed) => return StreamOutcome::Stopped,
            Err(CodecError::NoAudioTrack) if frames == 0 => {
                tracing::error!(song = %plan.song_id, index, "no audio track in stream");
                controller.finish();
                return StreamOutcome::Failed {
                    reason: CodecError::NoAudioTrack.to_string(),
                };
            }
            Err(err) => {
                failed_segments += 1;
                last_error = Some(err.to_string());
            }
        }
    }

    if controller.is_stopped() {
        return StreamOutcome::Stopped;
    }
    controller.finish();

    if frames == 0 && failed_segments > 0 {
        let reason = last_error.unwrap_or_else(|| "every segment failed".to_string());
        tracing::error!(song = %plan.song_id, failed_segments, %reason, "stream produced no frames");
        return StreamOutcome::Failed { reason };
    }
    tracing::info!(song = %plan.song_id, frames, failed_segments, "stream fully enqueued");
    StreamOutcome::Exhausted {
        frames,
        failed_segments,
    }
}
