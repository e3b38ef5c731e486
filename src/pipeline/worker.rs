//! The producer loop run on the `camview-pipeline` thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use color_eyre::{eyre::eyre, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use super::annotate::annotate;
use super::engine::Callbacks;
use super::lock;
use super::ringbuf::FrameBuffer;
use super::status::{EngineState, StatusHandle};
use crate::analyzer::{panic_message, AnalyzerSet};
use crate::capture::{Frame, FrameSource};
use crate::events::{Event, EventSink};

/// Everything the producer shares with the engine.
pub(crate) struct Shared {
    pub source: Arc<Mutex<Option<Box<dyn FrameSource>>>>,
    pub analyzers: Arc<Mutex<AnalyzerSet>>,
    pub callbacks: Arc<Mutex<Callbacks>>,
    pub sink: Arc<dyn EventSink>,
    pub buffer: Arc<FrameBuffer>,
    pub status: StatusHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Exhausted,
    Cancelled,
}

#[derive(Default)]
struct Totals {
    frames: u64,
    events: u64,
    analyzer_failures: u64,
    callback_failures: u64,
}

/// Run until the source is exhausted or `cancel` disconnects, then release
/// the source and publish the final status. `done` is dropped last.
pub(crate) fn run(
    shared: Shared,
    pacing: Option<Duration>,
    pin_core: Option<usize>,
    cancel: Receiver<()>,
    done: Sender<()>,
) {
    if let Some(core) = pin_core {
        pin_to_core(core);
    }

    let started = Instant::now();
    let exit = panic::catch_unwind(AssertUnwindSafe(|| {
        process_frames(&shared, pacing, &cancel, started)
    }))
    .unwrap_or_else(|payload| {
        error!("Pipeline cycle panicked: {}", panic_message(&*payload));
        Exit::Cancelled
    });

    if let Some(mut source) = lock(&shared.source).take() {
        debug!("Releasing {}", source.describe());
        source.release();
    }

    let processing_time = started.elapsed();
    let status = shared.status.update(|s| {
        s.state = match exit {
            Exit::Exhausted => EngineState::Completed,
            Exit::Cancelled => EngineState::Stopped,
        };
        s.is_processing = false;
        s.processing_time = Some(processing_time);
        s.last_update = Some(SystemTime::now());
        s.clone()
    });
    info!(
        "Pipeline {:?} after {} frames, {} events in {:.2?}",
        status.state, status.current_frame, status.events_detected, processing_time
    );
    drop(done);
}

fn process_frames(
    shared: &Shared,
    pacing: Option<Duration>,
    cancel: &Receiver<()>,
    started: Instant,
) -> Exit {
    let mut analyzers = lock(&shared.analyzers);
    let mut callbacks = lock(&shared.callbacks);
    let mut totals = Totals::default();

    loop {
        match cancel.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => return Exit::Cancelled,
        }
        let cycle_start = Instant::now();

        // The source lock is held only for the read itself
        let next = match lock(&shared.source).as_mut() {
            Some(source) => source.read(),
            // Released by a stop that gave up waiting
            None => return Exit::Cancelled,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Source exhausted after {} frames", totals.frames);
                return Exit::Exhausted;
            }
            Err(e) => {
                warn!("Frame read failed, ending run: {:#}", e);
                return Exit::Exhausted;
            }
        };

        totals.frames += 1;
        let frame_index = totals.frames;
        let frame = frame.with_sequence(frame_index);

        let run = analyzers.process(&frame, frame_index);
        totals.analyzer_failures += run.failures;
        totals.events += run.events.len() as u64;
        let events = run.events;

        for event in &events {
            isolate("event sink", frame_index, || {
                shared.sink.publish(event);
                Ok(())
            });
        }

        let annotated = annotate(&frame, frame_index, &events);
        shared.buffer.push(annotated.clone());

        totals.callback_failures += invoke_callbacks(&mut callbacks, &annotated, &events);

        let elapsed = started.elapsed();
        shared.status.update(|s| {
            s.current_frame = totals.frames;
            s.events_detected = totals.events;
            s.analyzer_failures = totals.analyzer_failures;
            s.callback_failures = totals.callback_failures;
            s.elapsed = elapsed;
            s.effective_fps = if elapsed.is_zero() {
                0.0
            } else {
                totals.frames as f64 / elapsed.as_secs_f64()
            };
            s.last_update = Some(SystemTime::now());
        });

        let cycle_time = cycle_start.elapsed();
        metrics::counter!("camview_frames_processed").increment(1);
        metrics::counter!("camview_events_published").increment(events.len() as u64);
        metrics::counter!("camview_analyzer_failures").increment(run.failures);
        metrics::histogram!("camview_cycle_time_us").record(cycle_time.as_micros() as f64);
        debug!(
            frame = frame_index,
            events = events.len(),
            "Cycle took {:?}",
            cycle_time
        );

        // A slow cycle falls behind real time instead of skipping frames
        if let Some(remaining) = pacing.and_then(|target| target.checked_sub(cycle_time)) {
            match cancel.recv_timeout(remaining) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Exit::Cancelled,
            }
        }
    }
}

fn invoke_callbacks(callbacks: &mut Callbacks, frame: &Frame, events: &[Event]) -> u64 {
    let frame_index = frame.sequence();
    let mut failures = 0;
    if let Some(on_frame) = callbacks.on_frame.as_mut() {
        if !isolate("frame callback", frame_index, || on_frame(frame, events)) {
            failures += 1;
        }
    }
    if !events.is_empty() {
        if let Some(on_events) = callbacks.on_events.as_mut() {
            if !isolate("event callback", frame_index, || on_events(events)) {
                failures += 1;
            }
        }
    }
    failures
}

/// Run `f`, logging an error or panic instead of propagating it.
fn isolate(what: &str, frame_index: u64, f: impl FnOnce() -> Result<()>) -> bool {
    let outcome = panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(eyre!("panicked: {}", panic_message(&*payload))));
    match outcome {
        Ok(()) => true,
        Err(e) => {
            error!(frame = frame_index, "{} failed: {:#}", what, e);
            false
        }
    }
}

fn pin_to_core(id: usize) {
    let core = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|core| core.id == id));
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!("Pinned pipeline thread to core {}", id);
        }
        _ => warn!("Could not pin pipeline thread to core {}", id),
    }
}
