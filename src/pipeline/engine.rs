//! Pipeline engine: owns the source, drives one producer thread per run and
//! exposes the frame buffer and status to observers.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, instrument, warn};

use super::error::{PipelineError, Result};
use super::lock;
use super::ringbuf::FrameBuffer;
use super::status::{EngineState, Status, StatusHandle};
use super::worker::{self, Shared};
use crate::analyzer::{Analyzer, AnalyzerSet};
use crate::capture::{open_source, Frame, FrameSource, SourceDescriptor};
use crate::events::{Event, EventSink, NullSink};
use crate::{CaptureConfig, PipelineConfig};

/// Called with every annotated frame and the events raised for it.
pub type FrameCallback = Box<dyn FnMut(&Frame, &[Event]) -> color_eyre::Result<()> + Send>;

/// Called with the events of a frame, only when there are any.
pub type EventCallback = Box<dyn FnMut(&[Event]) -> color_eyre::Result<()> + Send>;

#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_frame: Option<FrameCallback>,
    pub on_events: Option<EventCallback>,
}

/// What the engine learned about a source when it was attached.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub description: String,
    /// Rate the run is paced to. Falls back to the configured default when
    /// the source reports nothing usable.
    pub fps: f64,
    /// Whether `fps` came from the source itself.
    pub fps_reported: bool,
    pub total_frames: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No run was in progress.
    NotRunning,
    /// The producer observed the cancellation and exited in time.
    Clean,
    /// The producer did not exit within the stop timeout. The source was
    /// released anyway if the producer was not holding it.
    TimedOut,
}

struct Worker {
    handle: JoinHandle<()>,
    /// Dropped to request cancellation.
    cancel: Option<Sender<()>>,
    /// Disconnects once the producer has released everything.
    done: Receiver<()>,
}

impl Worker {
    /// The producer publishes its final state just before the thread exits,
    /// so a run that ended on its own counts as finished from that point.
    /// After a timed-out stop only the thread itself is trusted.
    fn is_finished(&self, state: EngineState) -> bool {
        self.handle.is_finished()
            || (self.cancel.is_some()
                && matches!(state, EngineState::Completed | EngineState::Stopped))
    }
}

/// Frame-processing engine.
///
/// ```text
/// Idle --attach--> Loaded --start--> Running --stop--> Stopped
///                                            \--exhausted--> Completed
/// ```
///
/// Configuration (source, analyzers, callbacks, buffer capacity) can only be
/// changed while no run is in progress.
pub struct Pipeline {
    config: PipelineConfig,
    capture: CaptureConfig,
    source: Arc<Mutex<Option<Box<dyn FrameSource>>>>,
    source_info: Option<SourceInfo>,
    analyzers: Arc<Mutex<AnalyzerSet>>,
    /// Kept outside the mutex the producer holds for a whole run.
    analyzer_names: Vec<String>,
    callbacks: Arc<Mutex<Callbacks>>,
    sink: Arc<dyn EventSink>,
    buffer: Arc<FrameBuffer>,
    status: StatusHandle,
    worker: Option<Worker>,
}

impl Pipeline {
    /// Engine with default settings that discards events.
    pub fn new() -> Self {
        Self::build(
            PipelineConfig::default(),
            CaptureConfig::default(),
            Arc::new(NullSink),
            FrameBuffer::default(),
        )
    }

    pub fn from_config(config: &crate::Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        Self::with_sink(config.pipeline.clone(), config.capture.clone(), sink)
    }

    pub fn with_sink(
        config: PipelineConfig,
        capture: CaptureConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let buffer = FrameBuffer::new(config.frame_buffer_size)?;
        Ok(Self::build(config, capture, sink, buffer))
    }

    fn build(
        config: PipelineConfig,
        capture: CaptureConfig,
        sink: Arc<dyn EventSink>,
        buffer: FrameBuffer,
    ) -> Self {
        Self {
            config,
            capture,
            source: Arc::new(Mutex::new(None)),
            source_info: None,
            analyzers: Arc::new(Mutex::new(AnalyzerSet::new())),
            analyzer_names: Vec::new(),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            sink,
            buffer: Arc::new(buffer),
            status: StatusHandle::new(),
            worker: None,
        }
    }

    /// Open the source a descriptor names and make it the one the next run
    /// reads from.
    #[instrument(skip(self))]
    pub fn attach_source(&mut self, descriptor: &SourceDescriptor) -> Result<SourceInfo> {
        self.ensure_idle()?;
        let source = open_source(descriptor, &self.capture).map_err(|e| {
            warn!("Cannot open {}: {:#}", descriptor, e);
            PipelineError::source_unavailable(format!("{}: {:#}", descriptor, e))
        })?;
        self.attach(source)
    }

    /// Attach a caller-built source, opening it if needed. A previously
    /// attached source is released once the new one is open; if opening
    /// fails the previous source stays attached.
    pub fn attach(&mut self, mut source: Box<dyn FrameSource>) -> Result<SourceInfo> {
        self.ensure_idle()?;
        if !source.is_open() {
            source.open().map_err(|e| {
                PipelineError::source_unavailable(format!("{}: {:#}", source.describe(), e))
            })?;
        }
        self.release_source();

        let reported = source.frame_rate().filter(|fps| fps.is_finite() && *fps > 0.0);
        let info = SourceInfo {
            description: source.describe(),
            fps: reported.unwrap_or(self.config.default_fps),
            fps_reported: reported.is_some(),
            total_frames: source.total_frames(),
        };
        if !info.fps_reported {
            debug!(
                "{} reports no frame rate, using {}",
                info.description, info.fps
            );
        }
        info!(
            "Attached {} ({:.2} fps, {} frames)",
            info.description,
            info.fps,
            info.total_frames
                .map_or_else(|| "unknown".to_string(), |n| n.to_string())
        );

        *lock(&self.source) = Some(source);
        self.status.update(|s| {
            *s = Status {
                state: EngineState::Loaded,
                total_frames: info.total_frames,
                fps: info.fps,
                source: Some(info.description.clone()),
                last_update: Some(SystemTime::now()),
                ..Status::default()
            };
        });
        self.source_info = Some(info.clone());
        Ok(info)
    }

    /// Release the attached source without running it.
    pub fn detach_source(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.release_source();
        self.source_info = None;
        self.status.update(|s| *s = Status::default());
        Ok(())
    }

    /// Launch the producer thread and return immediately.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        self.ensure_idle()?;
        let info = self.source_info.clone().ok_or(PipelineError::NoSource)?;
        match lock(&self.source).as_ref() {
            Some(source) if source.is_open() => {}
            _ => return Err(PipelineError::NoSource),
        }

        // Frames from a previous run are stale for preview consumers
        self.buffer.clear();
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        let started = SystemTime::now();
        self.status.update(|s| {
            *s = Status {
                state: EngineState::Running,
                is_processing: true,
                total_frames: info.total_frames,
                fps: info.fps,
                source: Some(info.description.clone()),
                last_update: Some(started),
                ..Status::default()
            };
        });

        let shared = Shared {
            source: Arc::clone(&self.source),
            analyzers: Arc::clone(&self.analyzers),
            callbacks: Arc::clone(&self.callbacks),
            sink: Arc::clone(&self.sink),
            buffer: Arc::clone(&self.buffer),
            status: self.status.clone(),
        };
        let pacing = frame_interval(info.fps);
        if pacing.is_none() {
            debug!("No usable frame interval for {} fps, running unpaced", info.fps);
        }
        let pin_core = self.config.pin_core;

        let spawned = thread::Builder::new()
            .name("camview-pipeline".into())
            .spawn(move || worker::run(shared, pacing, pin_core, cancel_rx, done_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.status.update(|s| {
                    s.state = EngineState::Loaded;
                    s.is_processing = false;
                });
                return Err(PipelineError::Spawn(e));
            }
        };

        info!("Pipeline started on {}", info.description);
        self.worker = Some(Worker {
            handle,
            cancel: Some(cancel_tx),
            done: done_rx,
        });
        Ok(())
    }

    /// Request cancellation and wait up to the stop timeout for the producer
    /// to exit. The source is released either way.
    pub fn stop(&mut self) -> StopOutcome {
        let Some(mut worker) = self.worker.take() else {
            return StopOutcome::NotRunning;
        };
        if worker.is_finished(self.status.state()) {
            join(worker.handle);
            return StopOutcome::NotRunning;
        }

        drop(worker.cancel.take());
        let timeout = Duration::from_millis(self.config.stop_timeout_ms);
        match worker.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Pipeline did not stop within {:?}, releasing source anyway",
                    timeout
                );
                self.force_release_source();
                self.status.update(|s| {
                    s.state = EngineState::Stopped;
                    s.is_processing = false;
                    s.last_update = Some(SystemTime::now());
                });
                self.worker = Some(worker);
                StopOutcome::TimedOut
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                join(worker.handle);
                info!("Pipeline stopped");
                StopOutcome::Clean
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let state = self.status.state();
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished(state))
    }

    pub fn status(&self) -> Status {
        self.status.snapshot()
    }

    pub fn state(&self) -> EngineState {
        self.status.state()
    }

    /// Handle observers on other threads can poll.
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn frame_buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn source_info(&self) -> Option<&SourceInfo> {
        self.source_info.as_ref()
    }

    pub fn set_frame_buffer_capacity(&mut self, capacity: usize) -> Result<()> {
        self.ensure_idle()?;
        self.buffer.resize(capacity)?;
        self.config.frame_buffer_size = capacity;
        Ok(())
    }

    pub fn set_analyzers(&mut self, analyzers: AnalyzerSet) -> Result<()> {
        self.ensure_idle()?;
        self.analyzer_names = analyzers.names();
        *lock(&self.analyzers) = analyzers;
        Ok(())
    }

    pub fn add_analyzer(&mut self, analyzer: Box<dyn Analyzer>) -> Result<()> {
        self.ensure_idle()?;
        self.analyzer_names.push(analyzer.name().to_string());
        lock(&self.analyzers).push(analyzer);
        Ok(())
    }

    /// Names of the configured analyzers. Never waits on a running producer.
    pub fn analyzer_names(&self) -> Vec<String> {
        self.analyzer_names.clone()
    }

    pub fn set_callbacks(
        &mut self,
        on_frame: Option<FrameCallback>,
        on_events: Option<EventCallback>,
    ) -> Result<()> {
        self.ensure_idle()?;
        *lock(&self.callbacks) = Callbacks {
            on_frame,
            on_events,
        };
        Ok(())
    }

    /// Reap a finished producer, or reject the call if one is still alive.
    fn ensure_idle(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) if !worker.is_finished(self.status.state()) => {
                self.worker = Some(worker);
                Err(PipelineError::Running)
            }
            Some(worker) => {
                join(worker.handle);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn release_source(&mut self) {
        if let Some(mut source) = lock(&self.source).take() {
            debug!("Releasing {}", source.describe());
            source.release();
        }
    }

    /// Release without waiting on a producer stuck inside `read`. The
    /// producer releases it itself on exit if the lock is held.
    fn force_release_source(&mut self) {
        match self.source.try_lock() {
            Ok(mut slot) => {
                if let Some(mut source) = slot.take() {
                    source.release();
                }
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                if let Some(mut source) = poisoned.into_inner().take() {
                    source.release();
                }
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                warn!("Source busy in a read, it will be released when the producer exits");
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
        if !self.is_running() {
            self.release_source();
        }
    }
}

/// Target time per frame, or `None` when `fps` gives no representable
/// interval (non-positive, non-finite, or too small for a `Duration`).
fn frame_interval(fps: f64) -> Option<Duration> {
    if !(fps.is_finite() && fps > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / fps).ok()
}

fn join(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("Pipeline thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use color_eyre::eyre::eyre;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        remaining: u64,
        fps: Option<f64>,
        open: bool,
        fail_open: bool,
        releases: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(frames: u64, fps: Option<f64>) -> (Self, Arc<AtomicU32>) {
            let releases = Arc::new(AtomicU32::new(0));
            (
                Self {
                    remaining: frames,
                    fps,
                    open: false,
                    fail_open: false,
                    releases: Arc::clone(&releases),
                },
                releases,
            )
        }
    }

    impl FrameSource for Scripted {
        fn open(&mut self) -> color_eyre::Result<()> {
            if self.fail_open {
                return Err(eyre!("device busy"));
            }
            self.open = true;
            Ok(())
        }

        fn read(&mut self) -> color_eyre::Result<Option<Frame>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame::new(
                vec![0u8; 12],
                2,
                2,
                PixelFormat::Rgb24,
                "TEST".into(),
            )))
        }

        fn frame_rate(&self) -> Option<f64> {
            self.fps
        }

        fn total_frames(&self) -> Option<u64> {
            None
        }

        fn release(&mut self) {
            if self.open {
                self.open = false;
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[test]
    fn fps_falls_back_to_default() {
        let mut pipeline = Pipeline::new();
        for fps in [None, Some(0.0), Some(-5.0), Some(f64::NAN)] {
            let (source, _) = Scripted::new(1, fps);
            let info = pipeline.attach(Box::new(source)).unwrap();
            assert_eq!(info.fps, 30.0);
            assert!(!info.fps_reported);
        }
        let (source, _) = Scripted::new(1, Some(12.0));
        let info = pipeline.attach(Box::new(source)).unwrap();
        assert_eq!(info.fps, 12.0);
        assert!(info.fps_reported);
    }

    #[test]
    fn start_without_source_fails() {
        let mut pipeline = Pipeline::new();
        assert!(matches!(pipeline.start(), Err(PipelineError::NoSource)));
        assert_eq!(pipeline.state(), EngineState::Idle);
    }

    #[test]
    fn failed_open_is_reported_not_raised() {
        let mut pipeline = Pipeline::new();
        let (mut source, releases) = Scripted::new(1, None);
        source.fail_open = true;
        let err = pipeline.attach(Box::new(source)).unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable(_)));
        assert_eq!(pipeline.state(), EngineState::Idle);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reattaching_releases_the_previous_source() {
        let mut pipeline = Pipeline::new();
        let (first, first_releases) = Scripted::new(1, None);
        let (second, second_releases) = Scripted::new(1, None);
        pipeline.attach(Box::new(first)).unwrap();
        pipeline.attach(Box::new(second)).unwrap();
        assert_eq!(first_releases.load(Ordering::SeqCst), 1);
        pipeline.detach_source().unwrap();
        assert_eq!(second_releases.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.state(), EngineState::Idle);
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let mut pipeline = Pipeline::new();
        let (source, releases) = Scripted::new(3, None);
        pipeline.attach(Box::new(source)).unwrap();
        assert_eq!(pipeline.stop(), StopOutcome::NotRunning);
        assert_eq!(pipeline.stop(), StopOutcome::NotRunning);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.state(), EngineState::Loaded);
    }

    #[test]
    fn zero_capacity_config_is_rejected() {
        let config = PipelineConfig {
            frame_buffer_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Pipeline::with_sink(config, CaptureConfig::default(), Arc::new(NullSink)),
            Err(PipelineError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn frame_interval_skips_unrepresentable_rates() {
        assert_eq!(frame_interval(4.0), Some(Duration::from_millis(250)));
        assert_eq!(frame_interval(0.0), None);
        assert_eq!(frame_interval(-5.0), None);
        assert_eq!(frame_interval(f64::NAN), None);
        assert_eq!(frame_interval(f64::INFINITY), None);
        assert_eq!(frame_interval(1e-30), None);
        assert_eq!(frame_interval(f64::MIN_POSITIVE), None);
    }

    #[test]
    fn analyzer_names_follow_reconfiguration() {
        let mut pipeline = Pipeline::new();
        assert!(pipeline.analyzer_names().is_empty());
        pipeline
            .add_analyzer(Box::new(crate::analyzer::analyzer_fn("first", |_, _| {
                Ok(Vec::new())
            })))
            .unwrap();
        assert_eq!(pipeline.analyzer_names(), ["first"]);
        let set = AnalyzerSet::new()
            .with(crate::analyzer::analyzer_fn("a", |_, _| Ok(Vec::new())))
            .with(crate::analyzer::analyzer_fn("b", |_, _| Ok(Vec::new())));
        pipeline.set_analyzers(set).unwrap();
        assert_eq!(pipeline.analyzer_names(), ["a", "b"]);
    }
}
