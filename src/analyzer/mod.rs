//! Pluggable frame analyzers.

pub mod motion;

use std::panic::{self, AssertUnwindSafe};

use color_eyre::{eyre::eyre, Result};
use tracing::error;

use crate::capture::Frame;
use crate::events::Event;

pub use motion::{MotionAnalyzer, MotionConfig};

/// Inspects a frame and reports findings.
///
/// Called once per frame, in frame order, from the pipeline's producer
/// thread. State may be kept across calls. The thread can differ between
/// runs of the pipeline.
pub trait Analyzer: Send {
    fn name(&self) -> &str;

    fn process(&mut self, frame: &Frame, frame_index: u64) -> Result<Vec<Event>>;
}

/// Adapts a closure into an [`Analyzer`].
pub struct FnAnalyzer<F> {
    name: String,
    f: F,
}

pub fn analyzer_fn<F>(name: impl Into<String>, f: F) -> FnAnalyzer<F>
where
    F: FnMut(&Frame, u64) -> Result<Vec<Event>> + Send,
{
    FnAnalyzer {
        name: name.into(),
        f,
    }
}

impl<F> Analyzer for FnAnalyzer<F>
where
    F: FnMut(&Frame, u64) -> Result<Vec<Event>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, frame: &Frame, frame_index: u64) -> Result<Vec<Event>> {
        (self.f)(frame, frame_index)
    }
}

/// What one pass over the analyzer set produced for a frame.
#[derive(Debug, Default)]
pub struct AnalyzerRun {
    /// Events in analyzer registration order, then emission order.
    pub events: Vec<Event>,
    /// Analyzers that returned an error or panicked on this frame.
    pub failures: u64,
}

/// Ordered analyzers, run sequentially against each frame.
#[derive(Default)]
pub struct AnalyzerSet {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl AnalyzerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, analyzer: Box<dyn Analyzer>) {
        self.analyzers.push(analyzer);
    }

    pub fn with(mut self, analyzer: impl Analyzer + 'static) -> Self {
        self.push(Box::new(analyzer));
        self
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.analyzers.iter().map(|a| a.name().to_string()).collect()
    }

    /// Run every analyzer. A failing analyzer contributes no events for this
    /// frame and does not stop the ones after it.
    pub fn process(&mut self, frame: &Frame, frame_index: u64) -> AnalyzerRun {
        let mut run = AnalyzerRun::default();
        for analyzer in &mut self.analyzers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                analyzer.process(frame, frame_index)
            }))
            .unwrap_or_else(|payload| Err(eyre!("panicked: {}", panic_message(&*payload))));

            match outcome {
                Ok(events) => run.events.extend(events),
                Err(e) => {
                    run.failures += 1;
                    error!(
                        analyzer = analyzer.name(),
                        frame = frame_index,
                        "Analyzer failed: {:#}",
                        e
                    );
                }
            }
        }
        run
    }
}

impl FromIterator<Box<dyn Analyzer>> for AnalyzerSet {
    fn from_iter<I: IntoIterator<Item = Box<dyn Analyzer>>>(iter: I) -> Self {
        Self {
            analyzers: iter.into_iter().collect(),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::events::Severity;

    fn frame() -> Frame {
        Frame::new(vec![0u8; 3], 1, 1, PixelFormat::Rgb24, "CAM".into()).with_sequence(1)
    }

    #[test]
    fn failures_are_isolated_per_analyzer() {
        let mut set = AnalyzerSet::new()
            .with(analyzer_fn("first", |f: &Frame, _| {
                Ok(vec![Event::for_frame("a", f)])
            }))
            .with(analyzer_fn("broken", |_: &Frame, _| Err(eyre!("model not loaded"))))
            .with(analyzer_fn("panics", |_: &Frame, _| -> Result<Vec<Event>> {
                panic!("index out of range")
            }))
            .with(analyzer_fn("last", |f: &Frame, _| {
                Ok(vec![
                    Event::for_frame("b", f),
                    Event::for_frame("c", f).with_severity(Severity::Warning),
                ])
            }));

        let run = set.process(&frame(), 1);
        let kinds: Vec<&str> = run.events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, ["a", "b", "c"]);
        assert_eq!(run.failures, 2);
        assert_eq!(set.names(), ["first", "broken", "panics", "last"]);
    }

    #[test]
    fn analyzers_keep_state_between_frames() {
        let mut seen = Vec::new();
        let mut set = AnalyzerSet::new().with(analyzer_fn("counter", move |_: &Frame, idx| {
            seen.push(idx);
            Ok(if seen.len() == 2 {
                vec![Event::new("second", "CAM", std::time::SystemTime::now())]
            } else {
                Vec::new()
            })
        }));
        assert!(set.process(&frame(), 1).events.is_empty());
        assert_eq!(set.process(&frame(), 2).events.len(), 1);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 3)).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom 3");
    }
}
