//! Processing status shared with observers as copied snapshots.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use super::lock;

/// `Idle -> Loaded -> Running -> {Stopped, Completed}`; attaching a new
/// source from `Stopped` or `Completed` returns to `Loaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum EngineState {
    #[default]
    Idle,
    Loaded,
    Running,
    Stopped,
    Completed,
}

/// Point-in-time copy of the pipeline's progress.
///
/// Every field comes from the same completed cycle. A snapshot never
/// reflects a frame that is still being processed.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Status {
    pub state: EngineState,
    pub is_processing: bool,
    /// Frames fully processed in the current or last run.
    pub current_frame: u64,
    pub total_frames: Option<u64>,
    /// Nominal frame rate the run is paced to.
    pub fps: f64,
    /// Frames processed per second of wall time so far.
    pub effective_fps: f64,
    pub events_detected: u64,
    pub analyzer_failures: u64,
    pub callback_failures: u64,
    /// Time since the run started, as of the last completed cycle.
    pub elapsed: Duration,
    /// Total run time, set once the run has ended.
    pub processing_time: Option<Duration>,
    pub last_update: Option<SystemTime>,
    pub source: Option<String>,
}

impl Status {
    /// Percent of the known frame count processed so far.
    pub fn progress(&self) -> Option<f64> {
        match self.total_frames {
            Some(total) if total > 0 => {
                Some((self.current_frame as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

/// Cloneable read handle onto the live status record.
///
/// Only the pipeline mutates the record; observers get copies.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<Status>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every field, taken under the lock.
    pub fn snapshot(&self) -> Status {
        lock(&self.inner).clone()
    }

    pub fn state(&self) -> EngineState {
        lock(&self.inner).state
    }

    /// Apply a mutation atomically with respect to `snapshot`.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Status) -> R) -> R {
        f(&mut lock(&self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn default_snapshot_is_idle() {
        let status = StatusHandle::new().snapshot();
        assert_eq!(status.state, EngineState::Idle);
        assert!(!status.is_processing);
        assert_eq!(status.current_frame, 0);
        assert_eq!(status.progress(), None);
    }

    #[test]
    fn progress_is_bounded() {
        let status = Status {
            current_frame: 5,
            total_frames: Some(10),
            ..Status::default()
        };
        assert_eq!(status.progress(), Some(50.0));
        let over = Status {
            current_frame: 12,
            total_frames: Some(10),
            ..Status::default()
        };
        assert_eq!(over.progress(), Some(100.0));
    }

    #[test]
    fn snapshots_are_detached_copies() {
        let handle = StatusHandle::new();
        let before = handle.snapshot();
        handle.update(|s| s.current_frame = 3);
        assert_eq!(before.current_frame, 0);
        assert_eq!(handle.snapshot().current_frame, 3);
    }

    #[test]
    fn readers_never_see_half_updates() {
        let handle = StatusHandle::new();
        let writer = {
            let handle = handle.clone();
            thread::spawn(move || {
                for n in 1..=20_000u64 {
                    handle.update(|s| {
                        s.current_frame = n;
                        s.events_detected = n * 2;
                        s.elapsed = Duration::from_millis(n);
                    });
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        let s = handle.snapshot();
                        assert_eq!(s.events_detected, s.current_frame * 2);
                        assert_eq!(s.elapsed, Duration::from_millis(s.current_frame));
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
