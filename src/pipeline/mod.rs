pub mod annotate;
pub mod engine;
pub mod error;
pub mod ringbuf;
pub mod status;
mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use annotate::annotate;
pub use engine::{EventCallback, FrameCallback, Pipeline, SourceInfo, StopOutcome};
pub use error::PipelineError;
pub use ringbuf::{BufferStats, FrameBuffer};
pub use status::{EngineState, Status, StatusHandle};

/// Lock that survives a panicked holder. Panics inside analyzers and
/// callbacks are contained, so poisoned state is still consistent.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
