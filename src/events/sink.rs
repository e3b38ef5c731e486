use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use tracing::{error, warn};

use super::Event;
use crate::analyzer::panic_message;

/// Receives every event the moment the pipeline produces it.
///
/// `publish` runs synchronously on the producer thread, so implementations
/// must return quickly and must not fail loudly.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn publish(&self, event: &Event) {
        (**self).publish(event)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &Event) {}
}

/// Hands events to observers through a bounded channel without ever blocking.
pub struct ChannelSink {
    tx: Sender<Event>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = flume::bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the channel was full or every receiver was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: &Event) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    warn!("Event channel full, {} events dropped so far", n);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Publishes to several sinks in order. A sink that panics is logged and
/// skipped; the sinks after it still receive the event.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &Event) {
        for sink in &self.sinks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.publish(event))) {
                error!(
                    event = %event.event_id,
                    "Event sink panicked: {}",
                    panic_message(&*payload)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn event(kind: &str) -> Event {
        Event::new(kind, "CAM", SystemTime::now())
    }

    #[test]
    fn channel_sink_drops_instead_of_blocking() {
        let (sink, rx) = ChannelSink::bounded(2);
        for kind in ["a", "b", "c"] {
            sink.publish(&event(kind));
        }
        assert_eq!(sink.dropped(), 1);
        let kinds: Vec<String> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, ["a", "b"]);
    }

    #[test]
    fn channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::bounded(2);
        drop(rx);
        sink.publish(&event("a"));
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let (first, rx1) = ChannelSink::bounded(4);
        let (second, rx2) = ChannelSink::bounded(4);
        let fanout = FanoutSink::new()
            .with(Arc::new(first))
            .with(Arc::new(NullSink))
            .with(Arc::new(second));
        assert_eq!(fanout.len(), 3);

        fanout.publish(&event("x"));
        assert_eq!(rx1.try_recv().unwrap().kind, "x");
        assert_eq!(rx2.try_recv().unwrap().kind, "x");
    }

    struct Exploding;

    impl EventSink for Exploding {
        fn publish(&self, event: &Event) {
            panic!("cannot publish {}", event.kind);
        }
    }

    #[test]
    fn panicking_sink_does_not_starve_later_sinks() {
        let (first, rx1) = ChannelSink::bounded(4);
        let (last, rx2) = ChannelSink::bounded(4);
        let fanout = FanoutSink::new()
            .with(Arc::new(first))
            .with(Arc::new(Exploding))
            .with(Arc::new(last));

        fanout.publish(&event("x"));
        fanout.publish(&event("y"));
        let kinds: Vec<String> = rx1.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, ["x", "y"]);
        let kinds: Vec<String> = rx2.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, ["x", "y"]);
    }
}
