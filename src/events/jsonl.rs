//! Line-delimited JSON event log written from a background thread.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use color_eyre::{eyre::eyre, Result};
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use super::{Event, EventRecord, EventSink};

enum Message {
    Record(EventRecord),
    Close,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
}

/// Appends one `EventRecord` per line to a file.
///
/// `publish` only enqueues; disk I/O happens on the `camview-event-log`
/// thread. Records are dropped, with a warning, if the queue is full.
pub struct JsonlEventLog {
    path: PathBuf,
    tx: Sender<Message>,
    writer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl JsonlEventLog {
    pub fn open(path: impl AsRef<Path>, queue_capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eyre!("failed to open event log {}: {}", path.display(), e))?;

        let (tx, rx) = flume::bounded(queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let writer_counters = Arc::clone(&counters);
        let writer_path = path.clone();
        let handle = thread::Builder::new()
            .name("camview-event-log".into())
            .spawn(move || write_loop(file, rx, &writer_path, &writer_counters))?;

        info!("Event log: {}", path.display());
        Ok(Self {
            path,
            tx,
            writer: Mutex::new(Some(handle)),
            counters,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Flush queued records and stop the writer thread. Later publishes are dropped.
    pub fn close(&self) {
        let handle = match self.writer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };
        if self.tx.send(Message::Close).is_err() {
            debug!("Event log writer already gone");
        }
        if handle.join().is_err() {
            error!("Event log writer panicked");
        }
        info!(
            "Event log closed: {} written, {} dropped",
            self.written(),
            self.dropped()
        );
    }
}

impl EventSink for JsonlEventLog {
    fn publish(&self, event: &Event) {
        match self.tx.try_send(Message::Record(event.to_record())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let n = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    warn!("Event log queue full, {} records dropped so far", n);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Drop for JsonlEventLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_loop(file: File, rx: Receiver<Message>, path: &Path, counters: &Counters) {
    let mut out = BufWriter::new(file);
    while let Ok(first) = rx.recv() {
        let mut closing = false;
        for message in std::iter::once(first).chain(rx.try_iter()) {
            match message {
                Message::Record(record) => match write_record(&mut out, &record) {
                    Ok(()) => {
                        counters.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!("Failed to write event {} to {}: {}", record.id, path.display(), e)
                    }
                },
                Message::Close => closing = true,
            }
        }
        if let Err(e) = out.flush() {
            error!("Failed to flush {}: {}", path.display(), e);
        }
        if closing {
            break;
        }
    }
}

fn write_record(out: &mut impl Write, record: &EventRecord) -> Result<()> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use std::time::SystemTime;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let log = JsonlEventLog::open(&path, 16).unwrap();

        let first = Event::new("POTHOLE", "CAM_01", SystemTime::now()).with_metadata("area", 812);
        let second =
            Event::new("WRONG_SIDE", "CAM_01", SystemTime::now()).with_severity(Severity::Critical);
        log.publish(&first);
        log.publish(&second);
        log.close();

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<EventRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        let expected = first.to_record();
        assert_eq!(records[0].id, expected.id);
        assert_eq!(records[0].kind, "POTHOLE");
        assert_eq!(records[0].camera, "CAM_01");
        assert_eq!(records[0].metadata, expected.metadata);
        assert!((records[0].time - expected.time).abs() < 1e-3);
        assert_eq!(records[1].severity, Severity::Critical);
        assert_eq!(log.written(), 2);
    }

    #[test]
    fn appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        for _ in 0..2 {
            let log = JsonlEventLog::open(&path, 4).unwrap();
            log.publish(&Event::new("car", "CAM", SystemTime::now()));
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn publish_after_close_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::open(dir.path().join("e.jsonl"), 4).unwrap();
        log.close();
        log.publish(&Event::new("car", "CAM", SystemTime::now()));
        assert_eq!(log.dropped(), 1);
    }
}
