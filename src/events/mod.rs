//! Events raised by analyzers and the sinks that receive them.

pub mod jsonl;
pub mod sink;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::capture::Frame;

pub use jsonl::JsonlEventLog;
pub use sink::{ChannelSink, EventSink, FanoutSink, NullSink};

/// Ordered severity: `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        })
    }
}

/// A discrete finding about a frame.
///
/// `timestamp` is the capture time of the frame the event was raised for,
/// never the time it was published.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: Uuid,
    pub kind: String,
    pub source_id: String,
    pub timestamp: SystemTime,
    pub severity: Severity,
    pub metadata: BTreeMap<String, Value>,
}

impl Event {
    /// New `Info` event with a fresh id.
    pub fn new(kind: impl Into<String>, source_id: impl Into<String>, timestamp: SystemTime) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind: kind.into(),
            source_id: source_id.into(),
            timestamp,
            severity: Severity::Info,
            metadata: BTreeMap::new(),
        }
    }

    /// Event stamped with the frame's source and capture time.
    pub fn for_frame(kind: impl Into<String>, frame: &Frame) -> Self {
        Self::new(kind, frame.source_id(), frame.captured_at())
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_confidence(self, confidence: f32) -> Self {
        self.with_metadata("confidence", confidence as f64)
    }

    /// Bounding box as `[x1, y1, x2, y2]` in pixels.
    pub fn with_bbox(self, bbox: [f32; 4]) -> Self {
        let values: Vec<Value> = bbox.iter().map(|v| Value::from(*v as f64)).collect();
        self.with_metadata("bbox", values)
    }

    /// Bounding box from metadata, if one is present and well formed.
    pub fn bbox(&self) -> Option<[f32; 4]> {
        let values = self.metadata.get("bbox")?.as_array()?;
        if values.len() != 4 {
            return None;
        }
        let mut out = [0f32; 4];
        for (slot, value) in out.iter_mut().zip(values) {
            *slot = value.as_f64()? as f32;
        }
        Some(out)
    }

    pub fn epoch_secs(&self) -> f64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Local time as `%Y-%m-%d %H:%M:%S`.
    pub fn time_fmt(&self) -> String {
        DateTime::<Local>::from(self.timestamp)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            id: self.event_id.to_string(),
            kind: self.kind.clone(),
            camera: self.source_id.clone(),
            time: self.epoch_secs(),
            time_fmt: self.time_fmt(),
            severity: self.severity,
            metadata: self.metadata.clone(),
        }
    }
}

/// Persisted shape of an event, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub camera: String,
    /// Seconds since the Unix epoch.
    pub time: f64,
    pub time_fmt: String,
    pub severity: Severity,
    pub metadata: BTreeMap<String, Value>,
}
