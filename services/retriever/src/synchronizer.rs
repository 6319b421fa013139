//! Mapping frame signals onto the recording timeline.

use crate::json::{lenient_f64, lenient_i64};
use crate::mdf::MetadataDocument;
use crate::timestamps::{from_epoch_seconds_or_millis, EpochBounds};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Errors raised while synchronizing frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),
}

/// Value of one flattened frame attribute
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl SignalValue {
    /// Numeric view; `None` for booleans.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Bool(_) => None,
            SignalValue::Int(v) => Some(*v as f64),
            SignalValue::Float(v) => Some(*v),
        }
    }
}

pub type SignalMap = BTreeMap<String, SignalValue>;

/// Frames keyed by their offset from the recording start
pub type SynchronizedFrames = BTreeMap<Duration, SignalMap>;

/// Absolute time range of a recording, bounds inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RecordingWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SyncError> {
        if end < start {
            return Err(SyncError::InvalidBounds(format!(
                "recording ends at {end} before it starts at {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Build a window from epoch values in seconds or milliseconds.
    pub fn from_epoch(from: i64, to: i64) -> Result<Self, SyncError> {
        let convert = |value: i64| {
            from_epoch_seconds_or_millis(value as f64).ok_or_else(|| {
                SyncError::InvalidBounds(format!("epoch {value} is out of range"))
            })
        };
        Self::new(convert(from)?, convert(to)?)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

/// A frame as recorded: its PTS tick and its object list
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub pts: i64,
    pub objects: Vec<Map<String, Value>>,
}

impl RawFrame {
    /// Read a frame from its MDF form. Frames without a `timestamp` are rejected.
    pub fn from_value(frame: &Value) -> Option<Self> {
        let pts = frame.get("timestamp").and_then(lenient_i64)?;
        let objects = frame
            .get("objectlist")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_object).cloned().collect())
            .unwrap_or_default();
        Some(Self { pts, objects })
    }

    /// Flatten every object's attributes into one map.
    ///
    /// Within an object, floats override booleans and integers override both
    /// when names clash; later objects override earlier ones.
    pub fn signals(&self) -> SignalMap {
        let mut signals = SignalMap::new();
        for object in &self.objects {
            signals.extend(bool_attributes(object));
            signals.extend(float_attributes(object));
            signals.extend(int_attributes(object));
        }
        signals
    }
}

/// `(name, value)` pairs of one attribute category; entries missing either are skipped.
fn attributes<'a>(
    object: &'a Map<String, Value>,
    category: &str,
) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
    object
        .get(category)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|attribute| {
            let name = attribute.get("name")?.as_str()?;
            let value = attribute.get("value")?;
            Some((name, value))
        })
}

fn bool_attributes(object: &Map<String, Value>) -> impl Iterator<Item = (String, SignalValue)> + '_ {
    attributes(object, "boolAttributes").map(|(name, value)| {
        let flag = match value {
            Value::Bool(b) => *b,
            Value::String(s) => s == "true",
            _ => false,
        };
        (name.to_string(), SignalValue::Bool(flag))
    })
}

fn float_attributes(object: &Map<String, Value>) -> impl Iterator<Item = (String, SignalValue)> + '_ {
    attributes(object, "floatAttributes").filter_map(|(name, value)| {
        Some((name.to_string(), SignalValue::Float(lenient_f64(value)?)))
    })
}

fn int_attributes(object: &Map<String, Value>) -> impl Iterator<Item = (String, SignalValue)> + '_ {
    attributes(object, "integerAttributes").filter_map(|(name, value)| {
        Some((name.to_string(), SignalValue::Int(lenient_i64(value)?)))
    })
}

/// Place each frame on the recording timeline.
///
/// Frames falling outside `window` and frames without any signal are dropped.
/// When two frames land on the same offset the later one wins.
pub fn synchronize(
    bounds: &EpochBounds,
    frames: &[RawFrame],
    window: &RecordingWindow,
) -> Result<SynchronizedFrames, SyncError> {
    let factor = bounds.pts_to_epoch_factor().ok_or_else(|| {
        SyncError::InvalidBounds(format!(
            "pts {}..{} cannot map onto epoch {}..{}",
            bounds.pts_start, bounds.pts_end, bounds.epoch_start, bounds.epoch_end
        ))
    })?;

    let mut synchronized = SynchronizedFrames::new();
    let mut outside = 0usize;
    let mut silent = 0usize;

    for frame in frames {
        let Some(ticks) = frame.pts.checked_sub(bounds.pts_start) else {
            outside += 1;
            continue;
        };
        let epoch = ticks as f64 * factor + bounds.epoch_start as f64;
        let Some(absolute) = from_epoch_seconds_or_millis(epoch) else {
            outside += 1;
            continue;
        };
        if !window.contains(absolute) {
            outside += 1;
            continue;
        }

        let signals = frame.signals();
        if signals.is_empty() {
            silent += 1;
            continue;
        }
        synchronized.insert(absolute - window.start, signals);
    }

    debug!(
        frames = frames.len(),
        synchronized = synchronized.len(),
        outside_window = outside,
        without_signals = silent,
        "Frames synchronized"
    );

    Ok(synchronized)
}

/// Synchronize the frames of a normalized metadata document.
pub fn synchronize_document(
    document: &MetadataDocument,
    window: &RecordingWindow,
) -> Result<SynchronizedFrames, SyncError> {
    let bounds = document
        .bounds()
        .ok_or_else(|| SyncError::InvalidBounds("missing chunk bounds".to_string()))?;
    let frames: Vec<RawFrame> = document.frames.iter().filter_map(RawFrame::from_value).collect();
    synchronize(&bounds, &frames, window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn frame(pts: i64, signal: &str) -> RawFrame {
        RawFrame::from_value(&json!({
            "timestamp": pts,
            "objectlist": [{"boolAttributes": [{"name": signal, "value": "true"}]}]
        }))
        .unwrap()
    }

    fn bounds(pts: (i64, i64), epoch: (i64, i64)) -> EpochBounds {
        EpochBounds {
            pts_start: pts.0,
            pts_end: pts.1,
            epoch_start: epoch.0,
            epoch_end: epoch.1,
        }
    }

    #[test]
    fn test_frames_outside_window_are_dropped() {
        let window = RecordingWindow::from_epoch(3, 4).unwrap();
        let frames = [frame(1, "a"), frame(3, "b")];

        let synced = synchronize(&bounds((1, 2), (3, 4)), &frames, &window).unwrap();

        assert_eq!(synced.len(), 1);
        let (offset, signals) = synced.iter().next().unwrap();
        assert_eq!(*offset, Duration::zero());
        assert_eq!(signals.get("a"), Some(&SignalValue::Bool(true)));
    }

    #[test]
    fn test_offsets_stay_inside_window() {
        let start = 1_690_000_000_000;
        let window = RecordingWindow::from_epoch(start, start + 10_000).unwrap();
        let frames: Vec<RawFrame> = (0..40).map(|pts| frame(pts, "s")).collect();

        // 1 pts tick = 500 ms, recording covers ticks 0..=20
        let synced =
            synchronize(&bounds((0, 10), (start, start + 5_000)), &frames, &window).unwrap();

        assert_eq!(synced.len(), 21);
        for offset in synced.keys() {
            assert!(*offset >= Duration::zero());
            assert!(*offset <= window.duration());
        }
        assert_eq!(
            synced.keys().nth(1).copied(),
            Some(Duration::milliseconds(500))
        );
    }

    #[test]
    fn test_frames_without_signals_are_dropped() {
        let window = RecordingWindow::from_epoch(0, 100).unwrap();
        let frames = [
            RawFrame::from_value(&json!({"timestamp": 1})).unwrap(),
            RawFrame::from_value(&json!({"timestamp": 2, "objectlist": [{}]})).unwrap(),
            frame(3, "kept"),
        ];

        let synced = synchronize(&bounds((0, 100), (0, 100)), &frames, &window).unwrap();
        assert_eq!(synced.len(), 1);
        assert!(synced.contains_key(&Duration::seconds(3)));
    }

    #[test]
    fn test_colliding_offsets_keep_last_frame() {
        let window = RecordingWindow::from_epoch(0, 100).unwrap();
        let frames = [frame(5, "first"), frame(5, "second")];

        let synced = synchronize(&bounds((0, 10), (0, 10)), &frames, &window).unwrap();
        assert_eq!(synced.len(), 1);
        assert!(synced[&Duration::seconds(5)].contains_key("second"));
    }

    #[test]
    fn test_empty_pts_span_is_rejected() {
        let window = RecordingWindow::from_epoch(0, 100).unwrap();
        let result = synchronize(&bounds((7, 7), (0, 10)), &[frame(7, "a")], &window);
        assert!(matches!(result, Err(SyncError::InvalidBounds(_))));
    }

    #[test]
    fn test_backwards_epoch_range_is_rejected() {
        let window = RecordingWindow::from_epoch(0, 100).unwrap();
        let result = synchronize(&bounds((0, 10), (10, 10)), &[frame(1, "a")], &window);
        assert!(matches!(result, Err(SyncError::InvalidBounds(_))));
    }

    #[test]
    fn test_extreme_frame_pts_is_dropped() {
        let window = RecordingWindow::from_epoch(0, 100).unwrap();
        let frames = [frame(i64::MIN, "far"), frame(2, "near")];

        let synced = synchronize(&bounds((1, 10), (1, 10)), &frames, &window).unwrap();
        assert_eq!(synced.len(), 1);
        assert!(synced[&Duration::seconds(2)].contains_key("near"));
    }

    #[test]
    fn test_typed_attribute_extraction() {
        let raw = RawFrame::from_value(&json!({
            "timestamp": "12",
            "objectlist": [{
                "boolAttributes": [
                    {"name": "on", "value": "true"},
                    {"name": "off", "value": "1"},
                    {"value": "true"}
                ],
                "floatAttributes": [
                    {"name": "ratio", "value": "0.5"},
                    {"name": "broken", "value": "n/a"}
                ],
                "integerAttributes": [{"name": "count", "value": 3}]
            }]
        }))
        .unwrap();

        assert_eq!(raw.pts, 12);
        let signals = raw.signals();
        assert_eq!(signals.len(), 4);
        assert_eq!(signals["on"], SignalValue::Bool(true));
        assert_eq!(signals["off"], SignalValue::Bool(false));
        assert_eq!(signals["ratio"], SignalValue::Float(0.5));
        assert_eq!(signals["count"], SignalValue::Int(3));
    }

    #[test]
    fn test_frame_without_timestamp_is_rejected() {
        assert_eq!(RawFrame::from_value(&json!({"number": 1})), None);
    }

    #[test]
    fn test_document_without_bounds_is_rejected() {
        let document = MetadataDocument::from_merged(json!({
            "chunkPts": {"pts_start": 1, "pts_end": 2},
            "frame": [{"number": 1, "timestamp": 1}]
        }));
        let window = RecordingWindow::from_epoch(0, 10).unwrap();

        assert_eq!(
            synchronize_document(&document, &window),
            Err(SyncError::InvalidBounds("missing chunk bounds".to_string()))
        );
    }

    #[test]
    fn test_recording_window_validation() {
        assert!(RecordingWindow::from_epoch(10, 5).is_err());

        let window = RecordingWindow::from_epoch(1_688_991_627_000, 1_688_991_637_000).unwrap();
        assert_eq!(
            window.start,
            Utc.with_ymd_and_hms(2023, 7, 10, 12, 20, 27).unwrap()
        );
        assert_eq!(window.duration(), Duration::seconds(10));
    }
}
