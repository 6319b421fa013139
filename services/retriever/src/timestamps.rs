//! Epoch bound reconstruction and epoch unit handling.
//!
//! Devices stamp frames with PTS ticks. The absolute time range of a chunk is
//! normally carried alongside the PTS range, but older recorders omit it. In
//! that case the range is extrapolated from a compact table of
//! `(pts, epoch)` samples taken during the recording.

use crate::json::lenient_i64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Epoch values at or above this magnitude are milliseconds, below are seconds.
const MILLIS_THRESHOLD: f64 = 1e11;

/// Errors raised while reconstructing epoch bounds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimestampError {
    #[error("Insufficient timestamp samples: {0}")]
    InsufficientSamples(String),
}

/// One entry of the compact timestamp table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampSample {
    /// Device-local tick
    pub pts: i64,
    /// Absolute time at that tick
    pub epoch: i64,
}

impl TimestampSample {
    pub fn new(pts: i64, epoch: i64) -> Self {
        Self { pts, epoch }
    }
}

/// PTS range of a chunk together with its absolute time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochBounds {
    pub pts_start: i64,
    pub pts_end: i64,
    pub epoch_start: i64,
    pub epoch_end: i64,
}

impl EpochBounds {
    /// Epoch units per PTS tick.
    ///
    /// `None` unless the PTS span is non-empty and the epoch range moves
    /// forward, or when either span does not fit in an `i64`.
    pub fn pts_to_epoch_factor(&self) -> Option<f64> {
        if self.pts_end == self.pts_start || self.epoch_end <= self.epoch_start {
            return None;
        }
        let epoch_span = self.epoch_end.checked_sub(self.epoch_start)?;
        let pts_span = self.pts_end.checked_sub(self.pts_start)?;
        Some(epoch_span as f64 / pts_span as f64)
    }
}

/// Extrapolate the epoch bounds of `[target_pts_start, target_pts_end]` from
/// the first and last entries of `samples`.
///
/// The start is anchored on the first sample and the end on the last sample,
/// so targets outside the sampled range are extrapolated from the nearest
/// end. Results are rounded half away from zero and must describe a range
/// that moves forward.
pub fn reconstruct(
    samples: &[TimestampSample],
    target_pts_start: i64,
    target_pts_end: i64,
) -> Result<(i64, i64), TimestampError> {
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) if samples.len() >= 2 => (first, last),
        _ => {
            return Err(TimestampError::InsufficientSamples(format!(
                "need at least 2 samples, got {}",
                samples.len()
            )))
        }
    };

    if last.pts == first.pts {
        return Err(TimestampError::InsufficientSamples(format!(
            "first and last samples share pts {}",
            first.pts
        )));
    }

    let overflow = || TimestampError::InsufficientSamples("sample span overflows".to_string());
    let epoch_span = last.epoch.checked_sub(first.epoch).ok_or_else(overflow)?;
    let pts_span = last.pts.checked_sub(first.pts).ok_or_else(overflow)?;
    let factor = epoch_span as f64 / pts_span as f64;

    let from_first = target_pts_start.checked_sub(first.pts).ok_or_else(overflow)?;
    let from_last = target_pts_end.checked_sub(last.pts).ok_or_else(overflow)?;
    let epoch_start = (from_first as f64 * factor + first.epoch as f64).round() as i64;
    let epoch_end = (from_last as f64 * factor + last.epoch as f64).round() as i64;

    if epoch_end <= epoch_start {
        return Err(TimestampError::InsufficientSamples(format!(
            "reconstructed range {epoch_start}..{epoch_end} does not move forward"
        )));
    }

    Ok((epoch_start, epoch_end))
}

/// Read the samples of a compact timestamp table.
///
/// The table is an object named `partial_timestamps` whose entries hold
/// `pts_start` and `converted_time`; document order is sample order.
pub fn parse_timestamp_table(table: &Value) -> Result<Vec<TimestampSample>, TimestampError> {
    let entries = table
        .get("partial_timestamps")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            TimestampError::InsufficientSamples("partial_timestamps object missing".to_string())
        })?;

    let samples: Vec<TimestampSample> = entries
        .values()
        .filter_map(|entry| {
            let pts = entry.get("pts_start").and_then(lenient_i64)?;
            let epoch = entry.get("converted_time").and_then(lenient_i64)?;
            Some(TimestampSample::new(pts, epoch))
        })
        .collect();

    if samples.len() < 2 {
        return Err(TimestampError::InsufficientSamples(format!(
            "partial_timestamps holds {} usable entries",
            samples.len()
        )));
    }

    Ok(samples)
}

/// Convert an epoch value given in seconds or milliseconds to a timestamp.
pub fn from_epoch_seconds_or_millis(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let micros = if value.abs() >= MILLIS_THRESHOLD {
        value * 1_000.0
    } else {
        value * 1_000_000.0
    };
    DateTime::from_timestamp_micros(micros.round() as i64)
}
