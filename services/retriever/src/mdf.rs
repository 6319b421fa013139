//! Metadata-full document (MDF) normalization.
//!
//! Recorders upload metadata as many JSON chunks, each carrying its own slice
//! of frames and its own PTS and UTC bounds. The normalized document has a
//! single bounds section covering every chunk and one frame list sorted by
//! frame number.

use crate::json::lenient_i64;
use crate::timestamps::{parse_timestamp_table, reconstruct, EpochBounds, TimestampError};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

const FRAME_KEY: &str = "frame";
const RESOLUTION_KEY: &str = "resolution";
const CHUNK_KEY: &str = "chunk";
const PTS_KEY: &str = "chunkPts";
const UTC_KEY: &str = "chunkUtc";
const EPOCH_MILLIS_DIGITS: u32 = 13;

/// Normalized metadata artifact
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataDocument {
    /// Video resolution of the first chunk
    pub resolution: Value,
    /// `(pts_start, pts_end)` across all chunks
    pub pts_bounds: Option<(i64, i64)>,
    /// `(utc_start, utc_end)` across all chunks
    pub epoch_bounds: Option<(i64, i64)>,
    /// Frames sorted by `number`
    pub frames: Vec<Value>,
    /// Every other top-level key of the merged chunks
    pub extra: Map<String, Value>,
}

impl MetadataDocument {
    /// Normalize the deep-merged chunk documents.
    ///
    /// Values that differed between chunks arrive as lists: bounds take the
    /// smallest start and the largest end, the resolution takes the first.
    pub fn from_merged(merged: Value) -> Self {
        let map = match merged {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut resolution = Value::Null;
        let mut sections = Vec::new();
        let mut frame_value = None;
        let mut extra = Map::new();
        for (key, value) in map {
            match key.as_str() {
                RESOLUTION_KEY => {
                    resolution = match value {
                        Value::Array(mut values) if !values.is_empty() => values.swap_remove(0),
                        other => other,
                    }
                }
                PTS_KEY | UTC_KEY | CHUNK_KEY => sections.push(value),
                FRAME_KEY => frame_value = Some(value),
                _ => {
                    extra.insert(key, value);
                }
            }
        }
        let pts_bounds = bound_range(&sections, "pts_start", "pts_end");
        let epoch_bounds = bound_range(&sections, "utc_start", "utc_end");

        let mut frames: Vec<(i64, Value)> = match frame_value {
            Some(Value::Array(frames)) => frames,
            Some(frame @ Value::Object(_)) => vec![frame],
            _ => Vec::new(),
        }
        .into_iter()
        .filter_map(|frame| {
            let non_empty = frame.as_object().is_some_and(|obj| !obj.is_empty());
            let number = frame.get("number").and_then(lenient_i64)?;
            non_empty.then_some((number, frame))
        })
        .collect();
        frames.sort_by_key(|(number, _)| *number);

        let mut document = Self {
            resolution,
            pts_bounds,
            epoch_bounds,
            frames: frames.into_iter().map(|(_, frame)| frame).collect(),
            extra,
        };
        document.repair_swapped_bounds();
        document
    }

    /// Combined bounds, when both the PTS and the epoch range are known.
    pub fn bounds(&self) -> Option<EpochBounds> {
        let (pts_start, pts_end) = self.pts_bounds?;
        let (epoch_start, epoch_end) = self.epoch_bounds?;
        Some(EpochBounds {
            pts_start,
            pts_end,
            epoch_start,
            epoch_end,
        })
    }

    /// True when the PTS range is known but the epoch range is not.
    pub fn needs_epoch_reconstruction(&self) -> bool {
        self.pts_bounds.is_some() && self.epoch_bounds.is_none()
    }

    /// Fill the epoch range from a compact timestamp table.
    pub fn reconstruct_epoch_bounds(&mut self, table: &Value) -> Result<(), TimestampError> {
        let Some((pts_start, pts_end)) = self.pts_bounds else {
            return Err(TimestampError::InsufficientSamples(
                "document has no pts bounds".to_string(),
            ));
        };

        let samples = parse_timestamp_table(table)?;
        let (epoch_start, epoch_end) = reconstruct(&samples, pts_start, pts_end)?;
        debug!(
            pts_start = pts_start,
            pts_end = pts_end,
            epoch_start = epoch_start,
            epoch_end = epoch_end,
            "Epoch bounds reconstructed"
        );
        self.epoch_bounds = Some((epoch_start, epoch_end));
        Ok(())
    }

    /// Older recorders sometimes write the epoch end into `pts_end`.
    fn repair_swapped_bounds(&mut self) {
        let (Some((pts_start, pts_end)), Some((utc_start, utc_end))) =
            (self.pts_bounds, self.epoch_bounds)
        else {
            return;
        };

        if digits(pts_end) == EPOCH_MILLIS_DIGITS && digits(utc_start) != EPOCH_MILLIS_DIGITS {
            warn!(
                pts_end = pts_end,
                utc_start = utc_start,
                "pts_end and utc_start look swapped, repairing"
            );
            self.pts_bounds = Some((pts_start, utc_start));
            self.epoch_bounds = Some((pts_end, utc_end));
        }
    }

    pub fn to_value(&self) -> Value {
        let mut chunk = Map::new();
        if let Some((start, end)) = self.pts_bounds {
            chunk.insert("pts_start".to_string(), json!(start));
            chunk.insert("pts_end".to_string(), json!(end));
        }
        if let Some((start, end)) = self.epoch_bounds {
            chunk.insert("utc_start".to_string(), json!(start));
            chunk.insert("utc_end".to_string(), json!(end));
        }

        let mut document = Map::new();
        document.insert(RESOLUTION_KEY.to_string(), self.resolution.clone());
        document.insert(CHUNK_KEY.to_string(), Value::Object(chunk));
        document.insert(FRAME_KEY.to_string(), json!(self.frames));
        for (key, value) in &self.extra {
            document.insert(key.clone(), value.clone());
        }
        Value::Object(document)
    }
}

/// Key of the compact timestamp table that accompanies an MDF key.
pub fn timestamp_table_key(mdf_key: &str) -> String {
    mdf_key.replace("_metadata_full", "_compact_mdf")
}

/// Smallest `start` and largest `end` found in any of the bound sections.
fn bound_range(sections: &[Value], start: &str, end: &str) -> Option<(i64, i64)> {
    let values = |field: &str| {
        sections
            .iter()
            .filter_map(|section| section.get(field))
            .flat_map(flatten)
            .filter_map(lenient_i64)
            .collect::<Vec<i64>>()
    };
    Some((
        values(start).into_iter().min()?,
        values(end).into_iter().max()?,
    ))
}

fn flatten(value: &Value) -> std::slice::Iter<'_, Value> {
    match value {
        Value::Array(values) => values.iter(),
        other => std::slice::from_ref(other).iter(),
    }
}

fn digits(value: i64) -> u32 {
    value.unsigned_abs().checked_ilog10().map_or(1, |d| d + 1)
}
