//! Grouping synchronized frames into event periods.
//!
//! A period is a run of frames matching a predicate, allowing small gaps of
//! non-matching frames inside the run.

use crate::synchronizer::{SignalMap, SignalValue, SynchronizedFrames};
use chrono::Duration;
use serde::Serialize;
use tracing::info;

/// Largest index gap between matching frames of one period
pub const DEFAULT_TOLERANCE: usize = 2;

const CAMERA_HEALTH_CVB: &str = "interior_camera_health_response_cvb";
const CAMERA_HEALTH_CVE: &str = "interior_camera_health_response_cve";

/// A run of matching frames
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Period {
    /// Indices into the time-ordered frame sequence
    pub frames: Vec<usize>,
    pub duration_secs: f64,
}

/// Aggregate over the periods of one recording
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PeriodSummary {
    pub event_count: usize,
    pub total_duration_secs: f64,
}

/// Split ascending indices into runs whose neighbours differ by at most `tolerance`.
pub fn group_into_runs(indices: &[usize], tolerance: usize) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    for &index in indices {
        match runs.last_mut() {
            Some(run) if run.last().is_some_and(|&last| index.abs_diff(last) <= tolerance) => {
                run.push(index)
            }
            _ => runs.push(vec![index]),
        }
    }
    runs
}

/// Find the periods of `synchronized` in which `predicate` holds.
///
/// A period lasts from its first frame until the frame following its last
/// one. At the end of the recording the last frame is assumed to last as long
/// as the one before it, and a recording of a single frame counts as one
/// second.
pub fn extract_periods<F>(
    synchronized: &SynchronizedFrames,
    predicate: F,
    tolerance: usize,
) -> Vec<Period>
where
    F: Fn(&SignalMap) -> bool,
{
    let timestamps: Vec<Duration> = synchronized.keys().copied().collect();
    let selected: Vec<usize> = synchronized
        .values()
        .enumerate()
        .filter(|(_, signals)| predicate(signals))
        .map(|(index, _)| index)
        .collect();

    let periods: Vec<Period> = group_into_runs(&selected, tolerance)
        .into_iter()
        .filter_map(|run| {
            let first = timestamps[*run.first()?];
            let last_index = *run.last()?;
            let last = timestamps[last_index];

            let end = if let Some(next) = timestamps.get(last_index + 1) {
                *next
            } else if last_index != 0 {
                last + (last - timestamps[last_index - 1])
            } else {
                last + Duration::seconds(1)
            };

            Some(Period {
                frames: run,
                duration_secs: seconds(end - first),
            })
        })
        .collect();

    info!(periods = periods.len(), frames = timestamps.len(), "Periods extracted");
    periods
}

/// Camera health check activation: both health responses are reported and
/// either of them reaches 1.0.
pub fn camera_degraded(signals: &SignalMap) -> bool {
    match (signals.get(CAMERA_HEALTH_CVB), signals.get(CAMERA_HEALTH_CVE)) {
        (Some(cvb), Some(cve)) => is_active(cvb) || is_active(cve),
        _ => false,
    }
}

fn is_active(value: &SignalValue) -> bool {
    match value {
        SignalValue::Bool(flag) => *flag,
        other => other.as_f64().is_some_and(|v| v >= 1.0),
    }
}

pub fn summarize(periods: &[Period]) -> PeriodSummary {
    PeriodSummary {
        event_count: periods.len(),
        total_duration_secs: periods.iter().map(|p| p.duration_secs).sum(),
    }
}

fn seconds(duration: Duration) -> f64 {
    match duration.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => duration.num_milliseconds() as f64 / 1_000.0,
    }
}
