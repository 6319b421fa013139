//! Per-artifact processing: locate, verify, retrieve, merge, enrich.
//!
//! [`RetrievalOrchestrator::process`] never fails. Every attempt ends in an
//! [`Outcome`] that tells the caller whether to publish the artifact, leave
//! the descriptor for redelivery, or drop it.

use crate::config::RetrievalConfig;
use crate::locator::{
    ChunkIdMatcher, ChunkLocator, ChunkMatcher, ChunkSearchParameters, ChunkSelection,
    DiscoveredChunk, PrefixMatcher, SearchError,
};
use crate::mdf::{timestamp_table_key, MetadataDocument};
use crate::merger::{merge_bytes, merge_structured, MergeError, MergedArtifact, OrderKeyExtractor};
use crate::object_store::ObjectStore;
use crate::periods::{camera_degraded, extract_periods, summarize, Period, PeriodSummary};
use crate::retriever::{ChunkRetriever, RetrieveError};
use crate::synchronizer::{
    synchronize_document, RecordingWindow, SignalMap, SyncError, SynchronizedFrames,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// File name suffix of the synchronized signals published next to a metadata artifact
pub const SIGNALS_EXTENSION: &str = "_signals.json";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Kind of artifact a descriptor asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Inertial measurements, byte-concatenated CSV
    Imu,
    /// Per-frame metadata, merged JSON
    Metadata,
}

impl ArtifactKind {
    /// File name suffix of the published artifact
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Imu => "_imu.csv",
            ArtifactKind::Metadata => "_metadata_full.json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactKind::Imu => "text/csv",
            ArtifactKind::Metadata => JSON_CONTENT_TYPE,
        }
    }
}

/// Time range in which the chunks were uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchWindow {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

/// Request to assemble one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub artifact_id: String,
    pub kind: ArtifactKind,
    pub tenant: String,
    pub device_id: String,
    /// Recorder that produced the chunks, carried into logs and the signals document
    #[serde(default)]
    pub recorder: Option<String>,
    pub chunks: ChunkSelection,
    pub search_window: SearchWindow,
    /// Window to synchronize metadata signals against
    #[serde(default)]
    pub recording_window: Option<RecordingWindow>,
    /// Overrides the configured suffixes for this kind
    #[serde(default)]
    pub suffixes: Option<Vec<String>>,
    /// Overrides the derived compact timestamp table key
    #[serde(default)]
    pub timestamp_table_key: Option<String>,
}

impl ArtifactDescriptor {
    /// Destination key: `{tenant}/{artifact_id}{extension}`
    pub fn output_key(&self) -> String {
        format!("{}/{}{}", self.tenant, self.artifact_id, self.kind.extension())
    }

    /// Signals key: `{tenant}/{artifact_id}_signals.json`
    pub fn signals_key(&self) -> String {
        format!("{}/{}{}", self.tenant, self.artifact_id, SIGNALS_EXTENSION)
    }
}

/// Processing stage, reported with fatal outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Searching,
    Retrieving,
    Merging,
    ReconstructingTimestamps,
    Synchronizing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Searching => "searching",
            Stage::Retrieving => "retrieving",
            Stage::Merging => "merging",
            Stage::ReconstructingTimestamps => "reconstructing_timestamps",
            Stage::Synchronizing => "synchronizing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause of a fatal outcome
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Why an artifact could not be assembled yet
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    /// Not every requested chunk has been uploaded
    Incomplete { found: usize, requested: usize },
    /// The remote store failed; the next attempt may succeed
    Unavailable(String),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Incomplete { found, requested } => {
                write!(f, "found {found} of {requested} chunks")
            }
            RetryReason::Unavailable(message) => write!(f, "store unavailable: {message}"),
        }
    }
}

/// Signals of a metadata artifact on the recording timeline.
///
/// Serialized as the signals document: the recording window, one timeline
/// entry per synchronized frame, the camera health periods and their summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalsView {
    pub artifact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorder: Option<String>,
    pub recording_window: RecordingWindow,
    #[serde(rename = "timeline", serialize_with = "serialize_timeline")]
    pub frames: SynchronizedFrames,
    pub periods: Vec<Period>,
    pub summary: PeriodSummary,
}

#[derive(Serialize)]
struct TimelineEntry<'a> {
    offset_ms: i64,
    signals: &'a SignalMap,
}

fn serialize_timeline<S>(frames: &SynchronizedFrames, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(frames.iter().map(|(offset, signals)| TimelineEntry {
        offset_ms: offset.num_milliseconds(),
        signals,
    }))
}

/// One object to publish
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub key: String,
    pub content_type: &'static str,
    pub payload: Vec<u8>,
}

/// A fully assembled artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedArtifact {
    pub artifact_id: String,
    pub kind: ArtifactKind,
    pub output_key: String,
    pub artifact: MergedArtifact,
    /// Present for metadata artifacts with a recording window and epoch bounds
    pub signals: Option<SignalsView>,
    pub signals_key: String,
}

impl ProcessedArtifact {
    /// Objects to publish: the artifact itself, then its signals document.
    pub fn into_uploads(self) -> Result<Vec<Upload>, serde_json::Error> {
        let payload = match self.artifact {
            MergedArtifact::RawBytes(bytes) => bytes,
            MergedArtifact::StructuredDocument(document) => serde_json::to_vec_pretty(&document)?,
        };

        let mut uploads = vec![Upload {
            key: self.output_key,
            content_type: self.kind.content_type(),
            payload,
        }];
        if let Some(signals) = &self.signals {
            uploads.push(Upload {
                key: self.signals_key,
                content_type: JSON_CONTENT_TYPE,
                payload: serde_json::to_vec_pretty(signals)?,
            });
        }
        Ok(uploads)
    }
}

/// Result of one processing attempt
#[derive(Debug)]
pub enum Outcome {
    Done(ProcessedArtifact),
    RetryLater {
        artifact_id: String,
        reason: RetryReason,
    },
    Fatal {
        artifact_id: String,
        stage: Stage,
        error: ProcessError,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done(_) => "done",
            Outcome::RetryLater { .. } => "retry_later",
            Outcome::Fatal { .. } => "fatal",
        }
    }
}

/// How an attempt stopped short of `Done`
enum Interrupt {
    Retry(RetryReason),
    Failed(Stage, ProcessError),
}

impl Interrupt {
    fn failed(stage: Stage) -> impl FnOnce(ProcessError) -> Interrupt {
        move |error| Interrupt::Failed(stage, error)
    }
}

/// Drives one artifact from descriptor to outcome
pub struct RetrievalOrchestrator {
    locator: ChunkLocator,
    retriever: ChunkRetriever,
    id_matcher: ChunkIdMatcher,
    order_keys: OrderKeyExtractor,
    tables: Arc<dyn ObjectStore>,
    table_bucket: String,
    settings: RetrievalConfig,
}

impl RetrievalOrchestrator {
    /// `source` holds the device chunks; `tables` holds previously published
    /// artifacts, including compact timestamp tables.
    pub fn new(
        source: Arc<dyn ObjectStore>,
        source_bucket: impl Into<String>,
        tables: Arc<dyn ObjectStore>,
        table_bucket: impl Into<String>,
        settings: RetrievalConfig,
    ) -> anyhow::Result<Self> {
        let id_matcher =
            ChunkIdMatcher::new(&settings.chunk_id_pattern).context("Invalid chunk id pattern")?;
        let order_keys = OrderKeyExtractor::new(&settings.imu_order_pattern)
            .context("Invalid IMU order key pattern")?;

        Ok(Self {
            locator: ChunkLocator::new(source.clone(), source_bucket),
            retriever: ChunkRetriever::new(source, settings.fetch_concurrency),
            id_matcher,
            order_keys,
            tables,
            table_bucket: table_bucket.into(),
            settings,
        })
    }

    /// Attempt to assemble the artifact described by `descriptor`.
    #[instrument(
        skip(self, descriptor),
        fields(
            artifact_id = %descriptor.artifact_id,
            kind = ?descriptor.kind,
            recorder = descriptor.recorder.as_deref().unwrap_or("unknown")
        )
    )]
    pub async fn process(&self, descriptor: &ArtifactDescriptor) -> Outcome {
        let started = Instant::now();
        let artifact_id = descriptor.artifact_id.clone();

        let outcome = match self.assemble(descriptor).await {
            Ok(artifact) => {
                info!(
                    artifact_id = %artifact_id,
                    output_key = %artifact.output_key,
                    "Artifact assembled"
                );
                Outcome::Done(artifact)
            }
            Err(Interrupt::Retry(reason)) => {
                info!(artifact_id = %artifact_id, reason = %reason, "Artifact not ready, retrying later");
                Outcome::RetryLater {
                    artifact_id,
                    reason,
                }
            }
            Err(Interrupt::Failed(stage, error)) => {
                error!(
                    artifact_id = %artifact_id,
                    stage = %stage,
                    error = %error,
                    "Artifact processing failed"
                );
                Outcome::Fatal {
                    artifact_id,
                    stage,
                    error,
                }
            }
        };

        metrics::counter!(format!("retriever.artifacts.{}", outcome.label())).increment(1);
        metrics::histogram!("retriever.artifact.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        outcome
    }

    async fn assemble(&self, descriptor: &ArtifactDescriptor) -> Result<ProcessedArtifact, Interrupt> {
        let chunks = self.search(descriptor).await?;

        let mut retrieval = self
            .retriever
            .retrieve(&chunks)
            .await
            .map_err(|e| match e {
                RetrieveError::Fetch { .. } => Interrupt::Retry(RetryReason::Unavailable(e.to_string())),
                other => Interrupt::Failed(Stage::Retrieving, other.into()),
            })?;

        if !retrieval.corrupt.is_empty() {
            if descriptor.kind == ArtifactKind::Imu {
                let corrupt = retrieval.corrupt.swap_remove(0);
                return Err(Interrupt::Failed(Stage::Retrieving, corrupt.into()));
            }
            metrics::counter!("retriever.chunks.skipped").increment(retrieval.corrupt.len() as u64);
        }

        let (artifact, signals) = match descriptor.kind {
            ArtifactKind::Imu => {
                let bytes = merge_bytes(retrieval.chunks, &self.order_keys)
                    .map_err(|e| Interrupt::Failed(Stage::Merging, e.into()))?;
                metrics::counter!("retriever.bytes.merged").increment(bytes.len() as u64);
                (MergedArtifact::RawBytes(bytes), None)
            }
            ArtifactKind::Metadata => {
                let merged = merge_structured(&retrieval.chunks)
                    .map_err(|e| Interrupt::Failed(Stage::Merging, e.into()))?;
                let mut document = MetadataDocument::from_merged(merged);

                if document.needs_epoch_reconstruction() {
                    self.reconstruct_epoch_bounds(descriptor, &mut document).await;
                }

                let signals = match descriptor.recording_window {
                    Some(window) => self.synchronize(descriptor, &document, &window)?,
                    None => None,
                };
                (MergedArtifact::StructuredDocument(document.to_value()), signals)
            }
        };

        Ok(ProcessedArtifact {
            artifact_id: descriptor.artifact_id.clone(),
            kind: descriptor.kind,
            output_key: descriptor.output_key(),
            artifact,
            signals,
            signals_key: descriptor.signals_key(),
        })
    }

    /// Locate every requested chunk, in descriptor order.
    async fn search(&self, descriptor: &ArtifactDescriptor) -> Result<Vec<DiscoveredChunk>, Interrupt> {
        let failed = Interrupt::failed(Stage::Searching);

        if descriptor.chunks.is_empty() {
            return Err(failed(
                SearchError::InvalidParameters("descriptor requests no chunks".to_string()).into(),
            ));
        }

        let suffixes = descriptor.suffixes.clone().unwrap_or_else(|| match descriptor.kind {
            ArtifactKind::Imu => self.settings.imu_suffixes.clone(),
            ArtifactKind::Metadata => self.settings.metadata_suffixes.clone(),
        });
        let params = ChunkSearchParameters {
            tenant: descriptor.tenant.clone(),
            device_id: descriptor.device_id.clone(),
            start_search: descriptor.search_window.start,
            stop_search: descriptor.search_window.stop,
            selection: descriptor.chunks.clone(),
            suffixes,
        };

        let prefix_matcher;
        let matcher: &dyn ChunkMatcher = match &descriptor.chunks {
            ChunkSelection::Ids(_) => &self.id_matcher,
            ChunkSelection::Prefixes(prefixes) => {
                prefix_matcher = PrefixMatcher::new(prefixes.iter().cloned());
                &prefix_matcher
            }
        };

        let requested = params.selection.requested();
        let mut found = match self.locator.locate(&params, &requested, matcher).await {
            Ok(found) => found,
            Err(SearchError::Store(e)) => {
                return Err(Interrupt::Retry(RetryReason::Unavailable(e.to_string())))
            }
            Err(e) => return Err(failed(e.into())),
        };

        if found.len() < requested.len() {
            return Err(Interrupt::Retry(RetryReason::Incomplete {
                found: found.len(),
                requested: requested.len(),
            }));
        }

        Ok(params
            .selection
            .entries()
            .iter()
            .filter_map(|entry| found.remove(entry))
            .collect())
    }

    /// Fill missing epoch bounds from the compact timestamp table. Failures
    /// leave the bounds unset.
    async fn reconstruct_epoch_bounds(
        &self,
        descriptor: &ArtifactDescriptor,
        document: &mut MetadataDocument,
    ) {
        let key = descriptor
            .timestamp_table_key
            .clone()
            .unwrap_or_else(|| timestamp_table_key(&descriptor.output_key()));

        let result = match self.tables.get(&self.table_bucket, &key).await {
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
                .map_err(|e| e.to_string())
                .and_then(|table| {
                    document
                        .reconstruct_epoch_bounds(&table)
                        .map_err(|e| e.to_string())
                }),
            Err(e) => Err(e.to_string()),
        };

        if let Err(reason) = result {
            warn!(
                artifact_id = %descriptor.artifact_id,
                stage = %Stage::ReconstructingTimestamps,
                table_key = %key,
                error = %reason,
                "Epoch bounds not reconstructed, continuing without them"
            );
        }
    }

    fn synchronize(
        &self,
        descriptor: &ArtifactDescriptor,
        document: &MetadataDocument,
        window: &RecordingWindow,
    ) -> Result<Option<SignalsView>, Interrupt> {
        if document.bounds().is_none() {
            warn!(
                artifact_id = %descriptor.artifact_id,
                "Chunk bounds unavailable, skipping signal synchronization"
            );
            return Ok(None);
        }

        let frames = synchronize_document(document, window)
            .map_err(|e| Interrupt::Failed(Stage::Synchronizing, e.into()))?;
        let periods = extract_periods(&frames, camera_degraded, self.settings.period_tolerance);
        let summary = summarize(&periods);

        info!(
            artifact_id = %descriptor.artifact_id,
            frames = frames.len(),
            events = summary.event_count,
            duration_secs = summary.total_duration_secs,
            "Signals synchronized"
        );

        Ok(Some(SignalsView {
            artifact_id: descriptor.artifact_id.clone(),
            recorder: descriptor.recorder.clone(),
            recording_window: *window,
            frames,
            periods,
            summary,
        }))
    }
}
