//! Chunk Retriever Service
//!
//! Reassembles recordings that fleet devices upload as many small chunks into
//! an hour-partitioned bucket. For each artifact descriptor consumed from
//! Kafka the service locates every chunk of the artifact, waits until the set
//! is complete, downloads and merges the chunks, and publishes the result.
//! Metadata artifacts are additionally normalized, given absolute time bounds
//! and synchronized to the recording timeline.
//!
//! ## Features
//!
//! - **Partitioned Search**: Walks `year=/month=/day=/hour=` partitions with
//!   transparent pagination and stops as soon as every chunk is found
//! - **Completeness Check**: Partial uploads are retried, never published
//! - **Deterministic Merge**: IMU chunks are concatenated by their embedded
//!   sequence number; metadata chunks are deep-merged
//! - **Timestamp Reconstruction**: Missing epoch bounds are extrapolated from
//!   the compact timestamp table
//! - **Signal Synchronization**: Frame attributes are placed on the recording
//!   timeline, grouped into camera health periods and published as a
//!   signals document next to the metadata artifact
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic              Device Bucket                Artifact Bucket
//! ┌──────────────┐        ┌──────────────────┐         ┌──────────────┐
//! │ Artifact     │        │ tenant/device/   │         │ {tenant}/    │
//! │ Descriptors  │        │   year=/month=/  │         │  {id}_imu.csv│
//! └──────────────┘        │   day=/hour=/    │         │  {id}_meta.. │
//!        │                └──────────────────┘         └──────────────┘
//!        ▼                         │                          ▲
//! ┌──────────────┐                 ▼                          │
//! │ Artifact     │         ┌──────────────┐                   │
//! │ Consumer     │────────▶│ Orchestrator │───────────────────┘
//! └──────────────┘         └──────────────┘
//!                                  │
//!          ┌──────────┬────────────┼─────────────┬──────────────┐
//!          ▼          ▼            ▼             ▼              ▼
//!      Locator    Retriever     Merger    Timestamps/MDF   Synchronizer
//!                                                           + Periods
//! ```

pub mod config;
pub mod consumer;
pub mod locator;
pub mod mdf;
pub mod merger;
pub mod object_store;
pub mod orchestrator;
pub mod periods;
pub mod retriever;
pub mod synchronizer;
pub mod timestamps;

mod json;
#[cfg(test)]
mod test_support;

pub use config::Config;
pub use consumer::{ArtifactConsumer, ConsumerError, DescriptorQueue, KafkaDescriptorQueue};
pub use locator::{ChunkLocator, ChunkSearchParameters, ChunkSelection, DiscoveredChunk};
pub use merger::{merge_bytes, merge_structured, MergedArtifact, OrderKeyExtractor};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use orchestrator::{
    ArtifactDescriptor, ArtifactKind, Outcome, RetrievalOrchestrator, SignalsView, Stage, Upload,
};
pub use periods::{extract_periods, summarize, Period, PeriodSummary};
pub use retriever::{ChunkRetriever, RetrievedChunk};
pub use synchronizer::{synchronize, RecordingWindow, SignalValue};
pub use timestamps::{reconstruct, EpochBounds, TimestampSample};
