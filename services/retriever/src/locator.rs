//! Chunk discovery in the hour-partitioned device bucket.
//!
//! Devices upload chunks under
//! `{tenant}/{device}/year=YYYY/month=MM/day=DD/hour=HH/{file}`. A search
//! walks every hour partition touched by the search window, lists it page by
//! page and maps each file name to a canonical chunk id through a
//! [`ChunkMatcher`]. The locator only reports what it found; deciding whether
//! the set is complete belongs to the caller.

use crate::object_store::{ObjectStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Chunk id convention: `<recorder>_<recorder>-<recording uuid>_<chunk number>.<anything>`
pub const DEFAULT_CHUNK_ID_PATTERN: &str = r"^([^\W_]+_[^\W_]+-[a-z0-9\-]+_\d+)\..*$";

const SECONDS_PER_HOUR: i64 = 3600;

/// Errors raised while searching for chunks
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid search parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How the chunks of an artifact are identified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSelection {
    /// Canonical chunk ids, in recording order
    Ids(Vec<String>),
    /// File name prefixes, one per expected chunk
    Prefixes(Vec<String>),
}

impl ChunkSelection {
    /// The set of canonical ids that must all be discovered
    pub fn requested(&self) -> BTreeSet<String> {
        match self {
            ChunkSelection::Ids(ids) => ids.iter().cloned().collect(),
            ChunkSelection::Prefixes(prefixes) => prefixes.iter().cloned().collect(),
        }
    }

    /// Ids or prefixes in descriptor order
    pub fn entries(&self) -> &[String] {
        match self {
            ChunkSelection::Ids(entries) | ChunkSelection::Prefixes(entries) => entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Parameters of one chunk search
#[derive(Debug, Clone)]
pub struct ChunkSearchParameters {
    pub tenant: String,
    pub device_id: String,
    /// Inclusive start of the search window
    pub start_search: DateTime<Utc>,
    /// End of the search window
    pub stop_search: DateTime<Utc>,
    pub selection: ChunkSelection,
    /// Accepted file name suffixes
    pub suffixes: Vec<String>,
}

impl ChunkSearchParameters {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.stop_search < self.start_search {
            return Err(SearchError::InvalidParameters(format!(
                "stop_search {} is before start_search {}",
                self.stop_search, self.start_search
            )));
        }
        if self.suffixes.is_empty() {
            return Err(SearchError::InvalidParameters(
                "suffix set is empty".to_string(),
            ));
        }
        if self.tenant.is_empty() || self.device_id.is_empty() {
            return Err(SearchError::InvalidParameters(
                "tenant and device_id are required".to_string(),
            ));
        }
        Ok(())
    }

    /// Hour partitions covering the search window, oldest first.
    ///
    /// The partition holding `stop_search` is included, so a zero-width
    /// window still searches one partition.
    pub fn partitions(&self) -> Vec<String> {
        let mut hour = floor_to_hour(self.start_search);
        let last = floor_to_hour(self.stop_search);

        let mut partitions = Vec::new();
        while hour <= last {
            partitions.push(format!(
                "{}/{}/{}",
                self.tenant,
                self.device_id,
                hour.format("year=%Y/month=%m/day=%d/hour=%H/")
            ));
            hour += Duration::hours(1);
        }
        partitions
    }

    fn suffix_matches(&self, file_name: &str) -> bool {
        self.suffixes.iter().any(|suffix| file_name.ends_with(suffix))
    }
}

fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(SECONDS_PER_HOUR) * SECONDS_PER_HOUR;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

/// Maps a file name to the canonical id of the chunk it belongs to
pub trait ChunkMatcher: Send + Sync {
    fn canonical_id(&self, file_name: &str) -> Option<String>;

    /// Whether canonical ids are always prefixes of the matching file names.
    /// When they are, listings are narrowed to the ids' common prefix.
    fn ids_are_filename_prefixes(&self) -> bool {
        false
    }
}

/// Extracts the chunk id with the first capture group of a pattern
#[derive(Debug, Clone)]
pub struct ChunkIdMatcher {
    pattern: Regex,
    anchored_id: bool,
}

impl ChunkIdMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            anchored_id: leading_capture(pattern),
        })
    }
}

/// True when the pattern opens with `^` immediately followed by capture
/// group 1, so every id it extracts starts the file name.
fn leading_capture(pattern: &str) -> bool {
    let Some(group) = pattern.strip_prefix("^(") else {
        return false;
    };
    !group.starts_with('?') || group.starts_with("?P<") || group.starts_with("?<")
}

impl ChunkMatcher for ChunkIdMatcher {
    fn canonical_id(&self, file_name: &str) -> Option<String> {
        self.pattern
            .captures(file_name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn ids_are_filename_prefixes(&self) -> bool {
        self.anchored_id
    }
}

/// Matches file names against a fixed set of prefixes
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    /// Longest first, so the most specific prefix wins
    prefixes: Vec<String>,
}

impl PrefixMatcher {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut prefixes: Vec<String> = prefixes.into_iter().map(Into::into).collect();
        prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        prefixes.dedup();
        Self { prefixes }
    }
}

impl ChunkMatcher for PrefixMatcher {
    fn canonical_id(&self, file_name: &str) -> Option<String> {
        self.prefixes
            .iter()
            .find(|prefix| file_name.starts_with(prefix.as_str()))
            .cloned()
    }

    fn ids_are_filename_prefixes(&self) -> bool {
        true
    }
}

/// A chunk found in the remote store
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredChunk {
    pub canonical_key: String,
    pub storage_key: String,
    pub bucket: String,
    pub size: u64,
}

/// Locates chunks of one artifact in the device bucket
pub struct ChunkLocator {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ChunkLocator {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Search the partitions of the window for the `requested` chunk ids.
    ///
    /// The first object matching an id wins. The search stops as soon as
    /// every id has a match; otherwise the returned map is partial.
    #[instrument(
        skip(self, params, requested, matcher),
        fields(tenant = %params.tenant, device_id = %params.device_id, requested = requested.len())
    )]
    pub async fn locate(
        &self,
        params: &ChunkSearchParameters,
        requested: &BTreeSet<String>,
        matcher: &dyn ChunkMatcher,
    ) -> Result<BTreeMap<String, DiscoveredChunk>, SearchError> {
        let mut found: BTreeMap<String, DiscoveredChunk> = BTreeMap::new();
        if requested.is_empty() {
            return Ok(found);
        }
        params.validate()?;

        let name_prefix = if matcher.ids_are_filename_prefixes() {
            common_prefix(requested)
        } else {
            String::new()
        };

        let mut scanned = 0usize;
        'partitions: for partition in params.partitions() {
            let listing_prefix = format!("{partition}{name_prefix}");
            let mut token: Option<String> = None;

            loop {
                let page = self
                    .store
                    .list_page(&self.bucket, &listing_prefix, token.take())
                    .await?;

                for object in &page.objects {
                    scanned += 1;
                    let file_name = object.file_name();
                    if !params.suffix_matches(file_name) {
                        continue;
                    }
                    let Some(id) = matcher.canonical_id(file_name) else {
                        continue;
                    };
                    if !requested.contains(&id) {
                        continue;
                    }
                    found.entry(id.clone()).or_insert_with(|| {
                        debug!(chunk_id = %id, key = %object.key, "Matched chunk");
                        DiscoveredChunk {
                            canonical_key: id,
                            storage_key: object.key.clone(),
                            bucket: self.bucket.clone(),
                            size: object.size,
                        }
                    });
                }

                if found.len() == requested.len() {
                    break 'partitions;
                }

                match page.next_continuation {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }

        info!(
            scanned = scanned,
            found = found.len(),
            requested = requested.len(),
            "Chunk search finished"
        );

        Ok(found)
    }
}

fn common_prefix(values: &BTreeSet<String>) -> String {
    // Sorted set: the common prefix of all is the common prefix of first and last.
    match (values.first(), values.last()) {
        (Some(first), Some(last)) => first
            .chars()
            .zip(last.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MockObjectStore;
    use crate::test_support::InMemoryStore;
    use chrono::TimeZone;

    const BUCKET: &str = "device-data";
    const RECORDING: &str = "TrainingRecorder_TrainingRecorder-beec7df1-b564-4bb3-9ec7-b83c182491b8";

    fn params(start: DateTime<Utc>, stop: DateTime<Utc>) -> ChunkSearchParameters {
        ChunkSearchParameters {
            tenant: "tenant".to_string(),
            device_id: "device".to_string(),
            start_search: start,
            stop_search: stop,
            selection: ChunkSelection::Ids(vec![]),
            suffixes: vec!["imu_raw.csv.zip".to_string()],
        }
    }

    fn chunk_file(n: u32) -> String {
        format!("{RECORDING}_{n}.mp4._stream1_20230710122027_{n}_imu_raw.csv.zip")
    }

    fn requested(ids: &[u32]) -> BTreeSet<String> {
        ids.iter().map(|n| format!("{RECORDING}_{n}")).collect()
    }

    fn matcher() -> ChunkIdMatcher {
        ChunkIdMatcher::new(DEFAULT_CHUNK_ID_PATTERN).unwrap()
    }

    #[test]
    fn test_partitions_cover_window() {
        let p = params(
            Utc.with_ymd_and_hms(2023, 7, 10, 22, 45, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 7, 11, 1, 5, 0).unwrap(),
        );
        assert_eq!(
            p.partitions(),
            vec![
                "tenant/device/year=2023/month=07/day=10/hour=22/",
                "tenant/device/year=2023/month=07/day=10/hour=23/",
                "tenant/device/year=2023/month=07/day=11/hour=00/",
                "tenant/device/year=2023/month=07/day=11/hour=01/",
            ]
        );
    }

    #[test]
    fn test_zero_width_window_has_one_partition() {
        let t = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(
            params(t, t).partitions(),
            vec!["tenant/device/year=2023/month=12/day=31/hour=23/"]
        );
    }

    #[test]
    fn test_validate() {
        let t = Utc.with_ymd_and_hms(2023, 7, 10, 12, 0, 0).unwrap();
        assert!(params(t, t).validate().is_ok());
        assert!(params(t, t - Duration::seconds(1)).validate().is_err());

        let mut no_suffix = params(t, t);
        no_suffix.suffixes.clear();
        assert!(matches!(
            no_suffix.validate(),
            Err(SearchError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_chunk_id_matcher() {
        let m = matcher();
        assert_eq!(
            m.canonical_id(&chunk_file(2)),
            Some(format!("{RECORDING}_2"))
        );
        assert_eq!(m.canonical_id("not-a-chunk"), None);
        assert!(m.ids_are_filename_prefixes());
    }

    #[test]
    fn test_only_leading_capture_groups_narrow_listings() {
        assert!(leading_capture(DEFAULT_CHUNK_ID_PATTERN));
        assert!(leading_capture(r"^(?P<id>rec_\d+)\."));
        assert!(!leading_capture(r"^(?:dev_)(rec_\d+)\."));
        assert!(!leading_capture(r"^(?i)(rec_\d+)\."));
        assert!(!leading_capture(r"dev_(rec_\d+)\."));
    }

    #[tokio::test]
    async fn test_locate_with_id_behind_fixed_prefix() {
        let store = Arc::new(InMemoryStore::new());
        let partition = "tenant/device/year=2023/month=07/day=10/hour=12/";
        store.insert(BUCKET, &format!("{partition}dev_rec_1.imu_raw.csv.zip"), vec![1]);

        let matcher = ChunkIdMatcher::new(r"^(?:dev_)(rec_\d+)\..*$").unwrap();
        assert!(!matcher.ids_are_filename_prefixes());

        let locator = ChunkLocator::new(store.clone(), BUCKET);
        let t = Utc.with_ymd_and_hms(2023, 7, 10, 12, 0, 0).unwrap();
        let ids: BTreeSet<String> = ["rec_1".to_string()].into_iter().collect();
        let found = locator.locate(&params(t, t), &ids, &matcher).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(store.listed_prefixes(), vec![partition.to_string()]);
    }

    #[test]
    fn test_prefix_matcher_prefers_longest() {
        let m = PrefixMatcher::new(["snap_1", "snap_12"]);
        assert_eq!(m.canonical_id("snap_123.jpeg"), Some("snap_12".to_string()));
        assert_eq!(m.canonical_id("snap_1.jpeg"), Some("snap_1".to_string()));
        assert_eq!(m.canonical_id("other.jpeg"), None);
    }

    #[test]
    fn test_common_prefix() {
        let ids: BTreeSet<String> = ["abc_1", "abc_12", "abd"].iter().map(|s| s.to_string()).collect();
        assert_eq!(common_prefix(&ids), "ab");
        assert_eq!(common_prefix(&BTreeSet::new()), "");
    }

    #[tokio::test]
    async fn test_empty_request_does_not_list() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_page().never();

        let locator = ChunkLocator::new(Arc::new(mock), BUCKET);
        let t = Utc.with_ymd_and_hms(2023, 7, 10, 12, 0, 0).unwrap();
        let found = locator
            .locate(&params(t, t), &BTreeSet::new(), &matcher())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_locate_across_partitions_and_pages() {
        let store = Arc::new(InMemoryStore::with_page_size(2));
        let hour12 = "tenant/device/year=2023/month=07/day=10/hour=12/";
        let hour13 = "tenant/device/year=2023/month=07/day=10/hour=13/";
        store.insert(BUCKET, &format!("{hour12}{}", chunk_file(0)), vec![0]);
        store.insert(BUCKET, &format!("{hour12}{RECORDING}_0.mp4"), vec![0]);
        store.insert(BUCKET, &format!("{hour12}{RECORDING}_1.mp4._x_metadata_full.json.zip"), vec![0]);
        store.insert(BUCKET, &format!("{hour13}{}", chunk_file(1)), vec![1, 1]);
        store.insert(BUCKET, &format!("{hour13}{}", chunk_file(2)), vec![2]);

        let locator = ChunkLocator::new(store.clone(), BUCKET);
        let p = params(
            Utc.with_ymd_and_hms(2023, 7, 10, 12, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 7, 10, 13, 30, 0).unwrap(),
        );

        let found = locator.locate(&p, &requested(&[0, 1, 2]), &matcher()).await.unwrap();
        assert_eq!(found.len(), 3);

        let chunk1 = &found[&format!("{RECORDING}_1")];
        assert_eq!(chunk1.storage_key, format!("{hour13}{}", chunk_file(1)));
        assert_eq!(chunk1.bucket, BUCKET);
        assert_eq!(chunk1.size, 2);

        // Listings are narrowed to the common id prefix.
        assert!(store
            .listed_prefixes()
            .iter()
            .all(|prefix| prefix.ends_with(&format!("{RECORDING}_"))));
    }

    #[tokio::test]
    async fn test_locate_returns_partial_map() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(
            BUCKET,
            &format!("tenant/device/year=2023/month=07/day=10/hour=12/{}", chunk_file(0)),
            vec![0],
        );

        let locator = ChunkLocator::new(store, BUCKET);
        let t = Utc.with_ymd_and_hms(2023, 7, 10, 12, 0, 0).unwrap();
        let found = locator.locate(&params(t, t), &requested(&[0, 1]), &matcher()).await.unwrap();

        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&format!("{RECORDING}_0")));
    }

    #[tokio::test]
    async fn test_locate_keeps_first_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        let hour12 = "tenant/device/year=2023/month=07/day=10/hour=12/";
        let hour13 = "tenant/device/year=2023/month=07/day=10/hour=13/";
        store.insert(BUCKET, &format!("{hour12}{}", chunk_file(0)), vec![0]);
        store.insert(BUCKET, &format!("{hour13}{}", chunk_file(0)), vec![0]);
        store.insert(BUCKET, &format!("{hour13}{}", chunk_file(1)), vec![1]);

        let locator = ChunkLocator::new(store, BUCKET);
        let p = params(
            Utc.with_ymd_and_hms(2023, 7, 10, 12, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 7, 10, 13, 0, 0).unwrap(),
        );
        let found = locator.locate(&p, &requested(&[0, 1]), &matcher()).await.unwrap();

        assert_eq!(
            found[&format!("{RECORDING}_0")].storage_key,
            format!("{hour12}{}", chunk_file(0))
        );
    }

    #[tokio::test]
    async fn test_locate_stops_once_complete() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(
            BUCKET,
            &format!("tenant/device/year=2023/month=07/day=10/hour=12/{}", chunk_file(0)),
            vec![0],
        );

        let locator = ChunkLocator::new(store.clone(), BUCKET);
        let p = params(
            Utc.with_ymd_and_hms(2023, 7, 10, 12, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 7, 10, 18, 0, 0).unwrap(),
        );
        let found = locator.locate(&p, &requested(&[0]), &matcher()).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(store.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_locate_rejects_invalid_window() {
        let locator = ChunkLocator::new(Arc::new(InMemoryStore::new()), BUCKET);
        let t = Utc.with_ymd_and_hms(2023, 7, 10, 12, 0, 0).unwrap();
        let result = locator
            .locate(&params(t, t - Duration::hours(1)), &requested(&[0]), &matcher())
            .await;
        assert!(matches!(result, Err(SearchError::InvalidParameters(_))));
    }
}
