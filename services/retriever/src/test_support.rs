//! In-memory object store for unit tests.

use crate::object_store::{ListPage, ObjectInfo, ObjectStore, StoreError};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) struct InMemoryStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    failing_keys: Mutex<HashSet<String>>,
    page_size: usize,
    list_calls: AtomicUsize,
    listed_prefixes: Mutex<Vec<String>>,
}

impl InMemoryStore {
    pub(crate) fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub(crate) fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failing_keys: Mutex::new(HashSet::new()),
            page_size,
            list_calls: AtomicUsize::new(0),
            listed_prefixes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn insert(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data);
    }

    pub(crate) fn insert_gzip(&self, bucket: &str, key: &str, data: &[u8]) {
        self.insert(bucket, key, gzip(data));
    }

    pub(crate) fn fail_get(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub(crate) fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn listed_prefixes(&self) -> Vec<String> {
        self.listed_prefixes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.listed_prefixes.lock().unwrap().push(prefix.to_string());

        let offset: usize = continuation.map(|t| t.parse().unwrap()).unwrap_or(0);
        let matching: Vec<ObjectInfo> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), v)| ObjectInfo {
                key: k.clone(),
                size: v.len() as u64,
                last_modified: None,
            })
            .collect();

        let end = (offset + self.page_size).min(matching.len());
        let next_continuation = if end < matching.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(ListPage {
            objects: matching[offset.min(end)..end].to_vec(),
            next_continuation,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        if self.failing_keys.lock().unwrap().contains(key) {
            return Err(StoreError::Get {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.object(bucket, key).ok_or_else(|| StoreError::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: "NoSuchKey".to_string(),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        self.insert(bucket, key, data);
        Ok(())
    }
}

pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
