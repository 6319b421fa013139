//! Chunk download and decompression.

use crate::locator::DiscoveredChunk;
use crate::object_store::{ObjectStore, StoreError};
use flate2::read::MultiGzDecoder;
use futures::stream::{self, StreamExt};
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Key suffixes of gzip-compressed chunks. Devices gzip chunks but name them `.zip`.
const COMPRESSED_SUFFIXES: [&str; 2] = [".zip", ".gz"];

/// Errors raised while retrieving chunks
#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("Failed to fetch chunk {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to decompress chunk {key}: {source}")]
    Decompress {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// A downloaded, decompressed chunk
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub canonical_key: String,
    pub storage_key: String,
    pub data: Vec<u8>,
}

/// Result of retrieving a chunk set
#[derive(Debug, Default)]
pub struct Retrieval {
    /// Usable chunks, in input order
    pub chunks: Vec<RetrievedChunk>,
    /// Chunks that were fetched but could not be decompressed
    pub corrupt: Vec<RetrieveError>,
}

/// Downloads chunks from the device bucket
pub struct ChunkRetriever {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl ChunkRetriever {
    /// `concurrency` bounds in-flight downloads; 1 fetches sequentially.
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch and decompress every chunk.
    ///
    /// A fetch failure aborts the retrieval. A chunk that cannot be
    /// decompressed is reported in [`Retrieval::corrupt`] and the rest are
    /// still returned.
    #[instrument(skip(self, chunks), fields(chunks = chunks.len(), concurrency = self.concurrency))]
    pub async fn retrieve(&self, chunks: &[DiscoveredChunk]) -> Result<Retrieval, RetrieveError> {
        let store = self.store.clone();

        let fetched: Vec<(DiscoveredChunk, Result<Vec<u8>, StoreError>)> =
            stream::iter(chunks.iter().cloned())
                .map(move |chunk| {
                    let store = store.clone();
                    async move {
                        let result = store.get(&chunk.bucket, &chunk.storage_key).await;
                        (chunk, result)
                    }
                })
                .buffered(self.concurrency)
                .collect()
                .await;

        let mut retrieval = Retrieval::default();
        for (chunk, result) in fetched {
            let raw = result.map_err(|source| RetrieveError::Fetch {
                key: chunk.storage_key.clone(),
                source,
            })?;
            metrics::counter!("retriever.chunks.fetched").increment(1);

            match decode(&chunk.storage_key, raw) {
                Ok(data) => {
                    debug!(
                        key = %chunk.storage_key,
                        size_bytes = data.len(),
                        "Chunk retrieved"
                    );
                    retrieval.chunks.push(RetrievedChunk {
                        canonical_key: chunk.canonical_key,
                        storage_key: chunk.storage_key,
                        data,
                    });
                }
                Err(e) => {
                    warn!(key = %chunk.storage_key, error = %e, "Chunk could not be decompressed");
                    retrieval.corrupt.push(e);
                }
            }
        }

        Ok(retrieval)
    }
}

/// Decompress `raw` when the key says it is compressed.
fn decode(key: &str, raw: Vec<u8>) -> Result<Vec<u8>, RetrieveError> {
    if !COMPRESSED_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)) {
        return Ok(raw);
    }

    let mut data = Vec::with_capacity(raw.len() * 4);
    MultiGzDecoder::new(raw.as_slice())
        .read_to_end(&mut data)
        .map_err(|source| RetrieveError::Decompress {
            key: key.to_string(),
            source,
        })?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{gzip, InMemoryStore};

    const BUCKET: &str = "device-data";

    fn discovered(id: &str, key: &str) -> DiscoveredChunk {
        DiscoveredChunk {
            canonical_key: id.to_string(),
            storage_key: key.to_string(),
            bucket: BUCKET.to_string(),
            size: 0,
        }
    }

    #[test]
    fn test_decode_plain_and_gzip() {
        assert_eq!(decode("a.csv", b"abc".to_vec()).unwrap(), b"abc");
        assert_eq!(decode("a.csv.zip", gzip(b"abc")).unwrap(), b"abc");
        assert_eq!(decode("a.json.gz", gzip(b"{}")).unwrap(), b"{}");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode("a.csv.zip", b"not gzip".to_vec());
        assert!(matches!(result, Err(RetrieveError::Decompress { .. })));
    }

    #[tokio::test]
    async fn test_retrieve_keeps_input_order() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_gzip(BUCKET, "p/c2.csv.zip", b"second");
        store.insert(BUCKET, "p/c1.csv", b"first".to_vec());

        for concurrency in [1, 4] {
            let retriever = ChunkRetriever::new(store.clone(), concurrency);
            let retrieval = retriever
                .retrieve(&[discovered("c2", "p/c2.csv.zip"), discovered("c1", "p/c1.csv")])
                .await
                .unwrap();

            let data: Vec<&[u8]> = retrieval.chunks.iter().map(|c| c.data.as_slice()).collect();
            assert_eq!(data, vec![&b"second"[..], &b"first"[..]]);
            assert_eq!(retrieval.chunks[0].canonical_key, "c2");
            assert!(retrieval.corrupt.is_empty());
        }
    }

    #[tokio::test]
    async fn test_retrieve_runs_on_spawned_task() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_gzip(BUCKET, "p/c1.csv.zip", b"first");
        let retriever = ChunkRetriever::new(store, 2);
        let chunks = vec![discovered("c1", "p/c1.csv.zip")];

        let retrieval = tokio::spawn(async move { retriever.retrieve(&chunks).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retrieval.chunks[0].data, b"first");
    }

    #[tokio::test]
    async fn test_retrieve_surfaces_fetch_failure() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(BUCKET, "p/c1.csv", b"first".to_vec());
        store.insert(BUCKET, "p/c2.csv", b"second".to_vec());
        store.fail_get("p/c2.csv");

        let retriever = ChunkRetriever::new(store, 1);
        let result = retriever
            .retrieve(&[discovered("c1", "p/c1.csv"), discovered("c2", "p/c2.csv")])
            .await;

        match result {
            Err(RetrieveError::Fetch { key, .. }) => assert_eq!(key, "p/c2.csv"),
            other => panic!("Expected fetch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retrieve_reports_corrupt_chunks() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_gzip(BUCKET, "p/c1.json.zip", b"{}");
        store.insert(BUCKET, "p/c2.json.zip", b"garbage".to_vec());

        let retriever = ChunkRetriever::new(store, 2);
        let retrieval = retriever
            .retrieve(&[
                discovered("c1", "p/c1.json.zip"),
                discovered("c2", "p/c2.json.zip"),
            ])
            .await
            .unwrap();

        assert_eq!(retrieval.chunks.len(), 1);
        assert_eq!(retrieval.corrupt.len(), 1);
    }
}
