//! Merging retrieved chunks into one artifact.
//!
//! Binary artifacts (IMU) are concatenated in the order of a sequence number
//! embedded in each chunk's file name. Structured artifacts (metadata) are
//! deep-merged; list values are concatenated so frame lists from every chunk
//! survive.

use crate::retriever::RetrievedChunk;
use regex::Regex;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Sequence number convention of IMU chunk file names
pub const DEFAULT_IMU_ORDER_PATTERN: &str = r"_(\d+)_imu_raw\.csv";

/// Errors raised while merging chunks
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("No order key found in chunk {key}")]
    UnparsableOrderKey { key: String },

    #[error("None of the {attempted} chunks could be parsed")]
    NoUsableChunks { attempted: usize },

    #[error("Invalid order key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// The merged form of an artifact
#[derive(Debug, Clone, PartialEq)]
pub enum MergedArtifact {
    RawBytes(Vec<u8>),
    StructuredDocument(Value),
}

/// Reads the numeric sequence embedded in a chunk's file name
#[derive(Debug, Clone)]
pub struct OrderKeyExtractor {
    pattern: Regex,
}

impl OrderKeyExtractor {
    /// `pattern` must capture the sequence number in its first group.
    pub fn new(pattern: &str) -> Result<Self, MergeError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn order_key(&self, chunk: &RetrievedChunk) -> Result<u64, MergeError> {
        let file_name = chunk
            .storage_key
            .rsplit('/')
            .next()
            .unwrap_or(&chunk.storage_key);

        self.pattern
            .captures(file_name)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .ok_or_else(|| MergeError::UnparsableOrderKey {
                key: chunk.storage_key.clone(),
            })
    }
}

/// Concatenate chunks in ascending order-key order.
///
/// The output buffer is allocated once at its final size.
pub fn merge_bytes(
    chunks: Vec<RetrievedChunk>,
    extractor: &OrderKeyExtractor,
) -> Result<Vec<u8>, MergeError> {
    let mut keyed = chunks
        .into_iter()
        .map(|chunk| Ok((extractor.order_key(&chunk)?, chunk)))
        .collect::<Result<Vec<(u64, RetrievedChunk)>, MergeError>>()?;
    keyed.sort_by_key(|(order, _)| *order);

    let total: usize = keyed.iter().map(|(_, chunk)| chunk.data.len()).sum();
    let mut buffer = vec![0u8; total];

    let mut offset = 0;
    for (order, chunk) in keyed {
        let end = offset + chunk.data.len();
        buffer[offset..end].copy_from_slice(&chunk.data);
        debug!(order = order, key = %chunk.storage_key, offset = offset, "Chunk placed");
        offset = end;
    }

    Ok(buffer)
}

/// Parse every chunk as a JSON object, skipping the ones that fail.
///
/// Keys repeated inside one chunk are merged rather than overwritten.
fn parse_documents(chunks: &[RetrievedChunk]) -> Result<Vec<Value>, MergeError> {
    let mut documents = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        match serde_json::from_slice::<MergingValue>(&chunk.data) {
            Ok(MergingValue(document @ Value::Object(_))) => documents.push(document),
            Ok(_) => {
                warn!(key = %chunk.storage_key, "Skipping chunk: top level is not an object");
                metrics::counter!("retriever.chunks.skipped").increment(1);
            }
            Err(e) => {
                warn!(key = %chunk.storage_key, error = %e, "Skipping unparsable chunk");
                metrics::counter!("retriever.chunks.skipped").increment(1);
            }
        }
    }

    if documents.is_empty() {
        return Err(MergeError::NoUsableChunks {
            attempted: chunks.len(),
        });
    }
    Ok(documents)
}

/// Deep-merge documents in order.
fn merge_documents(documents: Vec<Value>) -> Value {
    let mut documents = documents.into_iter();
    let Some(mut merged) = documents.next() else {
        return Value::Object(Map::new());
    };
    for document in documents {
        merge_value(&mut merged, document);
    }
    merged
}

/// Parse and deep-merge structured chunks in input order.
pub fn merge_structured(chunks: &[RetrievedChunk]) -> Result<Value, MergeError> {
    Ok(merge_documents(parse_documents(chunks)?))
}

/// Merge `incoming` into `existing`.
///
/// Objects merge key by key and lists concatenate. A value joins a list on
/// either side of it. Equal scalars collapse; differing ones become a list.
pub fn merge_value(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) => target.extend(source),
        (Value::Array(target), value) => target.push(value),
        (slot, Value::Array(mut items)) => {
            items.insert(0, slot.take());
            *slot = Value::Array(items);
        }
        (slot, value) => {
            if *slot != value {
                let previous = slot.take();
                *slot = Value::Array(vec![previous, value]);
            }
        }
    }
}

/// JSON value whose objects merge repeated keys with [`merge_value`].
struct MergingValue(Value);

impl<'de> Deserialize<'de> for MergingValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(MergingVisitor)
    }
}

struct MergingVisitor;

impl<'de> Visitor<'de> for MergingVisitor {
    type Value = MergingValue;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("any JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::from(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::String(v.to_owned())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::String(v)))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::Null))
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(MergingValue(Value::Null))
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        MergingValue::deserialize(deserializer)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut values = Vec::new();
        while let Some(MergingValue(value)) = seq.next_element()? {
            values.push(value);
        }
        Ok(MergingValue(Value::Array(values)))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut object = Map::new();
        while let Some((key, MergingValue(value))) = map.next_entry::<String, MergingValue>()? {
            match object.get_mut(&key) {
                Some(existing) => merge_value(existing, value),
                None => {
                    object.insert(key, value);
                }
            }
        }
        Ok(MergingValue(Value::Object(object)))
    }
}
