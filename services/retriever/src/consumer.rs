//! Artifact descriptor consumption.
//!
//! Descriptors arrive at least once. A descriptor is acknowledged once its
//! artifact has been published or has failed permanently, and handed back
//! to the queue when its chunks are not all uploaded yet. A handed back
//! descriptor carries the earliest time it may be attempted again.

use crate::config::KafkaConfig;
use crate::object_store::ObjectStore;
use crate::orchestrator::{ArtifactDescriptor, Outcome, RetrievalOrchestrator};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Header holding the epoch milliseconds before which a retried descriptor is not attempted
pub const NOT_BEFORE_HEADER: &str = "retriever-not-before";

/// Errors raised at the queue boundary
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Failed to re-publish descriptor at offset {offset}: {source}")]
    Republish {
        offset: i64,
        #[source]
        source: KafkaError,
    },
}

/// One received descriptor message
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Set on retried descriptors
    pub not_before: Option<DateTime<Utc>>,
}

fn parse_not_before(value: &[u8]) -> Option<DateTime<Utc>> {
    let millis = std::str::from_utf8(value).ok()?.trim().parse::<i64>().ok()?;
    DateTime::from_timestamp_millis(millis)
}

/// At-least-once source of artifact descriptors
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DescriptorQueue: Send + Sync {
    /// Wait for the next descriptor
    async fn next(&self) -> Result<Delivery, ConsumerError>;

    /// Mark a descriptor as handled for good
    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError>;

    /// Hand a descriptor back for a later attempt
    async fn retry(&self, delivery: &Delivery) -> Result<(), ConsumerError>;
}

/// Kafka-backed descriptor queue.
///
/// Retries re-publish the descriptor to the end of its topic, stamped with
/// [`NOT_BEFORE_HEADER`], before the original offset is committed. A crash
/// in between redelivers it twice rather than losing it.
pub struct KafkaDescriptorQueue {
    consumer: StreamConsumer,
    producer: FutureProducer,
    message_timeout: Duration,
    retry_delay: Duration,
}

impl KafkaDescriptorQueue {
    /// Create a new Kafka queue subscribed to the descriptor topic
    pub fn new(config: &KafkaConfig) -> anyhow::Result<Self> {
        let mut consumer_config = client_config(config);
        consumer_config
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        let consumer: StreamConsumer = consumer_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.descriptor_topic])
            .context("Failed to subscribe to descriptor topic")?;

        let producer: FutureProducer = client_config(config)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .context("Failed to create Kafka producer")?;

        info!(
            topic = %config.descriptor_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            producer,
            message_timeout: config.message_timeout(),
            retry_delay: config.retry_delay(),
        })
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &delivery.topic,
            delivery.partition,
            Offset::Offset(delivery.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}

/// Connection settings shared by the consumer and the producer
fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.bootstrap_servers);

    // Configure SSL if enabled
    if config.ssl_enabled {
        client_config.set("security.protocol", "SASL_SSL");
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    // Configure SASL if credentials provided
    if let (Some(ref username), Some(ref password)) =
        (&config.sasl_username, &config.sasl_password)
    {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

#[async_trait]
impl DescriptorQueue for KafkaDescriptorQueue {
    async fn next(&self) -> Result<Delivery, ConsumerError> {
        let message = self.consumer.recv().await?;
        let not_before = message.headers().and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == NOT_BEFORE_HEADER)
                .and_then(|header| header.value)
                .and_then(parse_not_before)
        });

        Ok(Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            not_before,
        })
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        self.commit(delivery)
    }

    async fn retry(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let delay_ms = i64::try_from(self.retry_delay.as_millis()).unwrap_or(i64::MAX);
        let not_before = Utc::now().timestamp_millis().saturating_add(delay_ms).to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: NOT_BEFORE_HEADER,
            value: Some(not_before.as_str()),
        });

        let mut record = FutureRecord::<[u8], [u8]>::to(&delivery.topic)
            .payload(delivery.payload.as_slice())
            .headers(headers);
        if let Some(key) = &delivery.key {
            record = record.key(key.as_slice());
        }

        self.producer
            .send(record, self.message_timeout)
            .await
            .map_err(|(source, _)| ConsumerError::Republish {
                offset: delivery.offset,
                source,
            })?;

        self.commit(delivery)
    }
}

/// Feeds descriptors through the orchestrator and publishes the results
pub struct ArtifactConsumer {
    queue: Arc<dyn DescriptorQueue>,
    orchestrator: RetrievalOrchestrator,
    destination: Arc<dyn ObjectStore>,
    destination_bucket: String,
}

impl ArtifactConsumer {
    pub fn new(
        queue: Arc<dyn DescriptorQueue>,
        orchestrator: RetrievalOrchestrator,
        destination: Arc<dyn ObjectStore>,
        destination_bucket: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            destination,
            destination_bucket: destination_bucket.into(),
        }
    }

    /// Process descriptors until `cancel` fires.
    ///
    /// Cancellation is only observed while waiting for the next descriptor or
    /// for a retried descriptor to become due; an artifact in progress always
    /// runs to its outcome.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting artifact consumer");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.next() => next,
            };

            match delivery {
                Ok(delivery) => {
                    if !self.wait_until_due(&delivery, &cancel).await {
                        info!(
                            partition = delivery.partition,
                            offset = delivery.offset,
                            "Shutdown while descriptor was pending, leaving it uncommitted"
                        );
                        break;
                    }
                    if let Err(e) = self.handle(&delivery).await {
                        error!(
                            error = %e,
                            partition = delivery.partition,
                            offset = delivery.offset,
                            "Failed to settle descriptor"
                        );
                        metrics::counter!("retriever.queue.errors").increment(1);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Descriptor queue error");
                    metrics::counter!("retriever.queue.errors").increment(1);
                }
            }
        }

        info!("Artifact consumer stopped");
    }

    /// Sleep until a retried descriptor is due. False when cancelled first.
    async fn wait_until_due(&self, delivery: &Delivery, cancel: &CancellationToken) -> bool {
        let Some(not_before) = delivery.not_before else {
            return true;
        };
        let Ok(wait) = (not_before - Utc::now()).to_std() else {
            return true;
        };

        debug!(
            offset = delivery.offset,
            wait_ms = wait.as_millis() as u64,
            "Descriptor not due yet"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// Process one descriptor and settle it with the queue
    #[instrument(skip(self, delivery), fields(partition = delivery.partition, offset = delivery.offset))]
    async fn handle(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let descriptor: ArtifactDescriptor = match serde_json::from_slice(&delivery.payload) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(error = %e, "Undecodable artifact descriptor, dropping");
                metrics::counter!("retriever.artifacts.fatal").increment(1);
                return self.queue.ack(delivery).await;
            }
        };

        debug!(
            artifact_id = %descriptor.artifact_id,
            kind = ?descriptor.kind,
            device_id = %descriptor.device_id,
            "Received artifact descriptor"
        );

        match self.orchestrator.process(&descriptor).await {
            Outcome::Done(artifact) => {
                let uploads = match artifact.into_uploads() {
                    Ok(uploads) => uploads,
                    Err(e) => {
                        error!(artifact_id = %descriptor.artifact_id, error = %e, "Failed to encode artifact");
                        return self.queue.ack(delivery).await;
                    }
                };

                for upload in uploads {
                    let size = upload.payload.len();
                    if let Err(e) = self
                        .destination
                        .put(&self.destination_bucket, &upload.key, upload.payload, upload.content_type)
                        .await
                    {
                        warn!(
                            artifact_id = %descriptor.artifact_id,
                            key = %upload.key,
                            error = %e,
                            "Publish failed, retrying later"
                        );
                        return self.queue.retry(delivery).await;
                    }
                    info!(
                        artifact_id = %descriptor.artifact_id,
                        key = %upload.key,
                        size_bytes = size,
                        "Artifact published"
                    );
                }
                self.queue.ack(delivery).await
            }
            Outcome::RetryLater { .. } => self.queue.retry(delivery).await,
            Outcome::Fatal { .. } => self.queue.ack(delivery).await,
        }
    }
}
