//! Kafka producer with durable, idempotent delivery.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};

use voicebridge_core::{CallEvent, EventPublisher, PublishError};

const SOURCE: &str = "voicebridge";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct KafkaPublisherConfig {
    /// Comma-separated broker list.
    pub brokers: String,
    /// Topics are `<prefix>.<event-type>`.
    pub topic_prefix: String,
    /// Bounded retries before an event is dropped.
    pub retries: u32,
}

pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic_prefix: String,
    retries: u32,
}

impl KafkaEventPublisher {
    pub fn new(config: KafkaPublisherConfig) -> Result<Self, PublishError> {
        // acks=all plus idempotence: a retried send never duplicates, and
        // the broker acknowledges only after durable replication.
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "10000")
            .set("compression.type", "lz4")
            .create()
            .map_err(|e| PublishError::Broker(e.to_string()))?;

        Ok(Self {
            producer,
            topic_prefix: config.topic_prefix,
            retries: config.retries,
        })
    }

    fn topic_for(&self, event: &CallEvent) -> String {
        format!("{}.{}", self.topic_prefix, event.event_type())
    }

    fn headers_for(event: &CallEvent) -> OwnedHeaders {
        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_type",
                value: Some(event.event_type()),
            })
            .insert(Header {
                key: "source",
                value: Some(SOURCE),
            })
            .insert(Header {
                key: "version",
                value: Some(VERSION),
            });
        if !event.tenant_id.is_empty() {
            headers = headers.insert(Header {
                key: "tenant_id",
                value: Some(event.tenant_id.as_str()),
            });
        }
        if let Some(trace_id) = &event.trace_id {
            headers = headers.insert(Header {
                key: "trace_id",
                value: Some(trace_id.as_str()),
            });
        }
        headers
    }

    async fn try_publish(&self, event: &CallEvent, payload: &str) -> Result<(), PublishError> {
        let topic = self.topic_for(event);
        let record = FutureRecord::to(&topic)
            .key(&event.call_id)
            .payload(payload)
            .headers(Self::headers_for(event));

        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| match e {
                rdkafka::error::KafkaError::MessageProduction(
                    rdkafka::types::RDKafkaErrorCode::QueueFull,
                ) => PublishError::QueueFull,
                other => PublishError::Broker(other.to_string()),
            })?;
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, event: &CallEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let mut last_err = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            match self.try_publish(event, &payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        event_type = event.event_type(),
                        call_id = %event.call_id,
                        attempt,
                        error = %e,
                        "event publish attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        metrics::counter!("events_dropped_total").increment(1);
        Err(last_err.unwrap_or(PublishError::QueueFull))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voicebridge_core::{ErrorComponent, EventPayload};

    fn event() -> CallEvent {
        CallEvent::new(
            "c1",
            "t1",
            EventPayload::Error {
                error_type: ErrorComponent::Tc,
                message: "bridge create failed".into(),
                component: "session".into(),
            },
        )
    }

    #[test]
    fn test_topic_naming() {
        let publisher = KafkaEventPublisher::new(KafkaPublisherConfig {
            brokers: "127.0.0.1:9092".into(),
            topic_prefix: "voice".into(),
            retries: 2,
        })
        .unwrap();
        assert_eq!(publisher.topic_for(&event()), "voice.error.tc");
    }

    #[test]
    fn test_headers_include_tenant_and_trace() {
        use rdkafka::message::Headers;

        let headers = KafkaEventPublisher::headers_for(&event().with_trace("tr-1"));
        let keys: Vec<&str> = (0..headers.count())
            .map(|i| headers.get(i).key)
            .collect();
        assert_eq!(
            keys,
            vec!["event_type", "source", "version", "tenant_id", "trace_id"]
        );
    }
}
