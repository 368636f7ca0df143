//! Event bus producers.
//!
//! Every call-scoped event is keyed by its call id, which pins all events
//! of one call to one partition and therefore to one total order. The bus
//! is a projection of the call store, never the source of truth: publish
//! failures are retried a bounded number of times, then dropped with a
//! counter.

mod kafka;
mod recording;

pub use kafka::{KafkaEventPublisher, KafkaPublisherConfig};
pub use recording::RecordingEventPublisher;
