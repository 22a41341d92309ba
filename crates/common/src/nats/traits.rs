use crate::nats::ConsumeRequest;
use anyhow::Result;
use async_nats::jetstream;
use async_trait::async_trait;
use std::time::Duration;

/// Trait for JetStream consumer operations
/// Abstracts the operations needed to create and use a NATS JetStream consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamConsumer: Send + Sync {
    /// Create (or bind to) a durable pull consumer on a stream
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>>;
}

/// Trait for pull consumer operations
/// Abstracts the fetch operation on a pull consumer
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch messages from the consumer
    /// Returns a batch of messages up to max_messages, waiting up to expires duration
    /// for them to arrive. An empty batch means nothing arrived in that time.
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn JetStreamMessage>>>;
}

/// A message delivered by JetStream that must be settled with the broker.
///
/// Each delivered instance is settled exactly once, through one of
/// `ack`, `nak` or `term`.
#[async_trait]
pub trait JetStreamMessage: Send + Sync {
    /// Owned copy of the message contents for the Tower service stack
    fn to_request(&self) -> ConsumeRequest;

    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgment, the broker redelivers after `delay` (or immediately)
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;

    /// Terminal rejection, the broker never redelivers
    async fn term(&self) -> Result<()>;
}
