use crate::nats::traits::{JetStreamConsumer, JetStreamMessage, PullConsumer};
use crate::nats::ConsumeRequest;
use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{
    self,
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind,
};
use async_nats::Event;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Connection settings for the NATS client
#[derive(Debug, Clone)]
pub struct NatsConnectConfig {
    pub url: String,
    /// Client name reported to the server
    pub name: String,
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    /// JetStream domain, `None` for the default domain
    pub jetstream_domain: Option<String>,
}

/// Settings used when the stream has to be created
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub name: String,
    pub subjects: Vec<String>,
    pub description: Option<String>,
    /// Window in which JetStream drops publishes with a repeated `Nats-Msg-Id`
    pub duplicate_window: Duration,
}

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(config: &NatsConnectConfig) -> Result<Self> {
        info!(
            url = %config.url,
            timeout_ms = config.connection_timeout.as_millis(),
            jetstream_domain = config.jetstream_domain.as_deref().unwrap_or_default(),
            "connecting to NATS"
        );

        let client = async_nats::ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connection_timeout)
            .ping_interval(config.ping_interval)
            .max_reconnects(None::<usize>)
            .no_echo()
            .event_callback(|event| async move {
                match event {
                    Event::Disconnected => warn!("nats disconnected"),
                    Event::Connected => info!("nats connected"),
                    Event::Closed => info!("nats connection closed"),
                    other => debug!(event = %other, "nats connection event"),
                }
            })
            .connect(config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        let jetstream = match &config.jetstream_domain {
            Some(domain) => jetstream::with_domain(client.clone(), domain),
            None => jetstream::new(client.clone()),
        };

        info!("successfully connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Creates the stream unless it already exists. An existing stream is left untouched.
    pub async fn ensure_stream(&self, settings: &StreamSettings) -> Result<()> {
        info!(stream = %settings.name, "ensuring stream exists");

        match self.jetstream.get_stream(&settings.name).await {
            Ok(_) => {
                info!(stream = %settings.name, "stream already exists");
            }
            Err(e) => {
                debug!(stream = %settings.name, error = %e, "stream lookup failed, creating it");

                let stream_config = StreamConfig {
                    name: settings.name.clone(),
                    subjects: settings.subjects.clone(),
                    description: settings.description.clone(),
                    storage: StorageType::File,
                    retention: RetentionPolicy::Limits,
                    duplicate_window: settings.duplicate_window,
                    ..Default::default()
                };

                self.jetstream
                    .create_stream(stream_config)
                    .await
                    .context("Failed to create stream")?;
                info!(stream = %settings.name, "created stream");
            }
        }

        Ok(())
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Create a JetStreamConsumer trait object from this client
    pub fn create_consumer_client(&self) -> Arc<dyn JetStreamConsumer> {
        Arc::new(NatsJetStreamConsumer::new(self.jetstream.clone()))
    }

    /// Flushes pending acknowledgments before the connection is dropped
    pub async fn close(self) {
        info!("closing NATS connection");
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "failed to flush NATS connection on close");
        }
    }
}

/// Concrete implementation of JetStreamConsumer using async-nats
pub struct NatsJetStreamConsumer {
    context: jetstream::Context,
}

impl NatsJetStreamConsumer {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamConsumer for NatsJetStreamConsumer {
    async fn create_consumer(
        &self,
        config: jetstream::consumer::pull::Config,
        stream_name: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let consumer = self
            .context
            .create_consumer_on_stream(config, stream_name)
            .await
            .context("Failed to create consumer")?;

        Ok(Box::new(NatsPullConsumer { consumer }))
    }
}

/// Concrete implementation of PullConsumer using async-nats
pub struct NatsPullConsumer {
    consumer: jetstream::consumer::PullConsumer,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch_messages(
        &self,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn JetStreamMessage>>> {
        use futures::StreamExt;

        // batch() long-polls until `expires`; fetch() would return at once when idle
        let mut messages = self
            .consumer
            .batch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .context("Failed to fetch messages")?;

        let mut result: Vec<Box<dyn JetStreamMessage>> = Vec::new();
        while let Some(msg) = messages.next().await {
            match msg {
                Ok(message) => result.push(Box::new(NatsJetStreamMessage { message })),
                Err(e) => {
                    error!(error = %e, "error receiving message");
                    // Continue processing other messages
                }
            }
        }
        Ok(result)
    }
}

/// A delivered async-nats JetStream message
pub struct NatsJetStreamMessage {
    message: jetstream::Message,
}

#[async_trait]
impl JetStreamMessage for NatsJetStreamMessage {
    fn to_request(&self) -> ConsumeRequest {
        let delivery_attempt = self
            .message
            .info()
            .ok()
            .and_then(|info| u64::try_from(info.delivered).ok());

        ConsumeRequest::new(
            self.message.subject.to_string(),
            self.message.payload.clone(),
            self.message.headers.clone(),
        )
        .with_delivery_attempt(delivery_attempt)
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow!("failed to ack message: {e}"))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| anyhow!("failed to nak message: {e}"))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| anyhow!("failed to term message: {e}"))
    }
}
