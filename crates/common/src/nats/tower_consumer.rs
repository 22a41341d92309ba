use crate::nats::{
    ConsumeRequest, DeliveryOutcome, JetStreamConsumer, JetStreamMessage, NakBackoff,
    PullConsumer,
};
use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::DeliverPolicy};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

/// Settings for a durable pull consumer and its dispatch loop.
#[derive(Debug, Clone)]
pub struct TowerConsumerConfig {
    pub stream_name: String,
    /// Durable consumer name, shared by every replica of the worker
    pub consumer_name: String,
    pub filter_subject: String,
    /// Redelivery deadline for messages that are never settled
    pub ack_wait: Duration,
    /// Broker-side cap on delivered but unsettled messages
    pub max_ack_pending: i64,
    /// Broker-side redelivery limit, -1 for unlimited
    pub max_deliver: i64,
    pub batch_size: usize,
    pub batch_wait: Duration,
    /// Local cap on concurrently running handlers
    pub max_in_flight: usize,
    /// How long in-flight handlers may keep running after shutdown starts
    pub drain_timeout: Duration,
    pub nak_backoff: NakBackoff,
}

impl TowerConsumerConfig {
    fn pull_config(&self) -> jetstream::consumer::pull::Config {
        jetstream::consumer::pull::Config {
            name: Some(self.consumer_name.clone()),
            durable_name: Some(self.consumer_name.clone()),
            filter_subject: self.filter_subject.clone(),
            deliver_policy: DeliverPolicy::New,
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            max_ack_pending: self.max_ack_pending,
            max_deliver: self.max_deliver,
            ..Default::default()
        }
    }

    /// The local cap never exceeds what the broker lets us hold unsettled
    fn effective_max_in_flight(&self) -> usize {
        let broker_cap = usize::try_from(self.max_ack_pending)
            .ok()
            .filter(|cap| *cap > 0)
            .unwrap_or(usize::MAX);
        self.max_in_flight.clamp(1, broker_cap.max(1))
    }
}

/// A NATS consumer that processes messages through a Tower service stack.
///
/// Every fetched message is handled on its own task, so one slow artifact or
/// store call does not hold up the rest of the batch. At most
/// `max_in_flight` handlers run at once; the loop stops fetching while that
/// many are outstanding.
///
/// The service returns a [`DeliveryOutcome`] that is turned into ack, nak or
/// term. Service errors and panics are caught at the task boundary and
/// settled as nak, so the broker redelivers them.
pub struct TowerConsumer<S> {
    consumer: Box<dyn PullConsumer>,
    config: TowerConsumerConfig,
    service: S,
    in_flight: Arc<Semaphore>,
    handlers: JoinSet<()>,
}

impl<S> TowerConsumer<S>
where
    S: Service<ConsumeRequest, Response = DeliveryOutcome, Error = anyhow::Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    /// Create a new Tower-based consumer, binding to the durable consumer on the stream
    pub async fn new(
        jetstream: Arc<dyn JetStreamConsumer>,
        config: TowerConsumerConfig,
        service: S,
    ) -> Result<Self> {
        debug!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            filter_subject = %config.filter_subject,
            ack_wait_secs = config.ack_wait.as_secs(),
            max_ack_pending = config.max_ack_pending,
            "creating tower nats consumer"
        );

        let consumer = jetstream
            .create_consumer(config.pull_config(), &config.stream_name)
            .await
            .context("failed to create consumer")?;

        let max_in_flight = config.effective_max_in_flight();

        info!(
            stream = %config.stream_name,
            consumer = %config.consumer_name,
            max_in_flight,
            "tower nats consumer created successfully"
        );

        Ok(Self {
            consumer,
            config,
            service,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            handlers: JoinSet::new(),
        })
    }

    /// Run the consumer loop until cancellation, then drain in-flight handlers
    pub async fn run(mut self, ctx: CancellationToken) -> Result<()> {
        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            "starting tower nats consumer"
        );

        while let Some(capacity) = self.wait_for_capacity(&ctx).await {
            let fetch_size = self.config.batch_size.clamp(1, capacity);

            let fetch_started = Instant::now();
            let batch = tokio::select! {
                _ = ctx.cancelled() => break,
                batch = self.consumer.fetch_messages(fetch_size, self.config.batch_wait) => batch,
            };

            match batch {
                Ok(messages) if messages.is_empty() => {
                    debug!("no messages in batch");
                    // An idle stream may answer before batch_wait, never poll faster than that
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep_until(fetch_started + self.config.batch_wait) => {}
                    }
                }
                Ok(messages) => {
                    debug!(message_count = messages.len(), "received message batch");
                    self.dispatch(messages).await;
                }
                Err(e) => {
                    error!(
                        stream = %self.config.stream_name,
                        consumer = %self.config.consumer_name,
                        error = %e,
                        "error fetching batch"
                    );
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }

            self.reap_finished();
        }

        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            "received shutdown signal, stopping consumer"
        );

        self.drain().await;

        info!(
            stream = %self.config.stream_name,
            consumer = %self.config.consumer_name,
            "consumer stopped gracefully"
        );
        Ok(())
    }

    /// Waits until at least one handler slot is free. Returns the number of free
    /// slots, or `None` once shutdown has started.
    async fn wait_for_capacity(&self, ctx: &CancellationToken) -> Option<usize> {
        if ctx.is_cancelled() {
            return None;
        }

        let available = self.in_flight.available_permits();
        if available > 0 {
            return Some(available);
        }

        debug!("all handler slots busy, pausing fetch");
        tokio::select! {
            _ = ctx.cancelled() => None,
            permit = self.in_flight.acquire() => {
                // Only this loop acquires permits, so the slot stays free after release
                drop(permit.ok()?);
                Some(self.in_flight.available_permits().max(1))
            }
        }
    }

    /// Spawns one handler task per message, each holding an in-flight permit
    async fn dispatch(&mut self, messages: Vec<Box<dyn JetStreamMessage>>) {
        for message in messages {
            let permit = match Arc::clone(&self.in_flight).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    // Unsettled messages are redelivered once ack_wait expires
                    error!(error = %e, "handler slots closed, leaving message unsettled");
                    continue;
                }
            };

            let service = self.service.clone();
            let backoff = self.config.nak_backoff;

            self.handlers.spawn(async move {
                let _permit = permit;
                handle_message(service, message, backoff).await;
            });
        }
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.handlers.try_join_next() {
            log_join_result(result);
        }
    }

    /// Gives in-flight handlers up to `drain_timeout` to settle their messages
    async fn drain(&mut self) {
        if self.handlers.is_empty() {
            return;
        }

        let drain_timeout = self.config.drain_timeout;
        info!(
            in_flight = self.handlers.len(),
            drain_timeout_ms = drain_timeout.as_millis(),
            "draining in-flight messages"
        );

        let handlers = &mut self.handlers;
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(result) = handlers.join_next().await {
                log_join_result(result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.handlers.len(),
                "drain timed out, aborting remaining handlers; broker will redeliver after ack_wait"
            );
            self.handlers.shutdown().await;
        }
    }
}

/// Runs the service for one message and settles it with the broker.
async fn handle_message<S>(
    mut service: S,
    message: Box<dyn JetStreamMessage>,
    backoff: NakBackoff,
) -> DeliveryOutcome
where
    S: Service<ConsumeRequest, Response = DeliveryOutcome, Error = anyhow::Error>,
{
    let request = message.to_request();
    let subject = request.subject.clone();
    let msg_id = request.msg_id().unwrap_or_default();
    let delivery_attempt = request.delivery_attempt;

    let guarded = AssertUnwindSafe(async {
        service.ready().await?;
        service.call(request).await
    })
    .catch_unwind()
    .await;

    let outcome = match guarded {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(
                subject = %subject,
                msg_id = %msg_id,
                error = %e,
                "service error processing message"
            );
            DeliveryOutcome::nak(e.to_string())
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(
                subject = %subject,
                msg_id = %msg_id,
                panic = %reason,
                "message handler panicked"
            );
            DeliveryOutcome::nak(format!("handler panicked: {reason}"))
        }
    };

    let settled = match &outcome {
        DeliveryOutcome::Ack => message.ack().await,
        DeliveryOutcome::Nak(_) => message.nak(backoff.delay_for(delivery_attempt)).await,
        DeliveryOutcome::Term(_) => message.term().await,
    };

    if let Err(e) = settled {
        error!(
            subject = %subject,
            msg_id = %msg_id,
            outcome = outcome.as_str(),
            error = %e,
            "failed to settle message"
        );
    }

    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_join_result(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "message handler task panicked");
        } else {
            debug!(error = %e, "message handler task cancelled");
        }
    }
}
