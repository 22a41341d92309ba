use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use crate::nats::{ConsumeRequest, DeliveryOutcome};
use tower::{Layer, Service};
use tracing::{error, info, warn, Instrument, Span};

/// Tower layer that logs the outcome of every consumed NATS message
#[derive(Clone, Default)]
pub struct NatsConsumeLoggingLayer;

impl NatsConsumeLoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for NatsConsumeLoggingLayer {
    type Service = NatsConsumeLoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        NatsConsumeLoggingService { inner: service }
    }
}

/// Service that logs single message consumption
#[derive(Clone)]
pub struct NatsConsumeLoggingService<S> {
    inner: S,
}

impl<S> Service<ConsumeRequest> for NatsConsumeLoggingService<S>
where
    S: Service<ConsumeRequest, Response = DeliveryOutcome> + Clone + Send + 'static,
    S::Error: std::fmt::Display + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let subject = req.subject.clone();
        let msg_id = req.msg_id().unwrap_or_default();
        let payload_size = req.payload.len();
        let start = Instant::now();

        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let span = Span::current();

        Box::pin(
            async move {
                let result = inner.call(req).await;
                let duration_ms = start.elapsed().as_millis();

                match &result {
                    Ok(outcome) => {
                        let outcome_name = outcome.as_str();
                        let reason = outcome.reason().unwrap_or_default();
                        if outcome.is_ack() {
                            info!(
                                subject = %subject,
                                msg_id = %msg_id,
                                payload_bytes = payload_size,
                                outcome = %outcome_name,
                                duration_ms = %duration_ms,
                                "consumed from {subject} in {duration_ms}ms [{outcome_name}]"
                            );
                        } else {
                            warn!(
                                subject = %subject,
                                msg_id = %msg_id,
                                payload_bytes = payload_size,
                                outcome = %outcome_name,
                                reason = %reason,
                                duration_ms = %duration_ms,
                                "consumed from {subject} in {duration_ms}ms [{outcome_name}]"
                            );
                        }
                    }
                    Err(e) => {
                        error!(
                            subject = %subject,
                            msg_id = %msg_id,
                            payload_bytes = payload_size,
                            duration_ms = %duration_ms,
                            error = %e,
                            "failed to consume from {subject} in {duration_ms}ms: {e}"
                        );
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use tower::{ServiceBuilder, ServiceExt};

    #[derive(Clone)]
    struct FixedOutcomeService(DeliveryOutcome);

    impl Service<ConsumeRequest> for FixedOutcomeService {
        type Response = DeliveryOutcome;
        type Error = anyhow::Error;
        type Future = BoxFuture<'static, Result<DeliveryOutcome, anyhow::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: ConsumeRequest) -> Self::Future {
            let outcome = self.0.clone();
            Box::pin(async move { Ok(outcome) })
        }
    }

    #[tokio::test]
    async fn test_logging_layer_passes_outcome_through() {
        let service = ServiceBuilder::new()
            .layer(NatsConsumeLoggingLayer::new())
            .service(FixedOutcomeService(DeliveryOutcome::term("malformed")));

        let req = ConsumeRequest::new("b_log.uploaded".to_string(), Bytes::from("x"), None);
        let outcome = service.oneshot(req).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::term("malformed"));
    }
}
