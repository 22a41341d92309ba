use crate::domain::{ArtifactResolver, IngestionCommitter, PostRepository, UploadIngestionService};
use crate::nats::UploadEventConsumerService;
use common::nats::{
    JetStreamConsumer, NatsConsumeLoggingLayer, NatsConsumeLoggingService,
    NatsConsumeTracingLayer, NatsConsumeTracingService, TowerConsumer, TowerConsumerConfig,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tracing::info;

type UploadConsumerStack =
    NatsConsumeTracingService<NatsConsumeLoggingService<UploadEventConsumerService>>;

pub struct MdWorkerConfig {
    pub consumer: TowerConsumerConfig,
    /// Bound on each post insert
    pub operation_timeout: Duration,
}

/// Consumes "file uploaded" events and turns the uploaded files into posts.
pub struct MdWorker {
    consumer: TowerConsumer<UploadConsumerStack>,
}

impl MdWorker {
    pub async fn new(
        post_repository: Arc<dyn PostRepository>,
        resolver: ArtifactResolver,
        consumer_client: Arc<dyn JetStreamConsumer>,
        config: MdWorkerConfig,
    ) -> anyhow::Result<Self> {
        info!(
            storage_root = %resolver.root().display(),
            operation_timeout_ms = config.operation_timeout.as_millis(),
            "initializing md worker"
        );

        let committer = IngestionCommitter::new(post_repository, config.operation_timeout);
        let ingestion = Arc::new(UploadIngestionService::new(resolver, committer));

        let service = ServiceBuilder::new()
            .layer(NatsConsumeTracingLayer::new())
            .layer(NatsConsumeLoggingLayer::new())
            .service(UploadEventConsumerService::new(ingestion));

        let consumer = TowerConsumer::new(consumer_client, config.consumer, service).await?;

        info!("md worker initialized");
        Ok(Self { consumer })
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static
    {
        let consumer = self.consumer;
        move |ctx| Box::pin(async move { consumer.run(ctx).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MockPostRepository;
    use common::nats::{NakBackoff, PullConsumer};
    use common::{MockJetStreamConsumer, MockPullConsumer};

    fn consumer_config() -> TowerConsumerConfig {
        TowerConsumerConfig {
            stream_name: "uploads".to_string(),
            consumer_name: "file_resolver_worker".to_string(),
            filter_subject: "b_log.uploaded".to_string(),
            ack_wait: Duration::from_secs(30),
            max_ack_pending: 1024,
            max_deliver: -1,
            batch_size: 32,
            batch_wait: Duration::from_secs(1),
            max_in_flight: 1024,
            drain_timeout: Duration::from_secs(5),
            nak_backoff: NakBackoff::default(),
        }
    }

    #[tokio::test]
    async fn test_worker_binds_durable_consumer_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ArtifactResolver::new(dir.path()).await.unwrap();

        let mut mock_jetstream = MockJetStreamConsumer::new();
        mock_jetstream
            .expect_create_consumer()
            .withf(|config: &async_nats::jetstream::consumer::pull::Config, stream_name: &str| {
                stream_name == "uploads"
                    && config.durable_name.as_deref() == Some("file_resolver_worker")
                    && config.filter_subject == "b_log.uploaded"
            })
            .times(1)
            .return_once(|_, _| Ok(Box::new(MockPullConsumer::new()) as Box<dyn PullConsumer>));

        let worker = MdWorker::new(
            Arc::new(MockPostRepository::new()),
            resolver,
            Arc::new(mock_jetstream),
            MdWorkerConfig {
                consumer: consumer_config(),
                operation_timeout: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();

        let process = worker.into_runner_process();
        assert!(process(ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_worker_fails_when_consumer_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ArtifactResolver::new(dir.path()).await.unwrap();

        let mut mock_jetstream = MockJetStreamConsumer::new();
        mock_jetstream
            .expect_create_consumer()
            .times(1)
            .return_once(|_, _| Err(anyhow::anyhow!("stream not found")));

        let result = MdWorker::new(
            Arc::new(MockPostRepository::new()),
            resolver,
            Arc::new(mock_jetstream),
            MdWorkerConfig {
                consumer: consumer_config(),
                operation_timeout: Duration::from_secs(5),
            },
        )
        .await;

        assert!(result.is_err());
    }
}
