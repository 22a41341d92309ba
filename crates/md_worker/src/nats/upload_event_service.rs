use crate::domain::{CommitOutcome, IngestError, UploadIngestionService};
use common::nats::{ConsumeRequest, DeliveryOutcome};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{error, info, warn};

/// Tower service for processing individual upload events.
///
/// Runs the ingestion pipeline and maps its result onto the broker's
/// acknowledgment protocol:
/// - committed or already committed: ack
/// - retryable failure: nak
/// - permanent failure: term
#[derive(Clone)]
pub struct UploadEventConsumerService {
    ingestion: Arc<UploadIngestionService>,
}

impl UploadEventConsumerService {
    pub fn new(ingestion: Arc<UploadIngestionService>) -> Self {
        Self { ingestion }
    }
}

impl Service<ConsumeRequest> for UploadEventConsumerService {
    type Response = DeliveryOutcome;
    type Error = anyhow::Error;
    type Future = BoxFuture<'static, Result<DeliveryOutcome, anyhow::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ConsumeRequest) -> Self::Future {
        let ingestion = self.ingestion.clone();

        Box::pin(async move {
            let msg_id = req.msg_id();
            let msg_id_field = msg_id.as_deref().unwrap_or_default();

            match ingestion.process(msg_id.as_deref(), &req.payload).await {
                Ok(CommitOutcome::Inserted(post)) => {
                    info!(
                        msg_id = %msg_id_field,
                        post_id = post.id,
                        title = %post.title,
                        bytes = post.content.len(),
                        "post created from upload"
                    );
                    Ok(DeliveryOutcome::ack())
                }
                Ok(CommitOutcome::AlreadyIngested) => {
                    info!(msg_id = %msg_id_field, "upload already ingested, acknowledging redelivery");
                    Ok(DeliveryOutcome::ack())
                }
                Err(e) => Ok(outcome_for_error(msg_id_field, &e)),
            }
        })
    }
}

/// Logs a pipeline failure and picks how the message is settled
fn outcome_for_error(msg_id: &str, err: &IngestError) -> DeliveryOutcome {
    let stage = err.stage();

    match err {
        IngestError::ArtifactNotFound { path } => {
            warn!(
                msg_id = %msg_id,
                stage = %stage,
                path = %path.display(),
                "artifact not found, will retry"
            );
        }
        IngestError::Codec(_) => {
            error!(msg_id = %msg_id, stage = %stage, error = %err, "failed to decode upload event");
        }
        _ if err.is_retryable() => {
            warn!(msg_id = %msg_id, stage = %stage, error = %err, "upload ingestion failed, will retry");
        }
        _ => {
            error!(msg_id = %msg_id, stage = %stage, error = %err, "upload ingestion failed permanently");
        }
    }

    let reason = format!("{stage}: {err}");
    if err.is_retryable() {
        DeliveryOutcome::nak(reason)
    } else {
        DeliveryOutcome::term(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ArtifactResolver, CreatePostRepoInput, DomainError, IngestionCommitter, MockPostRepository,
        Post,
    };
    use async_nats::HeaderMap;
    use bytes::Bytes;
    use chrono::Utc;
    use common::nats::MSG_ID_HEADER;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const NOTES_EVENT: &str = r#"{"original_name":"notes.md","stored_name":"a1b2.md","size":42,"uploaded_at":"2024-01-01T00:00:00Z"}"#;

    async fn service_with(dir: &TempDir, repository: MockPostRepository) -> UploadEventConsumerService {
        let resolver = ArtifactResolver::new(dir.path()).await.unwrap();
        let committer = IngestionCommitter::new(Arc::new(repository), Duration::from_secs(5));
        UploadEventConsumerService::new(Arc::new(UploadIngestionService::new(resolver, committer)))
    }

    fn request(payload: &str, msg_id: Option<&str>) -> ConsumeRequest {
        let headers = msg_id.map(|id| {
            let mut headers = HeaderMap::new();
            headers.insert(MSG_ID_HEADER, id);
            headers
        });
        ConsumeRequest::new(
            "b_log.uploaded".to_string(),
            Bytes::from(payload.to_string()),
            headers,
        )
    }

    #[tokio::test]
    async fn test_readable_artifact_is_acked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1b2.md"), "# Hello").unwrap();

        let mut mock_repo = MockPostRepository::new();
        mock_repo
            .expect_insert_post()
            .withf(|input: &CreatePostRepoInput| {
                input.title == "notes.md" && input.content == "# Hello" && input.dedup_key == "upload-1"
            })
            .times(1)
            .return_once(|input| {
                Ok(Some(Post {
                    id: 7,
                    title: input.title,
                    content: input.content,
                    dedup_key: input.dedup_key,
                    stored_name: input.stored_name,
                    created_at: Utc::now(),
                }))
            });

        let service = service_with(&dir, mock_repo).await;
        let outcome = service.oneshot(request(NOTES_EVENT, Some("upload-1"))).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Ack);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_nacked() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock_repo = MockPostRepository::new();
        mock_repo.expect_insert_post().never();

        let service = service_with(&dir, mock_repo).await;
        let outcome = service.oneshot(request(NOTES_EVENT, Some("upload-1"))).await.unwrap();

        assert!(outcome.is_nak());
        assert!(outcome.reason().unwrap().starts_with("resolve:"));
    }

    #[tokio::test]
    async fn test_unparseable_body_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock_repo = MockPostRepository::new();
        mock_repo.expect_insert_post().never();

        let service = service_with(&dir, mock_repo).await;
        let outcome = service.oneshot(request("not-json", None)).await.unwrap();

        assert!(outcome.is_term());
        assert!(outcome.reason().unwrap().starts_with("decode:"));
    }

    #[tokio::test]
    async fn test_invalid_stored_name_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock_repo = MockPostRepository::new();
        mock_repo.expect_insert_post().never();

        let service = service_with(&dir, mock_repo).await;
        let outcome = service
            .oneshot(request(
                r#"{"original_name":"x","stored_name":"../","size":1,"uploaded_at":"2024-01-01T00:00:00Z"}"#,
                None,
            ))
            .await
            .unwrap();

        assert!(outcome.is_term());
    }

    #[tokio::test]
    async fn test_redelivered_upload_is_acked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1b2.md"), "# Hello").unwrap();

        let mut mock_repo = MockPostRepository::new();
        mock_repo
            .expect_insert_post()
            .times(1)
            .return_once(|_| Ok(None));

        let service = service_with(&dir, mock_repo).await;
        let outcome = service.oneshot(request(NOTES_EVENT, Some("upload-1"))).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Ack);
    }

    #[tokio::test]
    async fn test_store_failures_follow_their_class() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1b2.md"), "# Hello").unwrap();

        let mut transient_repo = MockPostRepository::new();
        transient_repo.expect_insert_post().times(1).return_once(|_| {
            Err(DomainError::RepositoryError(anyhow::anyhow!("pool timed out")))
        });
        let outcome = service_with(&dir, transient_repo)
            .await
            .oneshot(request(NOTES_EVENT, Some("upload-1")))
            .await
            .unwrap();
        assert!(outcome.is_nak());

        let mut permanent_repo = MockPostRepository::new();
        permanent_repo
            .expect_insert_post()
            .times(1)
            .return_once(|_| Err(DomainError::InvalidPostData("check violation".to_string())));
        let outcome = service_with(&dir, permanent_repo)
            .await
            .oneshot(request(NOTES_EVENT, Some("upload-1")))
            .await
            .unwrap();
        assert!(outcome.is_term());
    }
}
