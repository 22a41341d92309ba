use crate::domain::{ArtifactResolver, CommitOutcome, IngestError, IngestionCommitter, UploadEvent};
use tracing::{info, instrument, warn};

/// Key that makes an ingest idempotent across redeliveries.
///
/// The message id when the publisher set one, otherwise the stored base name.
pub fn dedup_key(msg_id: Option<&str>, stored_name: &str) -> String {
    match msg_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => format!("stored_name:{stored_name}"),
    }
}

/// Domain service for "file uploaded" events: decode, resolve, commit
pub struct UploadIngestionService {
    resolver: ArtifactResolver,
    committer: IngestionCommitter,
}

impl UploadIngestionService {
    pub fn new(resolver: ArtifactResolver, committer: IngestionCommitter) -> Self {
        Self {
            resolver,
            committer,
        }
    }

    /// Runs one message body through the pipeline
    #[instrument(skip_all, fields(msg_id = msg_id.unwrap_or_default()))]
    pub async fn process(
        &self,
        msg_id: Option<&str>,
        payload: &[u8],
    ) -> Result<CommitOutcome, IngestError> {
        let event = UploadEvent::decode(payload)?;
        let artifact = self.resolver.resolve(&event.stored_name).await?;

        info!(
            path = %artifact.path.display(),
            original_name = %event.original_name,
            size = event.size,
            uploaded_at = %event.uploaded_at.to_rfc3339(),
            "resolved artifact"
        );

        if u64::try_from(event.size).ok() != Some(artifact.size) {
            warn!(
                stored_name = %artifact.stored_name,
                advertised_size = event.size,
                actual_size = artifact.size,
                "artifact size differs from advertised size"
            );
        }

        let key = dedup_key(msg_id, &artifact.stored_name);
        self.committer.commit(&artifact, event.title(), &key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CreatePostRepoInput, DomainResult, Post, PostRepository};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Post repository backed by a vector, honoring the dedup key
    #[derive(Default)]
    struct InMemoryPostRepository {
        posts: Mutex<Vec<Post>>,
    }

    impl InMemoryPostRepository {
        fn posts(&self) -> Vec<Post> {
            self.posts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PostRepository for InMemoryPostRepository {
        async fn insert_post(&self, input: CreatePostRepoInput) -> DomainResult<Option<Post>> {
            let mut posts = self.posts.lock().unwrap();
            if posts.iter().any(|post| post.dedup_key == input.dedup_key) {
                return Ok(None);
            }

            let post = Post {
                id: posts.len() as i64 + 1,
                title: input.title,
                content: input.content,
                dedup_key: input.dedup_key,
                stored_name: input.stored_name,
                created_at: Utc::now(),
            };
            posts.push(post.clone());
            Ok(Some(post))
        }
    }

    async fn service_in(
        dir: &TempDir,
    ) -> (UploadIngestionService, Arc<InMemoryPostRepository>) {
        let repository = Arc::new(InMemoryPostRepository::default());
        let resolver = ArtifactResolver::new(dir.path()).await.unwrap();
        let committer = IngestionCommitter::new(repository.clone(), Duration::from_secs(5));
        (UploadIngestionService::new(resolver, committer), repository)
    }

    const NOTES_EVENT: &[u8] = br#"{"original_name":"notes.md","stored_name":"a1b2.md","size":42,"uploaded_at":"2024-01-01T00:00:00Z"}"#;

    #[test]
    fn test_dedup_key_prefers_message_id() {
        assert_eq!(dedup_key(Some("msg-1"), "a1b2.md"), "msg-1");
        assert_eq!(dedup_key(Some("  "), "a1b2.md"), "stored_name:a1b2.md");
        assert_eq!(dedup_key(None, "a1b2.md"), "stored_name:a1b2.md");
    }

    #[tokio::test]
    async fn test_readable_artifact_is_committed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1b2.md"), "# Hello").unwrap();
        let (service, repository) = service_in(&dir).await;

        let outcome = service.process(Some("msg-1"), NOTES_EVENT).await.unwrap();

        assert!(matches!(outcome, CommitOutcome::Inserted(_)));
        let posts = repository.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "notes.md");
        assert_eq!(posts[0].content, "# Hello");
        assert_eq!(posts[0].dedup_key, "msg-1");
    }

    #[tokio::test]
    async fn test_title_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c3d4.md"), "body").unwrap();
        let (service, repository) = service_in(&dir).await;

        service
            .process(
                None,
                br#"{"original_name":"  spaced title.md \n","stored_name":"c3d4.md","size":4,"uploaded_at":"2024-01-01T00:00:00Z"}"#,
            )
            .await
            .unwrap();

        assert_eq!(repository.posts()[0].title, "spaced title.md");
        assert_eq!(repository.posts()[0].dedup_key, "stored_name:c3d4.md");
    }

    #[tokio::test]
    async fn test_missing_artifact_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = service_in(&dir).await;

        let err = service.process(Some("msg-1"), NOTES_EVENT).await.unwrap_err();

        assert!(matches!(err, IngestError::ArtifactNotFound { .. }));
        assert!(repository.posts().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_body_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (service, repository) = service_in(&dir).await;

        let err = service.process(Some("msg-1"), b"not-json").await.unwrap_err();

        assert!(matches!(err, IngestError::Codec(_)));
        assert!(!err.is_retryable());
        assert!(repository.posts().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1b2.md"), "# Hello").unwrap();
        let (service, repository) = service_in(&dir).await;

        let first = service.process(Some("msg-1"), NOTES_EVENT).await.unwrap();
        let second = service.process(Some("msg-1"), NOTES_EVENT).await.unwrap();

        assert!(matches!(first, CommitOutcome::Inserted(_)));
        assert_eq!(second, CommitOutcome::AlreadyIngested);
        assert_eq!(repository.posts().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_distinct_messages_produce_distinct_rows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.md"), "first").unwrap();
        std::fs::write(dir.path().join("two.md"), "second").unwrap();
        let (service, repository) = service_in(&dir).await;

        let (one, two) = tokio::join!(
            service.process(
                Some("msg-1"),
                br#"{"original_name":"one.md","stored_name":"one.md","size":5,"uploaded_at":"2024-01-01T00:00:00Z"}"#,
            ),
            service.process(
                Some("msg-2"),
                br#"{"original_name":"two.md","stored_name":"two.md","size":6,"uploaded_at":"2024-01-01T00:00:00Z"}"#,
            ),
        );
        one.unwrap();
        two.unwrap();

        let mut contents: Vec<String> = repository.posts().into_iter().map(|p| p.content).collect();
        contents.sort();
        assert_eq!(contents, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_traversal_name_is_confined_to_root() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("uploads");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("passwd"), "root:x:0:0").unwrap();

        let repository = Arc::new(InMemoryPostRepository::default());
        let service = UploadIngestionService::new(
            ArtifactResolver::new(&root).await.unwrap(),
            IngestionCommitter::new(repository.clone(), Duration::from_secs(5)),
        );

        let err = service
            .process(
                Some("msg-1"),
                br#"{"original_name":"x","stored_name":"../passwd","size":10,"uploaded_at":"2024-01-01T00:00:00Z"}"#,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::ArtifactNotFound { .. }));
        assert!(repository.posts().is_empty());
    }
}
