use crate::domain::{CreatePostRepoInput, IngestError, Post, PostRepository, ResolvedArtifact};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Inserted(Post),
    /// A post with the same dedup key was committed by an earlier delivery
    AlreadyIngested,
}

/// Reads a resolved artifact and stores it as a post.
pub struct IngestionCommitter {
    repository: Arc<dyn PostRepository>,
    operation_timeout: Duration,
}

impl IngestionCommitter {
    pub fn new(repository: Arc<dyn PostRepository>, operation_timeout: Duration) -> Self {
        Self {
            repository,
            operation_timeout,
        }
    }

    /// Reads the artifact as UTF-8 text and inserts it under `dedup_key`.
    ///
    /// The insert is bounded by the operation timeout, expiry is a
    /// retryable [`IngestError::StoreTimeout`].
    #[instrument(skip(self, artifact, title), fields(stored_name = %artifact.stored_name))]
    pub async fn commit(
        &self,
        artifact: &ResolvedArtifact,
        title: &str,
        dedup_key: &str,
    ) -> Result<CommitOutcome, IngestError> {
        let bytes = tokio::fs::read(&artifact.path)
            .await
            .map_err(|source| IngestError::ReadFailure {
                path: artifact.path.clone(),
                source,
            })?;

        let content = String::from_utf8(bytes).map_err(|_| IngestError::ContentNotText {
            path: artifact.path.clone(),
        })?;

        let input = CreatePostRepoInput {
            title: title.to_string(),
            content,
            dedup_key: dedup_key.to_string(),
            stored_name: artifact.stored_name.clone(),
        };

        let inserted = tokio::time::timeout(self.operation_timeout, self.repository.insert_post(input))
            .await
            .map_err(|_| IngestError::StoreTimeout(self.operation_timeout))??;

        match inserted {
            Some(post) => {
                debug!(post_id = post.id, bytes = post.content.len(), "post inserted");
                Ok(CommitOutcome::Inserted(post))
            }
            None => {
                debug!("post already ingested");
                Ok(CommitOutcome::AlreadyIngested)
            }
        }
    }
}
