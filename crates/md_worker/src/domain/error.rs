use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to turn a message body into an [`UploadEvent`](crate::domain::UploadEvent).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error)]
pub enum DomainError {
    /// The store rejected the row itself (data exception or constraint violation)
    #[error("Invalid post data: {0}")]
    InvalidPostData(String),

    #[error("Repository error: {0}")]
    RepositoryError(anyhow::Error),
}

impl DomainError {
    /// Whether retrying the same write can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, DomainError::InvalidPostData(_))
    }
}

/// The pipeline step an [`IngestError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Decode,
    Resolve,
    Commit,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Decode => "decode",
            PipelineStage::Resolve => "resolve",
            PipelineStage::Commit => "commit",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid stored name: {0:?}")]
    InvalidStoredName(String),

    #[error("artifact not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    #[error("failed to read artifact {}: {source}", path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {} is not valid UTF-8 text", path.display())]
    ContentNotText { path: PathBuf },

    #[error("store failure: {source}")]
    StoreFailure {
        permanent: bool,
        #[source]
        source: DomainError,
    },

    #[error("store operation timed out after {0:?}")]
    StoreTimeout(Duration),
}

impl IngestError {
    /// Retryable failures are negatively acknowledged so the broker redelivers them
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Codec(_)
            | IngestError::InvalidStoredName(_)
            | IngestError::ContentNotText { .. } => false,
            IngestError::ArtifactNotFound { .. }
            | IngestError::ReadFailure { .. }
            | IngestError::StoreTimeout(_) => true,
            IngestError::StoreFailure { permanent, .. } => !permanent,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        match self {
            IngestError::Codec(_) => PipelineStage::Decode,
            IngestError::InvalidStoredName(_) | IngestError::ArtifactNotFound { .. } => {
                PipelineStage::Resolve
            }
            IngestError::ReadFailure { .. }
            | IngestError::ContentNotText { .. }
            | IngestError::StoreFailure { .. }
            | IngestError::StoreTimeout(_) => PipelineStage::Commit,
        }
    }
}

impl From<DomainError> for IngestError {
    fn from(source: DomainError) -> Self {
        IngestError::StoreFailure {
            permanent: source.is_permanent(),
            source,
        }
    }
}
