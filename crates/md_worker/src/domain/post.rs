use crate::domain::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A row in the `posts` table
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub dedup_key: String,
    pub stored_name: String,
    pub created_at: DateTime<Utc>,
}

/// Repository input for creating a post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePostRepoInput {
    pub title: String,
    pub content: String,
    /// Unique per ingested upload, a repeated key inserts nothing
    pub dedup_key: String,
    pub stored_name: String,
}

/// Repository trait for post persistence
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Insert a post, returns `None` when a post with the same dedup key already exists
    async fn insert_post(&self, input: CreatePostRepoInput) -> DomainResult<Option<Post>>;
}
