use crate::domain::{CreatePostRepoInput, DomainError, DomainResult, Post, PostRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::postgres::PostgresClient;
use tracing::{debug, instrument};

/// SQLSTATE classes where retrying the same row cannot succeed:
/// 22 (data exception) and 23 (integrity constraint violation)
pub fn is_permanent_sqlstate(code: &str) -> bool {
    code.starts_with("22") || code.starts_with("23")
}

#[derive(Clone)]
pub struct PostgresPostRepository {
    client: PostgresClient,
}

impl PostgresPostRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PostRepository for PostgresPostRepository {
    #[instrument(skip(self, input), fields(dedup_key = %input.dedup_key, stored_name = %input.stored_name))]
    async fn insert_post(&self, input: CreatePostRepoInput) -> DomainResult<Option<Post>> {
        debug!(bytes = input.content.len(), "inserting post");

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let result = conn
            .query_opt(
                "INSERT INTO posts (title, content, dedup_key, stored_name)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (dedup_key) DO NOTHING
                 RETURNING id, created_at",
                &[
                    &input.title,
                    &input.content,
                    &input.dedup_key,
                    &input.stored_name,
                ],
            )
            .await;

        let row = match result {
            Ok(row) => row,
            Err(e) => {
                if let Some(db_err) = e.as_db_error() {
                    let code = db_err.code().code();
                    if is_permanent_sqlstate(code) {
                        return Err(DomainError::InvalidPostData(format!(
                            "{} (SQLSTATE {})",
                            db_err.message(),
                            code
                        )));
                    }
                }
                return Err(DomainError::RepositoryError(e.into()));
            }
        };

        let Some(row) = row else {
            debug!("post with this dedup key already exists");
            return Ok(None);
        };

        let id: i64 = row.get(0);
        let created_at: DateTime<Utc> = row.get(1);
        debug!(post_id = id, "post inserted");

        Ok(Some(Post {
            id,
            title: input.title,
            content: input.content,
            dedup_key: input.dedup_key,
            stored_name: input.stored_name,
            created_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_and_constraint_classes_are_permanent() {
        // string_data_right_truncation, character_not_in_repertoire
        assert!(is_permanent_sqlstate("22001"));
        assert!(is_permanent_sqlstate("22021"));
        // not_null_violation, unique_violation, check_violation
        assert!(is_permanent_sqlstate("23502"));
        assert!(is_permanent_sqlstate("23505"));
        assert!(is_permanent_sqlstate("23514"));
    }

    #[test]
    fn test_other_classes_are_transient() {
        // connection_failure, serialization_failure, query_canceled, admin_shutdown
        assert!(!is_permanent_sqlstate("08006"));
        assert!(!is_permanent_sqlstate("40001"));
        assert!(!is_permanent_sqlstate("57014"));
        assert!(!is_permanent_sqlstate("57P01"));
        // undefined_table, e.g. migrations not applied yet
        assert!(!is_permanent_sqlstate("42P01"));
    }
}
