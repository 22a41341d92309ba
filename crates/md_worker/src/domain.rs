mod artifact_resolver;
mod error;
mod ingestion_committer;
mod post;
mod upload_event;
mod upload_ingestion_service;

pub use artifact_resolver::*;
pub use error::*;
pub use ingestion_committer::*;
pub use post::*;
pub use upload_event::*;
pub use upload_ingestion_service::*;
