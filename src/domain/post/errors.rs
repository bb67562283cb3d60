use crate::event_sourcing::core::ReplayError;

// ============================================================================
// Post Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("Post title cannot be empty")]
    EmptyTitle,

    #[error("Post {0} is already published")]
    AlreadyPublished(String),

    #[error("Post {0} does not exist")]
    NotFound(String),

    #[error("Invalid event payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}
