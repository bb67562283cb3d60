use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Deserialize;

use super::aggregate::Post;
use crate::event_sourcing::core::CallContext;
use crate::event_sourcing::dispatch::{subscriber, Command, CommandDispatcher};
use crate::event_sourcing::store::EventRepository;

// ============================================================================
// Post Command Handler
// ============================================================================
//
// Orchestrates: Command → Aggregate → Events → Event Repository
//
// ============================================================================

pub const CREATE_POST_COMMAND: &str = "create_post";
pub const RENAME_POST_COMMAND: &str = "rename_post";
pub const PUBLISH_POST_COMMAND: &str = "publish_post";

#[derive(Debug, Deserialize)]
struct CreatePost {
    id: String,
    title: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct RenamePost {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct PublishPost {
    id: String,
}

pub struct PostCommandHandler {
    repository: Arc<dyn EventRepository>,
}

impl PostCommandHandler {
    pub fn new(repository: Arc<dyn EventRepository>) -> Self {
        Self { repository }
    }

    /// Register this handler for every post command type.
    pub fn subscribe(self: Arc<Self>, dispatcher: &CommandDispatcher) {
        for command_type in [CREATE_POST_COMMAND, RENAME_POST_COMMAND, PUBLISH_POST_COMMAND] {
            let handler = self.clone();
            dispatcher.add_subscriber(
                command_type,
                subscriber(move |ctx, command: Command| {
                    let handler = handler.clone();
                    async move { handler.handle(&ctx, &command).await }
                }),
            );
        }
    }

    /// Handle a command and persist resulting events
    pub async fn handle(&self, ctx: &CallContext, command: &Command) -> Result<()> {
        let mut post = match command.command_type.as_str() {
            CREATE_POST_COMMAND => {
                let payload: CreatePost = serde_json::from_value(command.payload.clone())?;
                Post::create(&payload.id, &payload.title, &payload.body)?
            }
            RENAME_POST_COMMAND => {
                let payload: RenamePost = serde_json::from_value(command.payload.clone())?;
                let mut post = self.load(&payload.id).await?;
                post.rename(&payload.title)?;
                post
            }
            PUBLISH_POST_COMMAND => {
                let payload: PublishPost = serde_json::from_value(command.payload.clone())?;
                let mut post = self.load(&payload.id).await?;
                post.publish()?;
                post
            }
            other => bail!("Unsupported command type: {}", other),
        };

        self.repository.persist(ctx, &mut post.root).await?;

        tracing::info!(
            post_id = %post.id(),
            command_type = %command.command_type,
            sequence_no = post.root.sequence_no,
            "Handled post command"
        );
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Post> {
        let events = self.repository.get_by_aggregate(id).await?;
        Ok(Post::load(id, &events)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::store::{DocumentEventRepository, InMemoryDocumentStore, RepositoryDefaults};
    use serde_json::json;

    fn repository() -> Arc<dyn EventRepository> {
        Arc::new(DocumentEventRepository::new(
            Arc::new(InMemoryDocumentStore::new()),
            "events",
            RepositoryDefaults::new("blog"),
        ))
    }

    #[tokio::test]
    async fn test_commands_flow_through_dispatcher() {
        let repository = repository();
        let handler = Arc::new(PostCommandHandler::new(repository.clone()));
        let dispatcher = CommandDispatcher::new();
        handler.clone().subscribe(&dispatcher);

        let ctx = CallContext::new().with_account("acct-1").with_user("user-1");
        let commands = [
            Command::new(CREATE_POST_COMMAND, &json!({"id": "post-1", "title": "Draft"})).unwrap(),
            Command::new(RENAME_POST_COMMAND, &json!({"id": "post-1", "title": "Final"})).unwrap(),
            Command::new(PUBLISH_POST_COMMAND, &json!({"id": "post-1"})).unwrap(),
        ];
        for command in commands {
            let report = dispatcher.dispatch(&ctx, command).await;
            assert!(report.is_clean(), "{:?}", report.failures);
        }

        let events = repository.get_by_aggregate("post-1").await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.meta.user == "user-1" && e.meta.account == "acct-1"));
        assert!(events.iter().all(|e| e.meta.module == "blog"));

        let post = handler.load("post-1").await.unwrap();
        assert_eq!(post.title, "Final");
        assert!(post.published);
        assert_eq!(post.root.sequence_no, 3);
    }

    #[tokio::test]
    async fn test_rename_of_unknown_post_fails() {
        let handler = PostCommandHandler::new(repository());
        let command = Command::new(RENAME_POST_COMMAND, &json!({"id": "missing", "title": "x"})).unwrap();

        assert!(handler.handle(&CallContext::new(), &command).await.is_err());
    }
}
