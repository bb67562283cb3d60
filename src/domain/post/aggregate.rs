use serde::{Deserialize, Serialize};

use super::errors::PostError;
use super::events::*;
use crate::event_sourcing::core::{reduce, replay, AggregateRoot, Event, Reducible};

// ============================================================================
// Post Aggregate - Domain Logic
// ============================================================================
//
// Business methods check their rule, build an event, fold it into the current
// state and leave it pending on the embedded root until a repository persists
// it.
//
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    #[serde(flatten)]
    pub root: AggregateRoot,

    pub title: String,
    pub body: String,
    pub published: bool,
}

impl Reducible for Post {
    fn aggregate_root_mut(&mut self) -> Option<&mut AggregateRoot> {
        Some(&mut self.root)
    }
}

impl Post {
    pub fn create(id: &str, title: &str, body: &str) -> Result<Self, PostError> {
        if title.trim().is_empty() {
            return Err(PostError::EmptyTitle);
        }

        let mut post = Self {
            root: AggregateRoot::new(id),
            ..Self::default()
        };
        let payload = PostCreated {
            title: title.to_string(),
            body: body.to_string(),
        };
        post.record(Event::new(CREATE_POST, id, ENTITY_TYPE, &payload)?)?;
        Ok(post)
    }

    /// Rebuild a post from its stored history.
    pub fn load(id: &str, events: &[Event]) -> Result<Self, PostError> {
        if events.is_empty() {
            return Err(PostError::NotFound(id.to_string()));
        }

        let initial = Self {
            root: AggregateRoot::new(id),
            ..Self::default()
        };
        Ok(replay(initial, events)?)
    }

    pub fn rename(&mut self, title: &str) -> Result<(), PostError> {
        if title.trim().is_empty() {
            return Err(PostError::EmptyTitle);
        }

        let payload = PostRenamed {
            title: title.to_string(),
        };
        let event = Event::new(UPDATE_POST, &self.root.id, ENTITY_TYPE, &payload)?;
        self.record(event)
    }

    pub fn publish(&mut self) -> Result<(), PostError> {
        if self.published {
            return Err(PostError::AlreadyPublished(self.root.id.clone()));
        }

        let event = Event::new(PUBLISH_POST, &self.root.id, ENTITY_TYPE, &PostPublished { published: true })?;
        self.record(event)
    }

    pub fn id(&self) -> &str {
        &self.root.id
    }

    fn record(&mut self, event: Event) -> Result<(), PostError> {
        *self = reduce(self.clone(), &event)?;
        self.root.new_change(event);
        Ok(())
    }
}
