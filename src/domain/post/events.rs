use serde::{Deserialize, Serialize};

// ============================================================================
// Post Events
// ============================================================================

pub const ENTITY_TYPE: &str = "Post";

pub const CREATE_POST: &str = "CREATE_POST";
pub const UPDATE_POST: &str = "UPDATE_POST";
pub const PUBLISH_POST: &str = "PUBLISH_POST";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostCreated {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostRenamed {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostPublished {
    pub published: bool,
}
