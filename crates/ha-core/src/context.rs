//! Context type for tracking the origin of state writes

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Origin and causality of a state write
///
/// A coordinator cycle creates one context and every entity state written
/// as a consequence of that cycle carries a child of it, so all the writes
/// of a cycle can be correlated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier (ULID)
    pub id: String,

    /// User that initiated the action, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Context this one was derived from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a new root context
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Create a root context on behalf of a user
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::new()
        }
    }

    /// Create a context caused by `parent`, inheriting its user
    pub fn with_parent(parent: &Context) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: parent.user_id.clone(),
            parent_id: Some(parent.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
