//! Authentication context supplied by the surrounding application.
//!
//! Sessions and credentials are handled elsewhere; this core only needs to
//! know who is acting and whether they hold the moderator capability.

use serde::{Deserialize, Serialize};

/// Opaque identifier of a user, as issued by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        ActorId(s.to_string())
    }
}

impl From<String> for ActorId {
    fn from(s: String) -> Self {
        ActorId(s)
    }
}

/// The current actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: ActorId,
    pub moderator: bool,
}

impl Actor {
    pub fn user(id: impl Into<ActorId>) -> Self {
        Actor {
            id: id.into(),
            moderator: false,
        }
    }

    pub fn moderator(id: impl Into<ActorId>) -> Self {
        Actor {
            id: id.into(),
            moderator: true,
        }
    }
}
