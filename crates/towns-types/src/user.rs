//! User types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A player known to the service, identified by UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub uuid: Uuid,
    pub username: String,
}

impl User {
    pub fn new(uuid: Uuid, username: impl Into<String>) -> Self {
        Self {
            uuid,
            username: username.into(),
        }
    }
}

impl std::fmt::Display for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.username, self.uuid)
    }
}

/// Per-user toggles persisted alongside the user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub town_chat_talking: bool,
    pub town_chat_spying: bool,
    pub town_messages: bool,
    pub auto_claiming_land: bool,
    pub ignoring_claims: bool,
    pub sent_notifications: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            town_chat_talking: false,
            town_chat_spying: false,
            town_messages: true,
            auto_claiming_land: false,
            ignoring_claims: false,
            sent_notifications: Vec::new(),
        }
    }
}

/// A user together with their stored preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedUser {
    pub user: User,
    pub preferences: Preferences,
}

impl SavedUser {
    pub fn new(user: User, preferences: Preferences) -> Self {
        Self { user, preferences }
    }
}
