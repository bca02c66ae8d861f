//! Storage backend contract
//!
//! Each supported engine implements [`Database`] once. Backends share the
//! placeholder formatting in [`crate::schema`] and the [`LoadState`] gate
//! rather than inheriting them.

use crate::error::{Result, TownsError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use towns_types::{ClaimWorld, Preferences, SavedUser, ServerWorld, Town, User, World};
use uuid::Uuid;

/// Supported database engines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgresql,
}

impl DatabaseType {
    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "SQLite",
            DatabaseType::Postgresql => "PostgreSQL",
        }
    }

    /// Schema resource for this engine, relative to `database/`
    pub fn schema_file(&self) -> &'static str {
        match self {
            DatabaseType::Sqlite => "sqlite_schema.sql",
            DatabaseType::Postgresql => "postgresql_schema.sql",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Tracks whether `initialize()` succeeded.
///
/// Backends check it at the top of every operation so that use before
/// initialization fails fast instead of returning empty data.
#[derive(Debug, Default)]
pub struct LoadState {
    loaded: AtomicBool,
}

impl LoadState {
    pub fn has_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::Release);
    }

    pub fn ensure_loaded(&self) -> Result<()> {
        if self.has_loaded() {
            Ok(())
        } else {
            Err(TownsError::NotLoaded)
        }
    }
}

/// Durable storage for users, towns and claim worlds.
///
/// Lookups return `Ok(None)` when nothing matches. Everything else that
/// goes wrong is an error, so callers can tell "no data" from "broken
/// connection". Mutations are durable once the returned future resolves.
#[async_trait]
pub trait Database: Send + Sync {
    fn kind(&self) -> DatabaseType;

    /// Connect and create the schema. A failure here is fatal to the host.
    async fn initialize(&self) -> Result<()>;

    async fn get_user(&self, uuid: Uuid) -> Result<Option<SavedUser>>;

    /// Case-insensitive lookup by username
    async fn get_user_by_name(&self, username: &str) -> Result<Option<SavedUser>>;

    /// Fails with `Conflict` if the UUID is already stored
    async fn create_user(&self, user: &User, preferences: &Preferences) -> Result<()>;

    /// Fails with `Missing` if the UUID is not stored
    async fn update_user(&self, user: &User, preferences: &Preferences) -> Result<()>;

    async fn delete_all_users(&self) -> Result<()>;

    async fn get_town(&self, town_id: i32) -> Result<Option<Town>>;

    async fn get_all_towns(&self) -> Result<Vec<Town>>;

    /// Store a new town; the id is assigned by the store.
    /// Fails with `Conflict` if the name is taken.
    async fn create_town(&self, name: &str, creator: &User) -> Result<Town>;

    async fn update_town(&self, town: &Town) -> Result<()>;

    async fn delete_town(&self, town_id: i32) -> Result<()>;

    async fn delete_all_towns(&self) -> Result<()>;

    /// Claim worlds on `server`, excluding unclaimable worlds
    async fn get_claim_worlds(&self, server: &str) -> Result<HashMap<World, ClaimWorld>>;

    /// Claim worlds on every server, unfiltered
    async fn get_all_claim_worlds(&self) -> Result<HashMap<ServerWorld, ClaimWorld>>;

    /// Create the claim world for `world` on this server.
    /// Fails with `Conflict` if one already exists.
    async fn create_claim_world(&self, world: &World) -> Result<ClaimWorld>;

    /// Replace the stored claim grid
    async fn update_claim_world(&self, claim_world: &ClaimWorld) -> Result<()>;

    /// Release the connection. Calling it twice is harmless.
    async fn close(&self);

    fn has_loaded(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_load_state_gates_use() {
        let state = LoadState::default();
        assert!(!state.has_loaded());
        let err = assert_err!(state.ensure_loaded());
        assert!(matches!(err, TownsError::NotLoaded));

        state.set_loaded(true);
        assert_ok!(state.ensure_loaded());
    }

    #[test]
    fn test_database_type_names() {
        assert_eq!(DatabaseType::Sqlite.to_string(), "SQLite");
        assert_eq!(DatabaseType::Postgresql.schema_file(), "postgresql_schema.sql");
        let parsed: DatabaseType = serde_json::from_str(r#""postgresql""#).unwrap();
        assert_eq!(parsed, DatabaseType::Postgresql);
    }
}
