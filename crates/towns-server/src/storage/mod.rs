//! Storage layer
//!
//! SQLite (embedded) and PostgreSQL backends for the `Database` contract,
//! plus the DashMap-backed datasets the services serve reads from.

pub mod memory;
pub mod postgres;
pub mod schemas;
pub mod sqlite;

pub use memory::CachedMap;
pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

use std::sync::Arc;
use towns_core::{Database, DatabaseType, Result, Settings, TownsError};
use towns_types::{ClaimWorld, Preferences, SavedUser, Town, User, World};
use uuid::Uuid;

/// Build the backend selected in settings. Nothing is connected until
/// `initialize()` is called.
pub fn open_database(settings: Arc<Settings>) -> Arc<dyn Database> {
    match settings.database.kind {
        DatabaseType::Sqlite => Arc::new(SqliteDatabase::new(settings)),
        DatabaseType::Postgresql => Arc::new(PostgresDatabase::new(settings)),
    }
}

/// Maps driver errors into the core error kinds
pub(crate) trait SqlResultExt<T> {
    fn storage(self) -> Result<T>;
}

impl<T> SqlResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn storage(self) -> Result<T> {
        self.map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                TownsError::Conflict(db.message().to_string())
            }
            _ => TownsError::database(err),
        })
    }
}

// Helper structs for sqlx query_as, shared by both engines
#[derive(sqlx::FromRow)]
pub(crate) struct UserRow {
    uuid: String,
    username: String,
    preferences: String,
}

impl TryFrom<UserRow> for SavedUser {
    type Error = TownsError;

    fn try_from(r: UserRow) -> Result<Self> {
        Ok(SavedUser {
            user: User::new(parse_uuid(&r.uuid)?, r.username),
            preferences: serde_json::from_str::<Preferences>(&r.preferences)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TownRow {
    id: i32,
    name: String,
    data: String,
}

impl TryFrom<TownRow> for Town {
    type Error = TownsError;

    fn try_from(r: TownRow) -> Result<Self> {
        let mut town: Town = serde_json::from_str(&r.data)?;
        // Columns are authoritative over the blob
        town.id = r.id;
        town.name = r.name;
        Ok(town)
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ClaimWorldRow {
    id: i32,
    server_name: String,
    world_uuid: String,
    world_name: String,
    world_environment: String,
    claims: String,
}

impl ClaimWorldRow {
    pub(crate) fn server_name(&self) -> &str {
        &self.server_name
    }

    pub(crate) fn into_parts(self) -> Result<(World, ClaimWorld)> {
        let world = World::new(
            parse_uuid(&self.world_uuid)?,
            self.world_name,
            self.world_environment,
        );
        let mut claim_world: ClaimWorld = serde_json::from_str(&self.claims)?;
        claim_world.id = self.id;
        Ok((world, claim_world))
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(TownsError::database)
}

/// Serialized claim grid of a newly created claim world
pub(crate) fn empty_claims() -> Result<String> {
    Ok(serde_json::to_string(&ClaimWorld::default())?)
}
