//! SQLite database layer (embedded, no external dependencies)

use super::schemas::PackagedSchemas;
use super::{empty_claims, ClaimWorldRow, SqlResultExt, TownRow, UserRow};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use towns_core::schema::{self, load_schema};
use towns_core::{Database, DatabaseType, LoadState, Result, Settings, TownsError};
use towns_types::{ClaimWorld, Preferences, SavedUser, ServerWorld, Town, User, World};
use tracing::{debug, info};
use uuid::Uuid;

/// SQLite file name that selects a private in-memory database
pub const IN_MEMORY: &str = ":memory:";

pub struct SqliteDatabase {
    settings: Arc<Settings>,
    pool: RwLock<Option<SqlitePool>>,
    state: LoadState,
}

impl SqliteDatabase {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            pool: RwLock::new(None),
            state: LoadState::default(),
        }
    }

    fn pool(&self) -> Result<SqlitePool> {
        self.state.ensure_loaded()?;
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TownsError::NotLoaded)
    }

    /// Substitute configured table names into a statement
    fn sql(&self, statement: &str) -> Result<String> {
        schema::format(statement, self.settings.as_ref())
    }

    async fn connect(&self) -> Result<SqlitePool> {
        let file = self.settings.database.sqlite_file.as_str();
        info!("Opening SQLite database at: {}", file);

        if file == IN_MEMORY {
            // Each connection would get its own empty database, so keep exactly one alive
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| TownsError::Initialization(e.to_string()))?;
            return SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
                .map_err(|e| TownsError::Initialization(e.to_string()));
        }

        if let Some(parent) = std::path::Path::new(file).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TownsError::Initialization(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(file)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        SqlitePoolOptions::new()
            .max_connections(self.settings.database.pool_size.max(1))
            .connect_with(options)
            .await
            .map_err(|e| {
                TownsError::Initialization(format!(
                    "Failed to connect to SQLite database at {}: {}",
                    file, e
                ))
            })
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn kind(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    async fn initialize(&self) -> Result<()> {
        self.state.set_loaded(false);
        let statements = load_schema(&PackagedSchemas, self.kind().schema_file(), self.settings.as_ref())?;
        if statements.is_empty() {
            return Err(TownsError::Initialization(
                "No schema statements could be loaded".to_string(),
            ));
        }

        let pool = self.connect().await?;
        info!("SQLite connection established, creating tables...");
        for statement in &statements {
            sqlx::query(statement).execute(&pool).await.map_err(|e| {
                TownsError::Initialization(format!("Failed to create database tables: {}", e))
            })?;
        }

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        self.state.set_loaded(true);
        info!("SQLite database initialization complete");
        Ok(())
    }

    // User operations
    async fn get_user(&self, uuid: Uuid) -> Result<Option<SavedUser>> {
        let row: Option<UserRow> = sqlx::query_as(&self.sql(
            r#"
            SELECT uuid, username, preferences FROM %user_data% WHERE uuid = ?1
            "#,
        )?)
        .bind(uuid.to_string())
        .fetch_optional(&self.pool()?)
        .await
        .storage()?;

        row.map(SavedUser::try_from).transpose()
    }

    async fn get_user_by_name(&self, username: &str) -> Result<Option<SavedUser>> {
        let row: Option<UserRow> = sqlx::query_as(&self.sql(
            r#"
            SELECT uuid, username, preferences FROM %user_data%
            WHERE username = ?1 COLLATE NOCASE
            "#,
        )?)
        .bind(username)
        .fetch_optional(&self.pool()?)
        .await
        .storage()?;

        row.map(SavedUser::try_from).transpose()
    }

    async fn create_user(&self, user: &User, preferences: &Preferences) -> Result<()> {
        let pool = self.pool()?;
        if self.get_user(user.uuid).await?.is_some() {
            return Err(TownsError::Conflict(format!("User {} already exists", user)));
        }

        sqlx::query(&self.sql(
            r#"
            INSERT INTO %user_data% (uuid, username, preferences)
            VALUES (?1, ?2, ?3)
            "#,
        )?)
        .bind(user.uuid.to_string())
        .bind(&user.username)
        .bind(serde_json::to_string(preferences)?)
        .execute(&pool)
        .await
        .storage()?;

        debug!("Created user {}", user);
        Ok(())
    }

    async fn update_user(&self, user: &User, preferences: &Preferences) -> Result<()> {
        let result = sqlx::query(&self.sql(
            r#"
            UPDATE %user_data% SET username = ?1, preferences = ?2 WHERE uuid = ?3
            "#,
        )?)
        .bind(&user.username)
        .bind(serde_json::to_string(preferences)?)
        .bind(user.uuid.to_string())
        .execute(&self.pool()?)
        .await
        .storage()?;

        if result.rows_affected() == 0 {
            return Err(TownsError::Missing(format!("user {}", user)));
        }
        Ok(())
    }

    async fn delete_all_users(&self) -> Result<()> {
        sqlx::query(&self.sql("DELETE FROM %user_data%")?)
            .execute(&self.pool()?)
            .await
            .storage()?;
        Ok(())
    }

    // Town operations
    async fn get_town(&self, town_id: i32) -> Result<Option<Town>> {
        let row: Option<TownRow> = sqlx::query_as(&self.sql(
            r#"
            SELECT id, name, data FROM %town_data% WHERE id = ?1
            "#,
        )?)
        .bind(town_id)
        .fetch_optional(&self.pool()?)
        .await
        .storage()?;

        row.map(Town::try_from).transpose()
    }

    async fn get_all_towns(&self) -> Result<Vec<Town>> {
        let rows: Vec<TownRow> = sqlx::query_as(&self.sql(
            r#"
            SELECT id, name, data FROM %town_data% ORDER BY id
            "#,
        )?)
        .fetch_all(&self.pool()?)
        .await
        .storage()?;

        rows.into_iter().map(Town::try_from).collect()
    }

    async fn create_town(&self, name: &str, creator: &User) -> Result<Town> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await.storage()?;

        let existing: Option<i32> = sqlx::query_scalar(&self.sql(
            r#"
            SELECT id FROM %town_data% WHERE name = ?1 COLLATE NOCASE
            "#,
        )?)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .storage()?;
        if existing.is_some() {
            return Err(TownsError::Conflict(format!("A town named {} already exists", name)));
        }

        let inserted = sqlx::query(&self.sql(
            r#"
            INSERT INTO %town_data% (name, data) VALUES (?1, '{}')
            "#,
        )?)
        .bind(name)
        .execute(&mut *tx)
        .await
        .storage()?;
        let id = i32::try_from(inserted.last_insert_rowid()).map_err(TownsError::database)?;

        let town = Town::new(id, name, creator);
        sqlx::query(&self.sql(
            r#"
            UPDATE %town_data% SET data = ?1 WHERE id = ?2
            "#,
        )?)
        .bind(serde_json::to_string(&town)?)
        .bind(id)
        .execute(&mut *tx)
        .await
        .storage()?;

        tx.commit().await.storage()?;
        debug!("Created town {} (#{})", town.name, town.id);
        Ok(town)
    }

    async fn update_town(&self, town: &Town) -> Result<()> {
        let result = sqlx::query(&self.sql(
            r#"
            UPDATE %town_data% SET name = ?1, data = ?2 WHERE id = ?3
            "#,
        )?)
        .bind(&town.name)
        .bind(serde_json::to_string(town)?)
        .bind(town.id)
        .execute(&self.pool()?)
        .await
        .storage()?;

        if result.rows_affected() == 0 {
            return Err(TownsError::Missing(format!("town #{}", town.id)));
        }
        Ok(())
    }

    async fn delete_town(&self, town_id: i32) -> Result<()> {
        sqlx::query(&self.sql(
            r#"
            DELETE FROM %town_data% WHERE id = ?1
            "#,
        )?)
        .bind(town_id)
        .execute(&self.pool()?)
        .await
        .storage()?;
        Ok(())
    }

    async fn delete_all_towns(&self) -> Result<()> {
        sqlx::query(&self.sql("DELETE FROM %town_data%")?)
            .execute(&self.pool()?)
            .await
            .storage()?;
        Ok(())
    }

    // Claim world operations
    async fn get_claim_worlds(&self, server: &str) -> Result<HashMap<World, ClaimWorld>> {
        let rows: Vec<ClaimWorldRow> = sqlx::query_as(&self.sql(
            r#"
            SELECT id, server_name, world_uuid, world_name, world_environment, claims
            FROM %claim_data% WHERE server_name = ?1
            "#,
        )?)
        .bind(server)
        .fetch_all(&self.pool()?)
        .await
        .storage()?;

        let mut worlds = HashMap::with_capacity(rows.len());
        for row in rows {
            let (world, claim_world) = row.into_parts()?;
            if !self.settings.is_unclaimable_world(&world) {
                worlds.insert(world, claim_world);
            }
        }
        Ok(worlds)
    }

    async fn get_all_claim_worlds(&self) -> Result<HashMap<ServerWorld, ClaimWorld>> {
        let rows: Vec<ClaimWorldRow> = sqlx::query_as(&self.sql(
            r#"
            SELECT id, server_name, world_uuid, world_name, world_environment, claims
            FROM %claim_data%
            "#,
        )?)
        .fetch_all(&self.pool()?)
        .await
        .storage()?;

        let mut worlds = HashMap::with_capacity(rows.len());
        for row in rows {
            let server = row.server_name().to_string();
            let (world, claim_world) = row.into_parts()?;
            worlds.insert(ServerWorld::new(server, world), claim_world);
        }
        Ok(worlds)
    }

    async fn create_claim_world(&self, world: &World) -> Result<ClaimWorld> {
        let server = self.settings.server_name.as_str();
        let pool = self.pool()?;
        let mut tx = pool.begin().await.storage()?;

        let existing: Option<i32> = sqlx::query_scalar(&self.sql(
            r#"
            SELECT id FROM %claim_data% WHERE server_name = ?1 AND world_uuid = ?2
            "#,
        )?)
        .bind(server)
        .bind(world.uuid.to_string())
        .fetch_optional(&mut *tx)
        .await
        .storage()?;
        if existing.is_some() {
            return Err(TownsError::Conflict(format!(
                "A claim world already exists for {} on {}",
                world, server
            )));
        }

        let inserted = sqlx::query(&self.sql(
            r#"
            INSERT INTO %claim_data% (server_name, world_uuid, world_name, world_environment, claims)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )?)
        .bind(server)
        .bind(world.uuid.to_string())
        .bind(&world.name)
        .bind(&world.environment)
        .bind(empty_claims()?)
        .execute(&mut *tx)
        .await
        .storage()?;
        tx.commit().await.storage()?;

        let id = i32::try_from(inserted.last_insert_rowid()).map_err(TownsError::database)?;
        debug!("Created claim world #{} for {} on {}", id, world, server);
        Ok(ClaimWorld::new(id))
    }

    async fn update_claim_world(&self, claim_world: &ClaimWorld) -> Result<()> {
        let result = sqlx::query(&self.sql(
            r#"
            UPDATE %claim_data% SET claims = ?1 WHERE id = ?2
            "#,
        )?)
        .bind(serde_json::to_string(claim_world)?)
        .bind(claim_world.id)
        .execute(&self.pool()?)
        .await
        .storage()?;

        if result.rows_affected() == 0 {
            return Err(TownsError::Missing(format!("claim world #{}", claim_world.id)));
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.set_loaded(false);
        let pool = self.pool.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("SQLite database closed");
        }
    }

    fn has_loaded(&self) -> bool {
        self.state.has_loaded()
    }
}
