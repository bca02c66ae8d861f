//! PostgreSQL database layer for multi-server deployments sharing one store

use super::schemas::PackagedSchemas;
use super::{empty_claims, ClaimWorldRow, SqlResultExt, TownRow, UserRow};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use towns_core::schema::{self, load_schema};
use towns_core::{Database, DatabaseType, LoadState, Result, Settings, TownsError};
use towns_types::{ClaimWorld, Preferences, SavedUser, ServerWorld, Town, User, World};
use tracing::{debug, info};
use uuid::Uuid;

pub struct PostgresDatabase {
    settings: Arc<Settings>,
    pool: RwLock<Option<PgPool>>,
    state: LoadState,
}

impl PostgresDatabase {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            pool: RwLock::new(None),
            state: LoadState::default(),
        }
    }

    fn pool(&self) -> Result<PgPool> {
        self.state.ensure_loaded()?;
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TownsError::NotLoaded)
    }

    fn sql(&self, statement: &str) -> Result<String> {
        schema::format(statement, self.settings.as_ref())
    }

    fn connect_options(&self) -> PgConnectOptions {
        let credentials = &self.settings.database.postgres;
        PgConnectOptions::new()
            .host(&credentials.host)
            .port(credentials.port)
            .database(&credentials.database)
            .username(&credentials.username)
            .password(&credentials.password)
            .application_name("towns-server")
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn kind(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    async fn initialize(&self) -> Result<()> {
        self.state.set_loaded(false);
        let statements = load_schema(&PackagedSchemas, self.kind().schema_file(), self.settings.as_ref())?;
        if statements.is_empty() {
            return Err(TownsError::Initialization(
                "No schema statements could be loaded".to_string(),
            ));
        }

        let credentials = &self.settings.database.postgres;
        info!(
            "Connecting to PostgreSQL at {}:{}/{}",
            credentials.host, credentials.port, credentials.database
        );
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.database.pool_size.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(self.connect_options())
            .await
            .map_err(|e| {
                TownsError::Initialization(format!("Failed to connect to PostgreSQL: {}", e))
            })?;

        info!("PostgreSQL connection established, creating tables...");
        for statement in &statements {
            sqlx::query(statement).execute(&pool).await.map_err(|e| {
                TownsError::Initialization(format!("Failed to create database tables: {}", e))
            })?;
        }

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        self.state.set_loaded(true);
        info!("PostgreSQL database initialization complete");
        Ok(())
    }

    // User operations
    async fn get_user(&self, uuid: Uuid) -> Result<Option<SavedUser>> {
        let row: Option<UserRow> = sqlx::query_as(&self.sql(
            r#"
            SELECT uuid, username, preferences FROM %user_data% WHERE uuid = $1
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
            WHERE lower(username) = lower($1)
            "#,
        )?)
        .bind(username)
        .fetch_optional(&self.pool()?)
        .await
        .storage()?;

        row.map(SavedUser::try_from).transpose()
    }

    async fn create_user(&self, user: &User, preferences: &Preferences) -> Result<()> {
        // Primary key violations surface as Conflict through `storage()`
        sqlx::query(&self.sql(
            r#"
            INSERT INTO %user_data% (uuid, username, preferences)
            VALUES ($1, $2, $3)
            "#,
        )?)
        .bind(user.uuid.to_string())
        .bind(&user.username)
        .bind(serde_json::to_string(preferences)?)
        .execute(&self.pool()?)
        .await
        .storage()?;

        debug!("Created user {}", user);
        Ok(())
    }

    async fn update_user(&self, user: &User, preferences: &Preferences) -> Result<()> {
        let result = sqlx::query(&self.sql(
            r#"
            UPDATE %user_data% SET username = $1, preferences = $2 WHERE uuid = $3
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
            SELECT id, name, data FROM %town_data% WHERE id = $1
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

        let id: i32 = sqlx::query_scalar(&self.sql(
            r#"
            INSERT INTO %town_data% (name, data) VALUES ($1, '{}') RETURNING id
            "#,
        )?)
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .storage()
        .map_err(|e| match e {
            TownsError::Conflict(_) => {
                TownsError::Conflict(format!("A town named {} already exists", name))
            }
            other => other,
        })?;

        let town = Town::new(id, name, creator);
        sqlx::query(&self.sql(
            r#"
            UPDATE %town_data% SET data = $1 WHERE id = $2
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
            UPDATE %town_data% SET name = $1, data = $2 WHERE id = $3
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
        sqlx::query(&self.sql("DELETE FROM %town_data% WHERE id = $1")?)
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
            FROM %claim_data% WHERE server_name = $1
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
        let id: i32 = sqlx::query_scalar(&self.sql(
            r#"
            INSERT INTO %claim_data% (server_name, world_uuid, world_name, world_environment, claims)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )?)
        .bind(server)
        .bind(world.uuid.to_string())
        .bind(&world.name)
        .bind(&world.environment)
        .bind(empty_claims()?)
        .fetch_one(&self.pool()?)
        .await
        .storage()
        .map_err(|e| match e {
            TownsError::Conflict(_) => TownsError::Conflict(format!(
                "A claim world already exists for {} on {}",
                world, server
            )),
            other => other,
        })?;

        debug!("Created claim world #{} for {} on {}", id, world, server);
        Ok(ClaimWorld::new(id))
    }

    async fn update_claim_world(&self, claim_world: &ClaimWorld) -> Result<()> {
        let result = sqlx::query(&self.sql(
            r#"
            UPDATE %claim_data% SET claims = $1 WHERE id = $2
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
            info!("PostgreSQL connection pool closed");
        }
    }

    fn has_loaded(&self) -> bool {
        self.state.has_loaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_fail_before_initialize() {
        let db = PostgresDatabase::new(Arc::new(Settings::default()));
        assert_eq!(db.kind(), DatabaseType::Postgresql);
        assert!(!db.has_loaded());
        assert!(matches!(
            db.get_claim_worlds("server").await,
            Err(TownsError::NotLoaded)
        ));
        // Closing an unopened backend is a no-op
        db.close().await;
    }
}
