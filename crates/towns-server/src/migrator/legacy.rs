//! Importer for the legacy single-file SQLite format
//!
//! Legacy layout (table names are parameters):
//!
//! ```text
//! players(uuid, username, town_id, town_role)
//! towns(id, name, money, founded, greeting_message, farewell_message, bio)
//! claims(town_id, server, world, chunk_x, chunk_z, chunk_type)
//! ```
//!
//! `town_role` 3 marks the mayor. A claim with a NULL `town_id` is an admin
//! claim. `chunk_type` is 0 (claim), 1 (farm) or 2 (plot).

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use towns_core::{Database, Migrator, MigratorState, Settings, TownsError};
use towns_types::{roles, Chunk, Claim, ClaimType, ClaimWorld, Preferences, User, World};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const FILE: &str = "FILE";
pub const USERS_TABLE: &str = "USERS_TABLE";
pub const TOWNS_TABLE: &str = "TOWNS_TABLE";
pub const CLAIMS_TABLE: &str = "CLAIMS_TABLE";
/// Server whose legacy claims are imported into this server's claim worlds
pub const SERVER: &str = "SERVER";

pub struct LegacyMigrator {
    state: MigratorState,
    settings: Arc<Settings>,
}

impl LegacyMigrator {
    pub fn new(settings: Arc<Settings>) -> Self {
        let state = MigratorState::new("Legacy");
        state.set_parameter(FILE, "legacy.db");
        state.set_parameter(USERS_TABLE, "legacy_players");
        state.set_parameter(TOWNS_TABLE, "legacy_towns");
        state.set_parameter(CLAIMS_TABLE, "legacy_claims");
        state.set_parameter(SERVER, settings.server_name.clone());
        Self { state, settings }
    }

    fn table(&self, key: &str) -> anyhow::Result<String> {
        let name = self
            .parameter(key)
            .with_context(|| format!("Missing parameter {}", key))?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("Invalid table name for {}: {:?}", key, name);
        }
        Ok(name)
    }

    async fn read_legacy(&self) -> anyhow::Result<LegacyData> {
        let file = self.parameter(FILE).context("Missing parameter FILE")?;
        if !Path::new(&file).is_file() {
            bail!("Legacy database {} does not exist", file);
        }

        info!("Reading legacy data from {}", file);
        let options = SqliteConnectOptions::new().filename(&file).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open legacy database {}", file))?;

        let data = self.read_tables(&pool).await;
        pool.close().await;
        data
    }

    async fn read_tables(&self, pool: &SqlitePool) -> anyhow::Result<LegacyData> {
        let sql = format!(
            "SELECT uuid, username, town_id, town_role FROM {}",
            self.table(USERS_TABLE)?
        );
        let player_rows: Vec<PlayerRow> = sqlx::query_as(&sql)
            .fetch_all(pool)
            .await
            .context("Failed to read legacy players")?;

        let sql = format!(
            "SELECT id, name, money, founded, greeting_message, farewell_message, bio FROM {} ORDER BY id",
            self.table(TOWNS_TABLE)?
        );
        let towns: Vec<TownRow> = sqlx::query_as(&sql)
            .fetch_all(pool)
            .await
            .context("Failed to read legacy towns")?;

        let sql = format!(
            "SELECT town_id, server, world, chunk_x, chunk_z, chunk_type FROM {}",
            self.table(CLAIMS_TABLE)?
        );
        let claims: Vec<ClaimRow> = sqlx::query_as(&sql)
            .fetch_all(pool)
            .await
            .context("Failed to read legacy claims")?;

        let mut players = Vec::with_capacity(player_rows.len());
        for row in player_rows {
            match Uuid::parse_str(row.uuid.trim()) {
                Ok(uuid) => players.push(LegacyPlayer {
                    user: User::new(uuid, row.username),
                    town_id: row.town_id,
                    role: row.town_role,
                }),
                Err(_) => warn!("Skipping legacy player {} with invalid uuid {}", row.username, row.uuid),
            }
        }

        Ok(LegacyData {
            players,
            towns,
            claims,
        })
    }

    async fn import_users(
        &self,
        database: &dyn Database,
        players: &[LegacyPlayer],
    ) -> anyhow::Result<usize> {
        let mut imported = 0;
        for player in players {
            match database.create_user(&player.user, &Preferences::default()).await {
                Ok(()) => imported += 1,
                Err(TownsError::Conflict(_)) => {
                    warn!("Skipping duplicate legacy player {}", player.user)
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to import {}", player.user)),
            }
        }
        Ok(imported)
    }

    /// Returns legacy town id -> new town id
    async fn import_towns(
        &self,
        database: &dyn Database,
        data: &LegacyData,
    ) -> anyhow::Result<HashMap<i64, i32>> {
        let mut town_ids = HashMap::with_capacity(data.towns.len());
        for legacy in &data.towns {
            let members: Vec<&LegacyPlayer> = data
                .players
                .iter()
                .filter(|p| p.town_id == Some(legacy.id))
                .collect();
            let Some(mayor) = members.iter().find(|p| p.role == Some(i64::from(roles::MAYOR)))
            else {
                warn!("Skipping legacy town {} which has no mayor", legacy.name);
                continue;
            };

            let mut town = match database.create_town(&legacy.name, &mayor.user).await {
                Ok(town) => town,
                Err(TownsError::Conflict(_)) => {
                    warn!("Skipping duplicate legacy town {}", legacy.name);
                    continue;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to import town {}", legacy.name))
                }
            };

            for member in &members {
                if member.user.uuid == town.mayor {
                    continue;
                }
                let role = match member.role {
                    Some(role) if role >= i64::from(roles::TRUSTED) => roles::TRUSTED,
                    _ => roles::RESIDENT,
                };
                town.add_member(member.user.uuid, role);
            }
            town.money = legacy.money;
            town.greeting = legacy.greeting_message.clone();
            town.farewell = legacy.farewell_message.clone();
            town.bio = legacy.bio.clone();
            if let Some(founded) = legacy.founded.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)) {
                town.founded = founded;
            }
            database.update_town(&town).await?;

            debug!("Imported legacy town {} as #{}", legacy.name, town.id);
            town_ids.insert(legacy.id, town.id);
        }
        Ok(town_ids)
    }

    async fn import_claims(
        &self,
        database: &dyn Database,
        claims: &[ClaimRow],
        town_ids: &HashMap<i64, i32>,
    ) -> anyhow::Result<usize> {
        let source = self.parameter(SERVER).unwrap_or_default();
        let local = self.settings.server_name.as_str();

        let mut by_world: BTreeMap<&str, Vec<&ClaimRow>> = BTreeMap::new();
        for claim in claims.iter().filter(|c| c.server == source) {
            by_world.entry(claim.world.as_str()).or_default().push(claim);
        }

        // Every town was wiped, so town claims on all servers are stale
        let mut existing: HashMap<String, (World, ClaimWorld)> = HashMap::new();
        for (key, mut claim_world) in database.get_all_claim_worlds().await? {
            let had_town_claims = !claim_world.claims.is_empty();
            claim_world.claims.clear();
            if key.server == local {
                existing.insert(key.world.name.clone(), (key.world, claim_world));
            } else if had_town_claims {
                database.update_claim_world(&claim_world).await?;
                debug!("Released stale town claims in {}", key);
            }
        }

        let mut imported = 0;
        for (world_name, world_claims) in by_world {
            let (world, mut claim_world) = match existing.remove(world_name) {
                Some(entry) => entry,
                None => {
                    let world = legacy_world(local, world_name);
                    if self.settings.is_unclaimable_world(&world) {
                        warn!(
                            "Skipping {} legacy claims in unclaimable world {}",
                            world_claims.len(),
                            world_name
                        );
                        continue;
                    }
                    let claim_world = database.create_claim_world(&world).await?;
                    (world, claim_world)
                }
            };

            for row in world_claims {
                let (Ok(x), Ok(z)) = (i32::try_from(row.chunk_x), i32::try_from(row.chunk_z)) else {
                    warn!(
                        "Skipping claim at ({}, {}) in {} with out-of-range coordinates",
                        row.chunk_x, row.chunk_z, world_name
                    );
                    continue;
                };
                let claim = Claim::new(Chunk::at(x, z), claim_type(row.chunk_type));
                let added = match row.town_id {
                    None => claim_world.add_admin_claim(claim),
                    Some(legacy_id) => match town_ids.get(&legacy_id) {
                        Some(town_id) => claim_world.add_claim(*town_id, claim),
                        None => {
                            warn!(
                                "Skipping claim at ({}, {}) in {} owned by unknown town {}",
                                row.chunk_x, row.chunk_z, world_name, legacy_id
                            );
                            continue;
                        }
                    },
                };
                match added {
                    Ok(()) => imported += 1,
                    Err(e) => warn!("Skipping legacy claim in {}: {}", world_name, e),
                }
            }

            database.update_claim_world(&claim_world).await?;
            debug!("Imported claims for {}", world);
        }

        for (_, claim_world) in existing.values() {
            database.update_claim_world(claim_world).await?;
        }
        Ok(imported)
    }
}

#[async_trait]
impl Migrator for LegacyMigrator {
    fn state(&self) -> &MigratorState {
        &self.state
    }

    async fn on_start(&self, database: &dyn Database) -> anyhow::Result<()> {
        let data = self.read_legacy().await?;
        info!(
            "Found {} players, {} towns and {} claims to import",
            data.players.len(),
            data.towns.len(),
            data.claims.len()
        );

        database.delete_all_towns().await.context("Failed to wipe towns")?;
        database.delete_all_users().await.context("Failed to wipe users")?;

        let users = self.import_users(database, &data.players).await?;
        let town_ids = self.import_towns(database, &data).await?;
        let claims = self.import_claims(database, &data.claims, &town_ids).await?;

        info!(
            "Imported {} users, {} towns and {} claims",
            users,
            town_ids.len(),
            claims
        );
        Ok(())
    }
}

struct LegacyData {
    players: Vec<LegacyPlayer>,
    towns: Vec<TownRow>,
    claims: Vec<ClaimRow>,
}

struct LegacyPlayer {
    user: User,
    town_id: Option<i64>,
    role: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct PlayerRow {
    uuid: String,
    username: String,
    town_id: Option<i64>,
    town_role: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct TownRow {
    id: i64,
    name: String,
    money: f64,
    founded: Option<i64>,
    greeting_message: Option<String>,
    farewell_message: Option<String>,
    bio: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    town_id: Option<i64>,
    server: String,
    world: String,
    chunk_x: i64,
    chunk_z: i64,
    chunk_type: i64,
}

fn claim_type(raw: i64) -> ClaimType {
    match raw {
        1 => ClaimType::Farm,
        2 => ClaimType::Plot,
        0 => ClaimType::Claim,
        other => {
            warn!("Unknown legacy chunk type {}, importing as a claim", other);
            ClaimType::Claim
        }
    }
}

/// Legacy claims only record the world name; derive a stable identity
fn legacy_world(server: &str, name: &str) -> World {
    let environment = if name.ends_with("_nether") {
        "nether"
    } else if name.ends_with("_the_end") {
        "the_end"
    } else {
        "normal"
    };
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}/{}", server, name).as_bytes());
    World::new(uuid, name, environment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::TownsService;
    use std::sync::Mutex;
    use towns_core::{start_migration, CommandUser, Host};

    #[derive(Default)]
    struct Inbox(Mutex<Vec<String>>);

    impl CommandUser for Inbox {
        fn send_message(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        legacy_file: String,
        service: Arc<TownsService>,
        alice: Uuid,
        bob: Uuid,
    }

    async fn write_legacy_database(path: &Path, alice: Uuid, bob: Uuid) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        for statement in [
            "CREATE TABLE legacy_players (uuid TEXT, username TEXT, town_id INTEGER, town_role INTEGER)",
            "CREATE TABLE legacy_towns (id INTEGER, name TEXT, money REAL, founded INTEGER, greeting_message TEXT, farewell_message TEXT, bio TEXT)",
            "CREATE TABLE legacy_claims (town_id INTEGER, server TEXT, world TEXT, chunk_x INTEGER, chunk_z INTEGER, chunk_type INTEGER)",
            "INSERT INTO legacy_towns VALUES (1, 'Riverside', 125.5, 1600000000, 'Welcome', NULL, 'On the river')",
            "INSERT INTO legacy_towns VALUES (2, 'Hilltop', 0.5, NULL, NULL, NULL, NULL)",
            "INSERT INTO legacy_towns VALUES (3, 'Ghost', 0.5, NULL, NULL, NULL, NULL)",
            "INSERT INTO legacy_claims VALUES (1, 'server', 'world', 0, 0, 0)",
            "INSERT INTO legacy_claims VALUES (1, 'server', 'world', 0, 1, 1)",
            "INSERT INTO legacy_claims VALUES (2, 'server', 'world', 5, 5, 2)",
            "INSERT INTO legacy_claims VALUES (NULL, 'server', 'world', 10, 10, 0)",
            "INSERT INTO legacy_claims VALUES (1, 'server', 'world', 0, 0, 0)",
            "INSERT INTO legacy_claims VALUES (3, 'server', 'world', 7, 7, 0)",
            "INSERT INTO legacy_claims VALUES (1, 'server', 'world_nether', 1, 1, 0)",
            "INSERT INTO legacy_claims VALUES (2, 'other', 'world', 3, 3, 0)",
            "INSERT INTO legacy_claims VALUES (2, 'server', 'world', 3000000000, 0, 0)",
        ] {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }

        let carol = Uuid::new_v4();
        for (uuid, name, town, role) in [
            (alice, "Alice", Some(1), Some(3)),
            (bob, "Bob", Some(1), Some(1)),
            (carol, "Carol", Some(2), Some(3)),
            (Uuid::new_v4(), "Dave", None, None),
        ] {
            sqlx::query("INSERT INTO legacy_players VALUES (?1, ?2, ?3, ?4)")
                .bind(uuid.to_string())
                .bind(name)
                .bind(town)
                .bind(role)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let legacy_path = dir.path().join("legacy.db");
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        write_legacy_database(&legacy_path, alice, bob).await;

        let mut settings = Settings::default();
        settings.database.sqlite_file = dir.path().join("towns.db").to_string_lossy().to_string();
        let service = Arc::new(TownsService::new(Arc::new(settings)));
        service.load().await.unwrap();

        Fixture {
            legacy_file: legacy_path.to_string_lossy().to_string(),
            _dir: dir,
            service,
            alice,
            bob,
        }
    }

    #[tokio::test]
    async fn test_legacy_import_replaces_existing_data() {
        let fx = fixture().await;
        let old = User::new(Uuid::new_v4(), "Old");
        fx.service.ensure_user(&old).await.unwrap();
        fx.service.create_town("Stale", &old).await.unwrap();

        let migrator = Arc::new(LegacyMigrator::new(Arc::new(fx.service.settings().clone())));
        migrator.set_parameter("file", &fx.legacy_file);
        let inbox = Arc::new(Inbox::default());

        let outcome = start_migration(migrator, inbox.clone(), fx.service.clone())
            .wait()
            .await;
        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(inbox.0.lock().unwrap().len(), 2);

        // The host reloaded from the migrated store
        assert!(fx.service.is_loaded());
        let towns = fx.service.towns().unwrap();
        let names: Vec<_> = towns.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Riverside", "Hilltop"]);

        let riverside = fx.service.town_by_name("riverside").unwrap().unwrap();
        assert_eq!(riverside.mayor, fx.alice);
        assert_eq!(riverside.members.get(&fx.bob), Some(&roles::RESIDENT));
        assert_eq!(riverside.money, 125.5);
        assert_eq!(riverside.greeting.as_deref(), Some("Welcome"));
        assert_eq!(riverside.founded.timestamp(), 1_600_000_000);

        assert!(fx.service.find_user("Old").await.unwrap().is_none());
        assert!(fx.service.find_user("dave").await.unwrap().is_some());

        let worlds = fx.service.claim_worlds().unwrap();
        assert_eq!(worlds.len(), 1);
        let (world, claims) = &worlds[0];
        assert_eq!(world.name, "world");
        // Duplicate, unmapped and out-of-range rows are skipped
        assert_eq!(claims.claim_count(), 4);
        assert_eq!(claims.claims.get(&riverside.id).map(Vec::len), Some(2));
        assert_eq!(claims.admin_claims.len(), 1);
    }

    #[tokio::test]
    async fn test_import_releases_town_claims_of_other_servers() {
        let fx = fixture().await;
        let mut beta_settings = fx.service.settings().clone();
        beta_settings.server_name = "beta".to_string();
        let beta = TownsService::new(Arc::new(beta_settings));
        beta.load().await.unwrap();

        let mayor = User::new(Uuid::new_v4(), "Bea");
        let town = beta.create_town("BetaTown", &mayor).await.unwrap();
        let world = World::new(Uuid::new_v4(), "world", "normal");
        let mut claims = beta.create_claim_world(&world).await.unwrap();
        claims
            .add_claim(town.id, Claim::new(Chunk::at(4, 4), ClaimType::Claim))
            .unwrap();
        claims
            .add_admin_claim(Claim::new(Chunk::at(9, 9), ClaimType::Claim))
            .unwrap();
        beta.update_claim_world(&world, &claims).await.unwrap();

        let migrator = Arc::new(LegacyMigrator::new(Arc::new(fx.service.settings().clone())));
        migrator.set_parameter("FILE", &fx.legacy_file);
        let outcome = start_migration(migrator, Arc::new(Inbox::default()), fx.service.clone())
            .wait()
            .await;
        assert!(outcome.is_success(), "{:?}", outcome);

        let database = beta.database();
        assert!(database.get_town(town.id).await.unwrap().is_none());
        let beta_worlds = database.get_claim_worlds("beta").await.unwrap();
        let stored = beta_worlds.get(&world).unwrap();
        assert!(stored.claims.is_empty());
        assert_eq!(stored.admin_claims.len(), 1);
        beta.close().await;
    }

    #[tokio::test]
    async fn test_missing_legacy_file_fails_and_reloads() {
        let fx = fixture().await;
        let migrator = Arc::new(LegacyMigrator::new(Arc::new(fx.service.settings().clone())));
        migrator.set_parameter("FILE", "/nonexistent/legacy.db");
        let inbox = Arc::new(Inbox::default());

        let outcome = start_migration(migrator, inbox.clone(), fx.service.clone())
            .wait()
            .await;
        assert!(!outcome.is_success());

        let messages = inbox.0.lock().unwrap().clone();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].starts_with("[Legacy Migrator] Migration failed after"));
        assert!(messages[1].contains("does not exist"));
        assert!(fx.service.is_loaded());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_table_names() {
        let fx = fixture().await;
        let migrator = LegacyMigrator::new(Arc::new(fx.service.settings().clone()));
        migrator.set_parameter("FILE", &fx.legacy_file);
        migrator.set_parameter("towns_table", "towns; DROP TABLE x");

        let err = migrator
            .on_start(fx.service.database().as_ref())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid table name for TOWNS_TABLE"));
    }

    #[test]
    fn test_legacy_world_identity_is_stable() {
        let a = legacy_world("server", "world_nether");
        let b = legacy_world("server", "world_nether");
        assert_eq!(a, b);
        assert_eq!(a.environment, "nether");
        assert_ne!(a.uuid, legacy_world("other", "world_nether").uuid);
    }
}
