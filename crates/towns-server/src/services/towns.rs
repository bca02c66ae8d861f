//! Town, user and claim service
//!
//! Reads are served from the in-memory caches only. Writes go to the
//! backend first and update the cache once the backend has accepted them.

use crate::storage::{open_database, CachedMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use towns_core::{
    Cache, CacheStatus, Database, Host, LoadedFlag, LogLevel, Result, Settings, TownsError,
};
use towns_types::{ClaimWorld, Preferences, SavedUser, Town, User, World};
use tracing::{debug, info, warn};

pub struct TownsService {
    settings: Arc<Settings>,
    database: Arc<dyn Database>,
    towns: CachedMap<i32, Town>,
    claim_worlds: CachedMap<World, ClaimWorld>,
    loaded: LoadedFlag,
}

impl TownsService {
    /// Service over the backend selected in `settings`
    pub fn new(settings: Arc<Settings>) -> Self {
        let database = open_database(Arc::clone(&settings));
        Self::with_database(settings, database)
    }

    pub fn with_database(settings: Arc<Settings>, database: Arc<dyn Database>) -> Self {
        Self {
            settings,
            database,
            towns: CachedMap::new("town"),
            claim_worlds: CachedMap::new("claim world"),
            loaded: LoadedFlag::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Initialize the backend and populate both caches.
    ///
    /// Both caches sit in UPDATING for the whole cycle and end LOADED
    /// together, or ERROR together if anything fails.
    pub async fn load(&self) -> Result<()> {
        self.loaded.set(false);
        self.towns.begin_load()?;
        if let Err(e) = self.claim_worlds.begin_load() {
            self.towns.fail_load();
            return Err(e);
        }

        match self.populate().await {
            Ok(()) => {
                self.towns.complete_load()?;
                self.claim_worlds.complete_load()?;
                self.loaded.set(true);
                info!(
                    "Loaded {} towns and {} claim worlds for server {}",
                    self.towns.cache().items_loaded(),
                    self.claim_worlds.cache().items_loaded(),
                    self.settings.server_name
                );
                Ok(())
            }
            Err(e) => {
                self.towns.fail_load();
                self.claim_worlds.fail_load();
                Err(e)
            }
        }
    }

    async fn populate(&self) -> Result<()> {
        info!("Initializing {} database...", self.database.kind());
        self.database.initialize().await?;

        for town in self.database.get_all_towns().await? {
            self.towns.load(town.id, town);
        }
        let worlds = self
            .database
            .get_claim_worlds(&self.settings.server_name)
            .await?;
        for (world, claim_world) in worlds {
            self.claim_worlds.load(world, claim_world);
        }
        Ok(())
    }

    /// Close the backend and run a full [`load`](Self::load) again
    pub async fn reload(&self) -> Result<()> {
        info!("Reloading database and caches");
        self.database.close().await;
        self.load().await
    }

    /// Close the backend; the caches keep their last contents
    pub async fn close(&self) {
        self.loaded.set(false);
        self.database.close().await;
    }

    // Town reads

    pub fn town(&self, town_id: i32) -> Result<Option<Town>> {
        self.towns.get(&town_id)
    }

    /// All towns ordered by id
    pub fn towns(&self) -> Result<Vec<Town>> {
        let mut towns = self.towns.values()?;
        towns.sort_by_key(|t| t.id);
        Ok(towns)
    }

    pub fn town_by_name(&self, name: &str) -> Result<Option<Town>> {
        Ok(self
            .towns
            .find(|_, town| town.name.eq_ignore_ascii_case(name))?
            .map(|(_, town)| town))
    }

    /// The town a user belongs to, if any
    pub fn town_of(&self, user: &User) -> Result<Option<Town>> {
        Ok(self
            .towns
            .find(|_, town| town.is_member(&user.uuid))?
            .map(|(_, town)| town))
    }

    // Town writes

    pub async fn create_town(&self, name: &str, creator: &User) -> Result<Town> {
        if self.town_by_name(name)?.is_some() {
            return Err(TownsError::Conflict(format!(
                "A town named {} already exists",
                name
            )));
        }

        let town = self.database.create_town(name, creator).await?;
        self.towns.insert(town.id, town.clone())?;
        info!("{} founded the town {} (#{})", creator, town.name, town.id);
        Ok(town)
    }

    pub async fn update_town(&self, town: &Town) -> Result<()> {
        self.towns.cache().ensure_loaded()?;
        self.database.update_town(town).await?;
        self.towns.insert(town.id, town.clone())?;
        Ok(())
    }

    pub async fn rename_town(&self, town_id: i32, new_name: &str) -> Result<Town> {
        let mut town = self
            .town(town_id)?
            .ok_or_else(|| TownsError::Missing(format!("town #{}", town_id)))?;
        if let Some(other) = self.town_by_name(new_name)? {
            if other.id != town_id {
                return Err(TownsError::Conflict(format!(
                    "A town named {} already exists",
                    new_name
                )));
            }
        }

        debug!("Renaming town #{} from {} to {}", town_id, town.name, new_name);
        town.name = new_name.to_string();
        self.update_town(&town).await?;
        Ok(town)
    }

    /// Delete a town and release its claims. Returns whether it existed.
    pub async fn delete_town(&self, town_id: i32) -> Result<bool> {
        self.towns.cache().ensure_loaded()?;
        self.claim_worlds.cache().ensure_loaded()?;

        self.database.delete_town(town_id).await?;
        let existed = self.towns.remove(&town_id)?.is_some();

        for (world, mut claim_world) in self.claim_worlds.entries()? {
            let released = claim_world.remove_town_claims(town_id);
            if released == 0 {
                continue;
            }
            self.database.update_claim_world(&claim_world).await?;
            self.claim_worlds.insert(world.clone(), claim_world)?;
            debug!("Released {} claims of town #{} in {}", released, town_id, world);
        }

        if existed {
            info!("Deleted town #{}", town_id);
        }
        Ok(existed)
    }

    // Claim worlds

    pub fn claim_world(&self, world: &World) -> Result<Option<ClaimWorld>> {
        self.claim_worlds.get(world)
    }

    pub fn claim_worlds(&self) -> Result<Vec<(World, ClaimWorld)>> {
        self.claim_worlds.entries()
    }

    /// Register a claim grid for a world on this server. Unclaimable
    /// worlds are stored but never cached.
    pub async fn create_claim_world(&self, world: &World) -> Result<ClaimWorld> {
        self.claim_worlds.cache().ensure_loaded()?;
        let claim_world = self.database.create_claim_world(world).await?;
        if self.settings.is_unclaimable_world(world) {
            debug!("Created claim world for unclaimable world {}", world);
        } else {
            self.claim_worlds.insert(world.clone(), claim_world.clone())?;
        }
        Ok(claim_world)
    }

    pub async fn update_claim_world(&self, world: &World, claim_world: &ClaimWorld) -> Result<()> {
        self.claim_worlds.cache().ensure_loaded()?;
        self.database.update_claim_world(claim_world).await?;
        if !self.settings.is_unclaimable_world(world) {
            self.claim_worlds.insert(world.clone(), claim_world.clone())?;
        }
        Ok(())
    }

    // Users

    /// Record a user joining: create on first join, follow renames after
    pub async fn ensure_user(&self, user: &User) -> Result<SavedUser> {
        match self.database.get_user(user.uuid).await? {
            None => {
                let preferences = Preferences::default();
                self.database.create_user(user, &preferences).await?;
                info!("Created user data for {}", user);
                Ok(SavedUser::new(user.clone(), preferences))
            }
            Some(saved) if saved.user.username != user.username => {
                info!(
                    "Updating username of {} from {}",
                    user, saved.user.username
                );
                self.database.update_user(user, &saved.preferences).await?;
                Ok(SavedUser::new(user.clone(), saved.preferences))
            }
            Some(saved) => Ok(saved),
        }
    }

    pub async fn update_preferences(&self, user: &User, preferences: &Preferences) -> Result<()> {
        self.database.update_user(user, preferences).await
    }

    pub async fn find_user(&self, username: &str) -> Result<Option<SavedUser>> {
        self.database.get_user_by_name(username).await
    }

    /// Snapshot of both caches
    pub fn status(&self) -> Vec<CacheReport> {
        vec![
            CacheReport::of(self.towns.cache()),
            CacheReport::of(self.claim_worlds.cache()),
        ]
    }
}

#[async_trait]
impl Host for TownsService {
    fn run_async(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }

    async fn reload(&self) {
        if let Err(e) = TownsService::reload(self).await {
            self.log(LogLevel::Severe, "Failed to reload towns data", Some(&e));
        }
    }

    fn loaded_flag(&self) -> &LoadedFlag {
        &self.loaded
    }

    fn database(&self) -> Arc<dyn Database> {
        Arc::clone(&self.database)
    }
}

/// Point-in-time view of one cache
#[derive(Debug, Clone)]
pub struct CacheReport {
    pub name: String,
    pub status: CacheStatus,
    pub items_loaded: i64,
    pub initialized_at: DateTime<Utc>,
    pub seconds_since_initialization: u64,
}

impl CacheReport {
    fn of(cache: &Cache) -> Self {
        if cache.items_loaded() < 0 {
            warn!("{} cache reports a negative item count", cache.name());
        }
        Self {
            name: cache.name().to_string(),
            status: cache.status(),
            items_loaded: cache.items_loaded(),
            initialized_at: cache.initialized_at(),
            seconds_since_initialization: cache.time_since_initialization(),
        }
    }
}

impl std::fmt::Display for CacheReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cache: {} ({} items, initialized {}s ago)",
            self.name, self.status, self.items_loaded, self.seconds_since_initialization
        )
    }
}
