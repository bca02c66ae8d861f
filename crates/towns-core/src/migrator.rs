//! One-shot data migrations
//!
//! A [`Migrator`] imports data from an external source by writing straight
//! into the storage backend. [`start_migration`] runs it in the background
//! and reports start, success or failure to whoever invoked it. It always
//! finishes with a full host reload, even when the import fails or panics.

use crate::database::Database;
use crate::error::TownsError;
use crate::host::{Host, LogLevel};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::info;

/// Someone who can receive migration status messages
pub trait CommandUser: Send + Sync {
    fn send_message(&self, message: &str);
}

/// Console actor: messages go to the log
pub struct ConsoleUser;

impl CommandUser for ConsoleUser {
    fn send_message(&self, message: &str) {
        info!("{}", message);
    }
}

/// Name, parameters and start time shared by every migrator
#[derive(Debug)]
pub struct MigratorState {
    name: String,
    parameters: RwLock<BTreeMap<String, String>>,
    started_at: RwLock<Instant>,
}

impl MigratorState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: RwLock::new(BTreeMap::new()),
            started_at: RwLock::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys are stored upper-cased
    pub fn set_parameter(&self, key: &str, value: impl Into<String>) {
        self.parameters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_uppercase(), value.into());
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        self.parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.to_uppercase())
            .cloned()
    }

    /// Snapshot of all parameters, ordered by key
    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.parameters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn mark_started(&self) {
        *self.started_at.write().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last `start_migration` call
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

#[async_trait]
pub trait Migrator: Send + Sync + 'static {
    fn state(&self) -> &MigratorState;

    /// Import everything, writing through `database`
    async fn on_start(&self, database: &dyn Database) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        self.state().name()
    }

    fn set_parameter(&self, key: &str, value: &str) {
        self.state().set_parameter(key, value);
    }

    fn parameter(&self, key: &str) -> Option<String> {
        self.state().parameter(key)
    }
}

/// How a migration run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Succeeded { elapsed_secs: u64 },
    Failed { elapsed_secs: u64, message: String },
}

impl MigrationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MigrationOutcome::Succeeded { .. })
    }

    pub fn into_result(self, name: &str) -> crate::error::Result<u64> {
        match self {
            MigrationOutcome::Succeeded { elapsed_secs } => Ok(elapsed_secs),
            MigrationOutcome::Failed { message, .. } => Err(TownsError::Migration {
                name: name.to_string(),
                message,
            }),
        }
    }
}

/// Completion channel for a started migration
pub struct MigrationHandle {
    receiver: oneshot::Receiver<MigrationOutcome>,
}

impl MigrationHandle {
    /// Wait until the migration has finished and the host has reloaded
    pub async fn wait(self) -> MigrationOutcome {
        self.receiver
            .await
            .unwrap_or_else(|_| MigrationOutcome::Failed {
                elapsed_secs: 0,
                message: "migration task was dropped before completing".to_string(),
            })
    }
}

pub fn started_message(name: &str) -> String {
    format!("[{} Migrator] Data migration has started", name)
}

pub fn finished_message(name: &str, elapsed_secs: u64) -> String {
    format!(
        "[{} Migrator] Finished data migration in {}s. A server restart is recommended.",
        name, elapsed_secs
    )
}

pub fn failed_message(name: &str, elapsed_secs: u64, reason: &str) -> String {
    format!(
        "[{} Migrator] Migration failed after {}s due to an exception ({})",
        name, elapsed_secs, reason
    )
}

/// Start `migrator` in the background on `host`.
///
/// The run marks the host as not loaded, tells `executor` it has begun,
/// runs the import, reports the outcome with the elapsed time, and then
/// reloads the host. Errors and panics from the import are reported and
/// logged, never propagated.
pub fn start_migration(
    migrator: Arc<dyn Migrator>,
    executor: Arc<dyn CommandUser>,
    host: Arc<dyn Host>,
) -> MigrationHandle {
    migrator.state().mark_started();
    let (sender, receiver) = oneshot::channel();
    let task_host = Arc::clone(&host);

    host.run_async(Box::pin(async move {
        let host = task_host;
        let name = migrator.name().to_string();
        host.set_loaded(false);
        executor.send_message(&started_message(&name));

        let database = host.database();
        let result = AssertUnwindSafe(migrator.on_start(database.as_ref()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic.as_ref()))));

        let elapsed_secs = migrator.state().elapsed().as_secs();
        let outcome = match result {
            Ok(()) => {
                executor.send_message(&finished_message(&name, elapsed_secs));
                MigrationOutcome::Succeeded { elapsed_secs }
            }
            Err(err) => {
                let message = err.to_string();
                executor.send_message(&failed_message(&name, elapsed_secs, &message));
                let cause: &(dyn std::error::Error + 'static) = err.as_ref();
                host.log(
                    LogLevel::Severe,
                    &format!(
                        "Exception during {} migration; aborted: {}",
                        name,
                        err.root_cause()
                    ),
                    Some(cause),
                );
                MigrationOutcome::Failed {
                    elapsed_secs,
                    message,
                }
            }
        };

        host.reload().await;
        let _ = sender.send(outcome);
    }));

    MigrationHandle { receiver }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseType, LoadState};
    use crate::error::Result;
    use crate::host::LoadedFlag;
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use towns_types::{ClaimWorld, Preferences, SavedUser, ServerWorld, Town, User, World};
    use uuid::Uuid;

    /// Backend double that only records user creation
    #[derive(Default)]
    struct RecordingDatabase {
        state: LoadState,
        users: Mutex<Vec<User>>,
    }

    #[async_trait]
    impl Database for RecordingDatabase {
        fn kind(&self) -> DatabaseType {
            DatabaseType::Sqlite
        }
        async fn initialize(&self) -> Result<()> {
            self.state.set_loaded(true);
            Ok(())
        }
        async fn get_user(&self, _uuid: Uuid) -> Result<Option<SavedUser>> {
            Ok(None)
        }
        async fn get_user_by_name(&self, _username: &str) -> Result<Option<SavedUser>> {
            Ok(None)
        }
        async fn create_user(&self, user: &User, _preferences: &Preferences) -> Result<()> {
            self.users.lock().unwrap().push(user.clone());
            Ok(())
        }
        async fn update_user(&self, _user: &User, _preferences: &Preferences) -> Result<()> {
            Ok(())
        }
        async fn delete_all_users(&self) -> Result<()> {
            Ok(())
        }
        async fn get_town(&self, _town_id: i32) -> Result<Option<Town>> {
            Ok(None)
        }
        async fn get_all_towns(&self) -> Result<Vec<Town>> {
            Ok(Vec::new())
        }
        async fn create_town(&self, name: &str, creator: &User) -> Result<Town> {
            Ok(Town::new(1, name, creator))
        }
        async fn update_town(&self, _town: &Town) -> Result<()> {
            Ok(())
        }
        async fn delete_town(&self, _town_id: i32) -> Result<()> {
            Ok(())
        }
        async fn delete_all_towns(&self) -> Result<()> {
            Ok(())
        }
        async fn get_claim_worlds(&self, _server: &str) -> Result<HashMap<World, ClaimWorld>> {
            Ok(HashMap::new())
        }
        async fn get_all_claim_worlds(&self) -> Result<HashMap<ServerWorld, ClaimWorld>> {
            Ok(HashMap::new())
        }
        async fn create_claim_world(&self, _world: &World) -> Result<ClaimWorld> {
            Ok(ClaimWorld::new(1))
        }
        async fn update_claim_world(&self, _claim_world: &ClaimWorld) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
        fn has_loaded(&self) -> bool {
            self.state.has_loaded()
        }
    }

    struct TestHost {
        flag: LoadedFlag,
        database: Arc<RecordingDatabase>,
        reloads: AtomicUsize,
        loaded_during_reload: Mutex<Option<bool>>,
    }

    impl TestHost {
        fn new() -> Self {
            let flag = LoadedFlag::new();
            flag.set(true);
            Self {
                flag,
                database: Arc::new(RecordingDatabase::default()),
                reloads: AtomicUsize::new(0),
                loaded_during_reload: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Host for TestHost {
        fn run_async(&self, task: BoxFuture<'static, ()>) {
            tokio::spawn(task);
        }
        async fn reload(&self) {
            *self.loaded_during_reload.lock().unwrap() = Some(self.flag.get());
            self.reloads.fetch_add(1, Ordering::SeqCst);
            self.flag.set(true);
        }
        fn loaded_flag(&self) -> &LoadedFlag {
            &self.flag
        }
        fn database(&self) -> Arc<dyn Database> {
            self.database.clone()
        }
    }

    #[derive(Default)]
    struct Inbox(Mutex<Vec<String>>);

    impl CommandUser for Inbox {
        fn send_message(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    impl Inbox {
        fn messages(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    enum Behaviour {
        Succeed,
        FailAfterUsers,
        Panic,
    }

    struct ScriptedMigrator {
        state: MigratorState,
        behaviour: Behaviour,
    }

    impl ScriptedMigrator {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                state: MigratorState::new("Scripted"),
                behaviour,
            }
        }
    }

    #[async_trait]
    impl Migrator for ScriptedMigrator {
        fn state(&self) -> &MigratorState {
            &self.state
        }

        async fn on_start(&self, database: &dyn Database) -> anyhow::Result<()> {
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::FailAfterUsers => {
                    for name in ["a", "b", "c"] {
                        let user = User::new(Uuid::new_v4(), name);
                        database.create_user(&user, &Preferences::default()).await?;
                    }
                    anyhow::bail!("legacy table is corrupt")
                }
                Behaviour::Panic => panic!("import exploded"),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_migration_reports_once_and_reloads() {
        let host = Arc::new(TestHost::new());
        let inbox = Arc::new(Inbox::default());
        let migrator = Arc::new(ScriptedMigrator::new(Behaviour::FailAfterUsers));

        let outcome = start_migration(migrator, inbox.clone(), host.clone())
            .wait()
            .await;

        assert!(!outcome.is_success());
        assert_eq!(host.database.users.lock().unwrap().len(), 3);
        assert_eq!(host.reloads.load(Ordering::SeqCst), 1);
        // The host was marked not-loaded while the import ran
        assert_eq!(*host.loaded_during_reload.lock().unwrap(), Some(false));

        let messages = inbox.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "[Scripted Migrator] Data migration has started");
        assert!(messages[1].starts_with("[Scripted Migrator] Migration failed after 0s"));
        assert!(messages[1].contains("(legacy table is corrupt)"));
        assert!(!messages.iter().any(|m| m.contains("Finished")));
    }

    #[tokio::test]
    async fn test_successful_migration_recommends_restart() {
        let host = Arc::new(TestHost::new());
        let inbox = Arc::new(Inbox::default());
        let migrator = Arc::new(ScriptedMigrator::new(Behaviour::Succeed));

        let outcome = start_migration(migrator, inbox.clone(), host.clone())
            .wait()
            .await;

        assert_eq!(outcome, MigrationOutcome::Succeeded { elapsed_secs: 0 });
        assert_eq!(
            inbox.messages()[1],
            "[Scripted Migrator] Finished data migration in 0s. A server restart is recommended."
        );
        assert_eq!(host.reloads.load(Ordering::SeqCst), 1);
        assert!(host.is_loaded());
    }

    #[tokio::test]
    async fn test_panicking_migration_is_contained() {
        let host = Arc::new(TestHost::new());
        let inbox = Arc::new(Inbox::default());
        let migrator = Arc::new(ScriptedMigrator::new(Behaviour::Panic));

        let outcome = start_migration(migrator, inbox.clone(), host.clone())
            .wait()
            .await;

        match outcome.clone() {
            MigrationOutcome::Failed { message, .. } => assert!(message.contains("import exploded")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            outcome.into_result("Scripted"),
            Err(TownsError::Migration { .. })
        ));
        assert_eq!(host.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(inbox.messages().len(), 2);
    }

    #[test]
    fn test_parameters_are_case_insensitive() {
        let migrator = ScriptedMigrator::new(Behaviour::Succeed);
        migrator.set_parameter("host", "x");
        assert_eq!(migrator.parameter("HOST"), Some("x".to_string()));
        assert_eq!(migrator.parameter("Host"), Some("x".to_string()));
        assert_eq!(migrator.parameter("port"), None);

        migrator.set_parameter("b", "2");
        migrator.set_parameter("A", "1");
        let keys: Vec<_> = migrator.state().parameters().into_keys().collect();
        assert_eq!(keys, vec!["A", "B", "HOST"]);
    }
}
