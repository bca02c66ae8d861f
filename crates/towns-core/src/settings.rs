//! Settings for the towns service

use crate::database::DatabaseType;
use crate::error::Result;
use crate::schema::{Table, TableNames};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use towns_types::World;

/// Default settings file name
pub const CONFIG_FILE_NAME: &str = "towns.yaml";

/// Prefix for environment overrides, e.g. `TOWNS_DATABASE__TYPE=postgresql`
pub const ENV_PREFIX: &str = "TOWNS";

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name of this server within a multi-server deployment
    pub server_name: String,
    pub database: DatabaseSettings,
    /// Physical table name overrides, keyed by logical table (`user_data`, ...)
    pub table_names: HashMap<String, String>,
    /// Worlds where land can't be claimed
    pub unclaimable_worlds: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_name: "server".to_string(),
            database: DatabaseSettings::default(),
            table_names: Table::all()
                .iter()
                .map(|t| (t.as_str().to_string(), t.default_name().to_string()))
                .collect(),
            unclaimable_worlds: vec![
                "world_nether".to_string(),
                "world_the_end".to_string(),
            ],
        }
    }
}

impl Settings {
    /// Configured physical name for a logical table
    pub fn table_name(&self, table: Table) -> &str {
        self.table_names
            .get(table.as_str())
            .map(String::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(table.default_name())
    }

    pub fn is_unclaimable_world(&self, world: &World) -> bool {
        self.unclaimable_worlds
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&world.name))
    }
}

impl TableNames for Settings {
    fn table_name(&self, table: Table) -> &str {
        Settings::table_name(self, table)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    #[serde(rename = "type")]
    pub kind: DatabaseType,
    /// SQLite file path, or `:memory:`
    pub sqlite_file: String,
    pub postgres: PostgresCredentials,
    pub pool_size: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            kind: DatabaseType::Sqlite,
            sqlite_file: "data/towns.db".to_string(),
            postgres: PostgresCredentials::default(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresCredentials {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for PostgresCredentials {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "towns".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
        }
    }
}

/// Loads and saves [`Settings`]
pub struct ConfigManager;

impl ConfigManager {
    /// Load settings from an optional YAML file layered under `TOWNS_*`
    /// environment variables. A missing file falls back to defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Settings> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("unclaimable_worlds")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }

    /// Write settings as YAML, creating parent directories
    pub fn save(settings: &Settings, config_path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(settings)?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_table_name_override_and_default() {
        let mut settings = Settings::default();
        assert_eq!(settings.table_name(Table::TownData), "towns_town_data");

        settings
            .table_names
            .insert("town_data".to_string(), "legacy_towns".to_string());
        settings.table_names.remove("claim_data");
        assert_eq!(settings.table_name(Table::TownData), "legacy_towns");
        assert_eq!(settings.table_name(Table::ClaimData), "towns_claim_worlds");
    }

    #[test]
    fn test_unclaimable_world_matches_name() {
        let settings = Settings::default();
        let nether = World::new(Uuid::new_v4(), "World_Nether", "nether");
        let overworld = World::new(Uuid::new_v4(), "world", "normal");
        assert!(settings.is_unclaimable_world(&nether));
        assert!(!settings.is_unclaimable_world(&overworld));
    }

    #[test]
    fn test_save_then_load_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut settings = Settings::default();
        settings.server_name = "survival".to_string();
        settings.database.kind = DatabaseType::Postgresql;
        settings.unclaimable_worlds = vec!["spawn".to_string()];
        ConfigManager::save(&settings, &path)?;

        let loaded = ConfigManager::load(Some(&path))?;
        assert_eq!(loaded.server_name, "survival");
        assert_eq!(loaded.database.kind, DatabaseType::Postgresql);
        assert_eq!(loaded.unclaimable_worlds, vec!["spawn".to_string()]);
        assert_eq!(loaded.table_name(Table::UserData), "towns_users");
        Ok(())
    }

    #[test]
    fn test_missing_file_uses_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let loaded = ConfigManager::load(Some(&dir.path().join("absent.yaml")))?;
        assert_eq!(loaded.database.kind, DatabaseType::Sqlite);
        assert_eq!(loaded.database.pool_size, 10);
        Ok(())
    }
}
