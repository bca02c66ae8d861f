//! Towns Server
//!
//! Hosts the towns persistence core: opens the configured database, keeps
//! the town and claim caches loaded, and runs one-shot data migrations.

mod migrator;
mod services;
mod storage;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use towns_core::{
    start_migration, ConfigManager, ConsoleUser, Migrator, Settings, CONFIG_FILE_NAME,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use services::TownsService;

#[derive(Parser)]
#[command(name = "towns-server")]
#[command(author, version, about = "Towns persistence and cache host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Settings file (YAML)
    #[arg(short, long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the database and caches, then serve until interrupted
    Run,
    /// Import data with a migrator
    Migrate {
        /// Migrator name (e.g. legacy)
        name: String,
        /// Migrator parameter, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_parameter)]
        params: Vec<(String, String)>,
    },
    /// Write the default settings file
    #[command(name = "init-config")]
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn parse_parameter(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))
}

#[tokio::main]
async fn main() {
    // Panics inside migrations are reported by the migrator; anything else lands here
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        eprintln!("towns-server panicked at {}: {}", location, payload);
        error!(%location, "towns-server panicked: {}", payload);
    }));

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("[FATAL] Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(&cli.config).await,
        Commands::Migrate { name, params } => run_migration(&cli.config, &name, params).await,
        Commands::InitConfig { force } => init_config(&cli.config, force),
    };

    if let Err(e) = result {
        error!("Towns server failed: {:#}", e);
        std::process::exit(1);
    }
}

fn load_settings(path: &Path) -> Result<Arc<Settings>> {
    info!("Loading configuration from {}...", path.display());
    if !path.exists() {
        warn!("{} not found, using defaults and environment", path.display());
    }
    let settings = ConfigManager::load(Some(path)).context("Failed to load configuration")?;
    info!(
        "Config loaded: server={}, database={}",
        settings.server_name, settings.database.kind
    );
    Ok(Arc::new(settings))
}

async fn boot(path: &Path) -> Result<Arc<TownsService>> {
    let settings = load_settings(path)?;
    let service = Arc::new(TownsService::new(settings));
    service
        .load()
        .await
        .context("Failed to load towns data")?;
    for report in service.status() {
        info!("{}", report);
    }
    Ok(service)
}

async fn run_server(path: &Path) -> Result<()> {
    info!("Starting Towns Server v{}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let service = boot(path).await?;
    info!("Towns server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    service.close().await;
    Ok(())
}

async fn run_migration(path: &Path, name: &str, params: Vec<(String, String)>) -> Result<()> {
    let service = boot(path).await?;
    let migrator = migrator::find_migrator(name, Arc::new(service.settings().clone()))
        .with_context(|| {
            format!(
                "Unknown migrator {}; available: {}",
                name,
                migrator::MIGRATORS.join(", ")
            )
        })?;
    for (key, value) in &params {
        migrator.set_parameter(key, value);
    }
    for (key, value) in migrator.state().parameters() {
        info!("{} = {}", key, value);
    }

    let outcome = start_migration(migrator.clone(), Arc::new(ConsoleUser), service.clone())
        .wait()
        .await;
    for report in service.status() {
        info!("{}", report);
    }
    service.close().await;

    outcome.into_result(migrator.name())?;
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ConfigManager::save(&Settings::default(), path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote default settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parameter() {
        assert_eq!(
            parse_parameter("file=old/towns.db").unwrap(),
            ("file".to_string(), "old/towns.db".to_string())
        );
        assert_eq!(
            parse_parameter("query=a=b").unwrap(),
            ("query".to_string(), "a=b".to_string())
        );
        assert!(parse_parameter("novalue").is_err());
        assert!(parse_parameter("=x").is_err());
    }

    #[test]
    fn test_cli_parses_migrate() {
        let cli = Cli::try_parse_from([
            "towns-server",
            "migrate",
            "legacy",
            "--param",
            "FILE=legacy.db",
            "-p",
            "server=lobby",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Migrate { name, params }) => {
                assert_eq!(name, "legacy");
                assert_eq!(params.len(), 2);
                assert_eq!(params[1], ("server".to_string(), "lobby".to_string()));
            }
            _ => panic!("expected migrate"),
        }
        assert_eq!(cli.config, PathBuf::from(CONFIG_FILE_NAME));
    }
}
