use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

use botfleet_core::telegram::TelegramApiFactory;
use botfleet_core::{FleetConfig, FleetCore, paths};
use botfleet_storage::{HealthStore, Storage};

use crate::cli::Cli;

/// Daily-rolling file logs while serving, stdout otherwise. The returned
/// guard must stay alive for the file writer to flush.
pub fn init_logging(serving: bool, verbose: bool) -> Result<Option<WorkerGuard>> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if serving {
        let log_dir = paths::logs_dir()?;
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;

        let file_appender = tracing_appender::rolling::daily(log_dir, "botfleet.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(false)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        Ok(None)
    }
}

/// Wire a local engine instance from CLI flags and the config file.
pub fn prepare_core(cli: &Cli) -> Result<Arc<FleetCore>> {
    let config = match &cli.config {
        Some(path) => FleetConfig::load_from_path(Path::new(path))?,
        None => FleetConfig::load()?,
    };

    let db_path = match cli.db_path.clone().or_else(|| config.storage.db_path.clone()) {
        Some(path) => {
            ensure_parent(Path::new(&path))?;
            path
        }
        None => paths::ensure_database_path_string()?,
    };
    let health_path: PathBuf = match &config.storage.health_db_path {
        Some(path) => {
            let path = PathBuf::from(path);
            ensure_parent(&path)?;
            path
        }
        None => {
            paths::ensure_data_dir()?;
            paths::health_database_path()?
        }
    };

    let storage = Arc::new(Storage::new(&db_path)?);
    let health_store = Arc::new(HealthStore::open(&health_path)?);
    let api_factory = Arc::new(TelegramApiFactory::new());

    FleetCore::new(config, storage, health_store, api_factory)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    Ok(())
}
