use anyhow::Result;
use std::path::PathBuf;

const BOTFLEET_DIR: &str = ".botfleet";
const DB_FILE: &str = "botfleet.db";
const HEALTH_DB_FILE: &str = "health.db";
const CONFIG_FILE: &str = "config.toml";
const LOGS_DIR: &str = "logs";

/// Environment variable to override the botfleet directory.
const BOTFLEET_DIR_ENV: &str = "BOTFLEET_DIR";

/// Resolve the botfleet data directory.
/// Priority: BOTFLEET_DIR env var > ~/.botfleet/
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(BOTFLEET_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(BOTFLEET_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Ensure the data directory exists and return its path.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = resolve_data_dir()?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Primary database path: ~/.botfleet/botfleet.db
pub fn database_path() -> Result<PathBuf> {
    Ok(resolve_data_dir()?.join(DB_FILE))
}

/// Ensure the data dir exists and return the primary database path as a string.
pub fn ensure_database_path_string() -> Result<String> {
    Ok(ensure_data_dir()?.join(DB_FILE).to_string_lossy().into_owned())
}

/// Secondary health database path: ~/.botfleet/health.db
pub fn health_database_path() -> Result<PathBuf> {
    Ok(resolve_data_dir()?.join(HEALTH_DB_FILE))
}

/// Config file path: ~/.botfleet/config.toml
pub fn config_path() -> Result<PathBuf> {
    Ok(resolve_data_dir()?.join(CONFIG_FILE))
}

/// Log directory: ~/.botfleet/logs
pub fn logs_dir() -> Result<PathBuf> {
    Ok(resolve_data_dir()?.join(LOGS_DIR))
}
