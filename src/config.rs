//! Configuration for the chain engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CHAINS_HOME, CHAINS_DATABASE)
//! 2. Config file (.chains/config.yaml)
//! 3. Defaults (~/.chains)
//!
//! Config file discovery:
//! - Searches current directory and parents for .chains/config.yaml
//! - Relative paths in the config file resolve against the `.chains/` directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{RetryPolicy, SafetyLimits};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub limits: SafetyLimits,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    /// Trigger manifest YAML
    pub triggers: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    pub database: PathBuf,
    pub triggers: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub limits: SafetyLimits,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".chains").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge a parsed file (if any) with env overrides and defaults
fn resolve(
    file: Option<(&Path, ConfigFile)>,
    env_home: Option<String>,
    env_database: Option<String>,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_dir, file_config, config_file) = match file {
        Some((path, config)) => (
            path.parent().map(Path::to_path_buf),
            config,
            Some(path.to_path_buf()),
        ),
        None => (None, ConfigFile::default(), None),
    };
    let relative = |p: &str| match &config_dir {
        Some(dir) => resolve_path(dir, p),
        None => PathBuf::from(p),
    };

    let home = env_home
        .map(PathBuf::from)
        .or_else(|| file_config.home.as_deref().map(relative))
        .unwrap_or(default_home);

    let database = env_database
        .map(PathBuf::from)
        .or_else(|| file_config.storage.database.as_deref().map(relative))
        .unwrap_or_else(|| home.join("chains.db"));

    let triggers = file_config.catalog.triggers.as_deref().map(relative);

    ResolvedConfig {
        home,
        database,
        triggers,
        retry: file_config.engine.retry,
        limits: file_config.engine.limits,
        config_file,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".chains");

    let config_path = find_config_file();
    let file = match &config_path {
        Some(path) => Some((path.as_path(), load_config_file(path)?)),
        None => None,
    };

    Ok(resolve(
        file,
        std::env::var("CHAINS_HOME").ok(),
        std::env::var("CHAINS_DATABASE").ok(),
        default_home,
    ))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the chains home directory (engine state)
pub fn chains_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the journal directory ($CHAINS_HOME/journal)
pub fn journal_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("journal"))
}

/// Get the SQLite database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}
