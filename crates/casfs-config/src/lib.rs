//! # casfs-config
//!
//! Configuration for casfs client components.
//!
//! Loads configuration from:
//! 1. `~/.casfs/config.toml` (global)
//! 2. `<project>/.casfs/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! casfs components are instantiable objects, so there is no process-global
//! config: callers load a `Config` and hand the relevant section to the
//! component constructors (`StreamingCacheManager::from_config`,
//! `FsDownloadManager::from_config`, ...).

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version.
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility).
    pub config_version: u32,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

/// Settings for the cache layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on simultaneously open virtual descriptors.
    pub max_open_fds: u32,
    /// Capacity of the metadata LRU caches (entries; must be a multiple of
    /// 64 and at least 128).
    pub md_cache_entries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_open_fds: 512,
            md_cache_entries: 16384,
        }
    }
}

/// Settings for the download side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Ordered mirror roots; each holds a `data/` object tree.
    pub mirrors: Vec<String>,
    /// Whether transports may probe and reorder mirrors.
    pub probe_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mirrors: Vec::new(),
            probe_hosts: true,
        }
    }
}

impl Config {
    /// Load config from the standard locations (CWD-relative project config).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific project root directory.
    /// Resolution order: global → project → env vars.
    pub fn load_for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        let project_config_path = project_root.join(".casfs/config.toml");
        if project_config_path.exists() {
            debug!("Loading project config from {:?}", project_config_path);
            let contents = std::fs::read_to_string(&project_config_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: `~/.casfs/config.toml`.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".casfs/config.toml"))
    }

    /// Merge another config (project overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let default_cache = CacheConfig::default();
        if other.cache.max_open_fds != default_cache.max_open_fds {
            self.cache.max_open_fds = other.cache.max_open_fds;
        }
        if other.cache.md_cache_entries != default_cache.md_cache_entries {
            self.cache.md_cache_entries = other.cache.md_cache_entries;
        }

        let default_fetch = FetchConfig::default();
        if !other.fetch.mirrors.is_empty() {
            self.fetch.mirrors = other.fetch.mirrors;
        }
        if other.fetch.probe_hosts != default_fetch.probe_hosts {
            self.fetch.probe_hosts = other.fetch.probe_hosts;
        }
    }

    /// Apply environment variable overrides (highest priority).
    fn apply_env_overrides(&mut self) {
        if let Ok(fds) = std::env::var("CASFS_MAX_OPEN_FDS") {
            if let Ok(n) = fds.parse() {
                self.cache.max_open_fds = n;
            }
        }
        if let Ok(entries) = std::env::var("CASFS_MD_CACHE_ENTRIES") {
            if let Ok(n) = entries.parse() {
                self.cache.md_cache_entries = n;
            }
        }
        if let Ok(mirrors) = std::env::var("CASFS_MIRRORS") {
            self.fetch.mirrors = mirrors
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if std::env::var("CASFS_NO_PROBE_HOSTS").is_ok() {
            self.fetch.probe_hosts = false;
        }
    }

    /// Generate a TOML template for a fresh project config.
    pub fn init_toml() -> String {
        let default = Config::default();
        format!(
            r#"# casfs client configuration
config_version = 1

[cache]
max_open_fds = {max_open_fds}
# md_cache_entries = {md_cache_entries}

[fetch]
# Ordered mirror roots, first match wins.
mirrors = []
# probe_hosts = true
"#,
            max_open_fds = default.cache.max_open_fds,
            md_cache_entries = default.cache.md_cache_entries,
        )
    }
}
