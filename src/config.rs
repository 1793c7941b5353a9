use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::cache::{ExpirationPolicy, SqliteStorage};
use crate::worker::lifecycle::Generation;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// The application's own origin, e.g. `https://portal.example.com`
  pub origin: String,
  /// External API origins whose requests are cached network-first.
  /// Either exact (`https://api.supabase.co`) or wildcard (`https://*.supabase.co`).
  #[serde(default)]
  pub api_origins: Vec<String>,
  /// Generation label used to derive store names when `stores` is absent
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  /// Explicit store names for the current generation
  pub stores: Option<StoreNames>,
  /// Shell resources pre-populated on install (paths on `origin`)
  #[serde(default = "default_shell")]
  pub shell: Vec<String>,
  /// Page served to failed navigations; must be part of `shell`
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Path extensions classified as static assets (case-insensitive)
  #[serde(
    default = "default_asset_extensions",
    deserialize_with = "deserialize_extension_set"
  )]
  pub asset_extensions: BTreeSet<String>,
  /// Asset extensions served stale-while-revalidate instead of cache-first
  #[serde(default, deserialize_with = "deserialize_extension_set")]
  pub revalidate_extensions: BTreeSet<String>,
  /// Navigation path prefixes that never receive the offline page
  #[serde(default = "default_offline_fallback_denylist")]
  pub offline_fallback_denylist: Vec<String>,
  /// Activate immediately after install instead of waiting
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// Take control of already-open pages on activation
  #[serde(default = "default_true")]
  pub claim_clients: bool,
  #[serde(default)]
  pub expiration: ExpirationConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  /// Directory for daily-rolling log files (stderr only when unset)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StoreNames {
  pub shell: String,
  pub assets: String,
  pub api: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpirationConfig {
  #[serde(default)]
  pub shell: ExpirationPolicy,
  #[serde(default)]
  pub assets: ExpirationPolicy,
  #[serde(default)]
  pub api: ExpirationPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  /// Upper bound on stored body bytes
  pub quota_bytes: Option<u64>,
}

fn missing_config(searched: &[PathBuf]) -> color_eyre::Report {
  let searched = searched
    .iter()
    .map(|p| format!("  {}", p.display()))
    .collect::<Vec<_>>()
    .join("\n");
  eyre!(
    "No configuration file found. Searched:\n{}\n\
     A minimal config needs `origin:`; `api_origins:`, `cache_version:` and `shell:` \
     are usually set too, e.g.\n\n\
     origin: https://portal.example.com\n\
     api_origins: [\"https://*.supabase.co\"]\n\
     cache_version: v1",
    searched
  )
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_shell() -> Vec<String> {
  [
    "/",
    "/index.html",
    "/offline.html",
    "/manifest.json",
    "/icons/icon-192x192.png",
    "/icons/icon-512x512.png",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_asset_extensions() -> BTreeSet<String> {
  ["js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_offline_fallback_denylist() -> Vec<String> {
  vec!["/api".to_string(), "/admin".to_string()]
}

fn default_true() -> bool {
  true
}

fn deserialize_extension_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Config {
  /// Load configuration from the first file found in [`Self::search_paths`],
  /// or from `explicit_path`, which must then exist.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    let candidates = Self::search_paths();
    match candidates.iter().find(|path| path.exists()) {
      Some(path) => Self::load_from_path(path),
      None => Err(missing_config(&candidates)),
    }
  }

  /// `./offline-cache.yaml`, then `$XDG_CONFIG_HOME/offline-cache/config.yaml`.
  pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("offline-cache.yaml")];
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("offline-cache").join("config.yaml"));
    }
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Store names considered current.
  pub fn generation(&self) -> Generation {
    match &self.stores {
      Some(names) => Generation::new(
        self.cache_version.clone(),
        names.shell.clone(),
        names.assets.clone(),
        names.api.clone(),
      ),
      None => Generation::from_version(&self.cache_version),
    }
  }

  /// Database location.
  ///
  /// Checks `storage.path`, then OFFLINE_CACHE_DB, then the platform data directory.
  pub fn storage_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.storage.path {
      return Ok(path.clone());
    }
    match std::env::var_os("OFFLINE_CACHE_DB") {
      Some(path) => Ok(PathBuf::from(path)),
      None => SqliteStorage::default_path(),
    }
  }
}
