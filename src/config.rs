use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

use crate::manifest::{Manifest, ManifestEntry};

/// Path served when a document navigation fails both cache and network.
pub const DEFAULT_OFFLINE_FALLBACK: &str = "/index.html";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Prefix of the bucket name, e.g. "simum-portfolio"
  pub name: String,
  /// Site origin that relative manifest entries resolve against
  pub origin: String,
  /// Cached document served to offline navigations
  #[serde(default = "default_offline_fallback")]
  pub offline_fallback: String,
  /// Background-sync tags the worker acknowledges
  #[serde(default = "default_sync_tags")]
  pub sync_tags: BTreeSet<String>,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
  /// User-Agent sent with every request
  pub user_agent: Option<String>,
  /// Per-request timeout. Unset means a hung fetch waits forever.
  pub timeout_secs: Option<u64>,
}

fn default_offline_fallback() -> String {
  DEFAULT_OFFLINE_FALLBACK.to_string()
}

fn default_sync_tags() -> BTreeSet<String> {
  BTreeSet::from(["contact-form".to_string()])
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./precache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/precache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create ./precache.yaml or ~/.config/precache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("precache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("precache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Site origin, overridable with PRECACHE_ORIGIN for staging deployments.
  pub fn origin(&self) -> Result<Url> {
    let raw = std::env::var("PRECACHE_ORIGIN").unwrap_or_else(|_| self.origin.clone());
    Url::parse(&raw).map_err(|e| eyre!("Invalid origin '{}': {}", raw, e))
  }

  /// Build the manifest; its hash names the current bucket.
  pub fn build_manifest(&self) -> Result<Manifest> {
    Manifest::new(&self.name, &self.origin()?, &self.manifest)
  }
}
