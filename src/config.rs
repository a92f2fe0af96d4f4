use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative request URLs and pre-cache paths resolve against
  pub origin: Url,
  /// Deployment token appended to every tier name
  pub generation: String,
  pub tiers: TierCapacities,
  pub precache: PrecacheConfig,
  /// Path of the document served to page loads when offline
  pub offline_document: String,
  /// Path prefix of the API namespace
  pub api_prefix: String,
  /// Upper bound for every network call, in seconds
  pub network_timeout_secs: u64,
  /// Activate right after install instead of waiting for clients to detach
  pub skip_waiting: bool,
  /// Replay tag -> mutation endpoint path
  pub sync: BTreeMap<String, String>,
  /// Where the cache and queue databases live (default: $XDG_DATA_HOME/carbon-offline)
  pub data_dir: Option<PathBuf>,
  /// Keep cached responses on disk; `false` selects the in-memory store
  pub persist: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierCapacities {
  #[serde(rename = "static")]
  pub static_assets: usize,
  pub dynamic: usize,
  pub image: usize,
}

impl Default for TierCapacities {
  fn default() -> Self {
    Self {
      static_assets: 50,
      dynamic: 100,
      image: 200,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrecacheConfig {
  /// Literal asset paths stored in the static tier at install
  pub assets: Vec<String>,
  /// Route paths stored in the dynamic tier at install
  pub routes: Vec<String>,
}

impl Default for PrecacheConfig {
  fn default() -> Self {
    Self {
      assets: [
        "/",
        "/manifest.json",
        "/icon-192x192.png",
        "/icon-512x512.png",
        "/offline.html",
      ]
      .map(String::from)
      .to_vec(),
      routes: ["/dashboard", "/emissions", "/reports"].map(String::from).to_vec(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:5000").expect("literal URL is valid"),
      generation: "v2".to_string(),
      tiers: TierCapacities::default(),
      precache: PrecacheConfig::default(),
      offline_document: "/offline.html".to_string(),
      api_prefix: "/api/".to_string(),
      network_timeout_secs: 10,
      skip_waiting: false,
      sync: BTreeMap::from([("emissions-sync".to_string(), "/api/emissions".to_string())]),
      data_dir: None,
      persist: true,
    }
  }
}

/// Names and capacities of the tiers that belong to one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSet {
  pub static_assets: TierSpec,
  pub dynamic: TierSpec,
  pub image: TierSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSpec {
  pub name: String,
  pub capacity: usize,
}

impl TierSet {
  pub fn names(&self) -> [&str; 3] {
    [
      self.static_assets.name.as_str(),
      self.dynamic.name.as_str(),
      self.image.name.as_str(),
    ]
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./carbon-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/carbon-offline/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("carbon-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("carbon-offline").join("config.yaml");
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

  /// Reject values the engine cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }
    let caps = self.tiers;
    if caps.static_assets == 0 || caps.dynamic == 0 || caps.image == 0 {
      return Err(eyre!("tier capacities must be positive"));
    }
    if self.network_timeout_secs == 0 {
      return Err(eyre!("network_timeout_secs must be positive"));
    }
    Ok(())
  }

  /// Tier names for the current generation, e.g. `static-v2`.
  pub fn tier_set(&self) -> TierSet {
    let spec = |prefix: &str, capacity: usize| TierSpec {
      name: format!("{}-{}", prefix, self.generation),
      capacity,
    };
    TierSet {
      static_assets: spec("static", self.tiers.static_assets),
      dynamic: spec("dynamic", self.tiers.dynamic),
      image: spec("image", self.tiers.image),
    }
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  /// Resolve a path or URL against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid URL {}: {}", path, e))
  }

  /// Get the data directory for the cache and queue databases.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("carbon-offline"))
  }
}
