//! Engine configuration
//!
//! Loaded from a JSON file (`MEDIAVAULT_CONFIG`, or `config.json` under the
//! platform config dir) with environment overrides for the two settings that
//! differ most between deployments.

use crate::error::{MediaError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "MEDIAVAULT_CONFIG";
pub const REGISTRY_ENV: &str = "MEDIAVAULT_REGISTRY";
pub const DIRS_ENV: &str = "MEDIAVAULT_DIRS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directories whose contents the registry tracks.
    pub managed_dirs: Vec<PathBuf>,
    /// Primary registry file.
    pub registry_path: PathBuf,
    /// Rolling backup. Defaults to `<registry_path>.bak`.
    pub backup_path: Option<PathBuf>,
    pub eviction: EvictionPolicy,
    /// Orphans modified more recently than this are left alone for now.
    pub orphan_grace_secs: u64,
    pub scan_cache_capacity: usize,
    pub always_rehash: bool,
    pub reconcile_on_startup: bool,
    pub retry: RetryPolicy,
    pub librarian: LibrarianConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    pub max_total_bytes: Option<u64>,
    pub max_entry_age_secs: Option<u64>,
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarianConfig {
    pub watch: bool,
    pub debounce_ms: u64,
    pub eviction_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            managed_dirs: Vec::new(),
            registry_path: data_dir.join("mediavault").join("registry.db"),
            backup_path: None,
            eviction: EvictionPolicy::default(),
            orphan_grace_secs: 60,
            scan_cache_capacity: 65_536,
            always_rehash: false,
            reconcile_on_startup: true,
            retry: RetryPolicy::default(),
            librarian: LibrarianConfig::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_delay_ms: 100 }
    }
}

impl Default for LibrarianConfig {
    fn default() -> Self {
        Self { watch: true, debounce_ms: 500, eviction_interval_secs: 60 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl EvictionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_total_bytes.is_none() && self.max_entry_age_secs.is_none() && self.max_entries.is_none()
    }
}

impl EngineConfig {
    /// Config for a registry at `registry_path` managing `managed_dirs`, all
    /// other settings default.
    pub fn new(registry_path: impl Into<PathBuf>, managed_dirs: Vec<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            managed_dirs,
            ..Self::default()
        }
    }

    pub fn backup_path(&self) -> PathBuf {
        self.backup_path.clone().unwrap_or_else(|| {
            let mut name = self.registry_path.as_os_str().to_os_string();
            name.push(".bak");
            PathBuf::from(name)
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Resolve the config the way the binary does: explicit file, then the
    /// default location, then built-in defaults; env overrides last.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let default_file = dirs::config_dir().map(|d| d.join("mediavault").join("config.json"));

        let mut config = match (explicit, default_file) {
            (Some(path), _) => Self::from_file(&path)?,
            (None, Some(path)) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(registry) = std::env::var_os(REGISTRY_ENV) {
            self.registry_path = PathBuf::from(registry);
        }
        if let Some(dirs) = std::env::var_os(DIRS_ENV) {
            self.managed_dirs = std::env::split_paths(&dirs).collect();
        }
    }

    pub fn validate(&self) -> Result<()> {
        for dir in &self.managed_dirs {
            if !dir.is_absolute() {
                return Err(MediaError::InvalidPath(format!(
                    "managed directory must be absolute: {}", dir.display()
                )));
            }
            for stored in [&self.registry_path, &self.backup_path()] {
                if stored.starts_with(dir) {
                    return Err(MediaError::InvalidPath(format!(
                        "registry file {} must not live inside managed directory {}",
                        stored.display(), dir.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{
            "managed_dirs": ["/srv/media"],
            "registry_path": "/var/lib/mediavault/registry.db",
            "eviction": { "max_entries": 500 }
        }"#).unwrap();

        assert_eq!(config.eviction.max_entries, Some(500));
        assert_eq!(config.eviction.max_total_bytes, None);
        assert_eq!(config.orphan_grace_secs, 60);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.backup_path(), PathBuf::from("/var/lib/mediavault/registry.db.bak"));
        config.validate().unwrap();
    }

    #[test]
    fn registry_inside_managed_dir_is_rejected() {
        let config = EngineConfig::new("/srv/media/registry.db", vec![PathBuf::from("/srv/media")]);
        assert!(matches!(config.validate(), Err(MediaError::InvalidPath(_))));
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy { attempts: 4, base_delay_ms: 10 };
        assert_eq!(retry.delay(1), Duration::from_millis(10));
        assert_eq!(retry.delay(3), Duration::from_millis(40));
    }
}
