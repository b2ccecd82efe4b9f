//! # Engine Configuration
//!
//! Configuration for the reconciliation engine.
//!
//! ## Configuration Sources (Priority Order)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Loading Order                          │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     LEDGERSYNC_DB_PATH, LEDGERSYNC_BATCH_SIZE, LEDGERSYNC_EXPORT_DIR   │
//! │                        ▼                                                │
//! │  2. Config File (~/.config/ledgersync/ledgersync.toml)                 │
//! │     [database], [sync], [mapping], [source], [[partitions]]            │
//! │                        ▼                                                │
//! │  3. Default Values (lowest priority)                                   │
//! │     batch_size = 500, max_attempts = 3, lease_ttl_secs = 300           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Config File
//! ```toml
//! [database]
//! path = "replica.db"
//!
//! [sync]
//! batch_size = 500
//! max_parallel_cycles = 4
//!
//! [mapping]
//! identity = "guid"
//! revision = "alter_id"
//!
//! [source]
//! export_dir = "exports"
//!
//! [[partitions]]
//! tenant = "Acme Traders"
//! entity_types = ["ledger", "stock_item"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use ledgersync_core::{FieldMapping, PartitionKey};
use ledgersync_db::DbConfig;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Database Settings
// =============================================================================

/// Replica database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Path to the SQLite replica file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database before SQLite reports
    /// SQLITE_BUSY (milliseconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("replica.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout() -> u64 {
    5000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Cycle behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Records per extractor batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per record before a transient failure counts as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum retry backoff (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Partition lease time-to-live (seconds). A running cycle renews it
    /// every third of the TTL.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Whole-cycle timeout (seconds). 0 disables it.
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// Upper bound on cycles running at once in `run_all`.
    #[serde(default = "default_max_parallel_cycles")]
    pub max_parallel_cycles: usize,
}

fn default_batch_size() -> usize {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_lease_ttl() -> u64 {
    300
}

fn default_cycle_timeout() -> u64 {
    1800
}

fn default_max_parallel_cycles() -> usize {
    4
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            lease_ttl_secs: default_lease_ttl(),
            cycle_timeout_secs: default_cycle_timeout(),
            max_parallel_cycles: default_max_parallel_cycles(),
        }
    }
}

impl SyncSettings {
    /// Lease TTL, capped at one year.
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.capped_lease_ttl_secs() as i64)
    }

    /// How often a running cycle renews its lease: a third of the TTL.
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis((self.capped_lease_ttl_secs() * 1000 / 3).max(1))
    }

    fn capped_lease_ttl_secs(&self) -> u64 {
        self.lease_ttl_secs.min(31_536_000)
    }

    /// Returns `None` when the timeout is disabled.
    pub fn cycle_timeout(&self) -> Option<Duration> {
        (self.cycle_timeout_secs > 0).then(|| Duration::from_secs(self.cycle_timeout_secs))
    }
}

// =============================================================================
// Source Settings
// =============================================================================

/// Where the file extractor finds exported records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Root of `<tenant>/<entity_type>.json` export files.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

impl Default for SourceSettings {
    fn default() -> Self {
        SourceSettings {
            export_dir: default_export_dir(),
        }
    }
}

/// One tenant and the entity types replicated for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub tenant: String,

    #[serde(default)]
    pub entity_types: Vec<String>,
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    /// Raw field names of the canonical change-record fields.
    #[serde(default)]
    pub mapping: FieldMapping,

    #[serde(default)]
    pub source: SourceSettings,

    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

impl EngineConfig {
    /// Loads configuration from file and environment.
    ///
    /// ## Loading Order
    /// 1. Start with defaults
    /// 2. Override with config file (if exists)
    /// 3. Override with environment variables
    /// 4. Validate
    ///
    /// ## Arguments
    /// * `config_path` - Optional path to config file. Falls back to the
    ///   platform config directory.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Engine config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig("sync.batch_size must be at least 1".into()));
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig("sync.max_attempts must be at least 1".into()));
        }

        if self.sync.max_parallel_cycles == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_parallel_cycles must be at least 1".into(),
            ));
        }

        if self.sync.lease_ttl_secs == 0 {
            return Err(SyncError::InvalidConfig("sync.lease_ttl_secs must be at least 1".into()));
        }

        if self.database.max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "database.max_connections must be at least 1".into(),
            ));
        }

        for partition in self.partitions() {
            ledgersync_core::validation::validate_partition(&partition).map_err(|e| {
                SyncError::InvalidConfig(format!("partition '{partition}': {e}"))
            })?;
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `LEDGERSYNC_*` overrides from any key lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("LEDGERSYNC_DB_PATH") {
            debug!(%path, "Using database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(dir) = lookup("LEDGERSYNC_EXPORT_DIR") {
            debug!(%dir, "Using export dir from environment");
            self.source.export_dir = PathBuf::from(dir);
        }

        if let Some(size) = lookup("LEDGERSYNC_BATCH_SIZE") {
            match size.parse() {
                Ok(size) => self.sync.batch_size = size,
                Err(_) => warn!(%size, "Invalid LEDGERSYNC_BATCH_SIZE, ignoring"),
            }
        }

        if let Some(attempts) = lookup("LEDGERSYNC_MAX_ATTEMPTS") {
            match attempts.parse() {
                Ok(attempts) => self.sync.max_attempts = attempts,
                Err(_) => warn!(%attempts, "Invalid LEDGERSYNC_MAX_ATTEMPTS, ignoring"),
            }
        }

        if let Some(parallel) = lookup("LEDGERSYNC_MAX_PARALLEL_CYCLES") {
            match parallel.parse() {
                Ok(parallel) => self.sync.max_parallel_cycles = parallel,
                Err(_) => warn!(%parallel, "Invalid LEDGERSYNC_MAX_PARALLEL_CYCLES, ignoring"),
            }
        }

        if let Some(timeout) = lookup("LEDGERSYNC_CYCLE_TIMEOUT_SECS") {
            match timeout.parse() {
                Ok(timeout) => self.sync.cycle_timeout_secs = timeout,
                Err(_) => warn!(%timeout, "Invalid LEDGERSYNC_CYCLE_TIMEOUT_SECS, ignoring"),
            }
        }
    }

    /// Gets the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "ledgersync", "ledgersync")
            .map(|dirs| dirs.config_dir().join("ledgersync.toml"))
    }

    // =========================================================================
    // Convenience Accessors
    // =========================================================================

    /// Flattens `[[partitions]]` into one key per (tenant, entity type).
    pub fn partitions(&self) -> Vec<PartitionKey> {
        self.partitions
            .iter()
            .flat_map(|p| {
                p.entity_types
                    .iter()
                    .map(move |entity_type| PartitionKey::new(&p.tenant, entity_type))
            })
            .collect()
    }

    /// Database pool configuration for these settings.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(self.database.path.clone())
            .max_connections(self.database.max_connections)
            .busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.sync.batch_size, 500);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.sync.max_parallel_cycles, 4);
        assert_eq!(config.mapping.identity, "guid");
        assert!(config.partitions().is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.sync.batch_size = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        let mut config = EngineConfig::default();
        config.sync.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sync.max_parallel_cycles = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.partitions.push(PartitionConfig {
            tenant: "  ".into(),
            entity_types: vec!["ledger".into()],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [sync]
            batch_size = 50

            [[partitions]]
            tenant = "Acme Traders"
            entity_types = ["ledger", "stock_item"]

            [[partitions]]
            tenant = "Beta Stores"
            entity_types = ["ledger"]
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.database.path, PathBuf::from("replica.db"));
        assert_eq!(
            config.partitions(),
            vec![
                PartitionKey::new("Acme Traders", "ledger"),
                PartitionKey::new("Acme Traders", "stock_item"),
                PartitionKey::new("Beta Stores", "ledger"),
            ]
        );
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("LEDGERSYNC_DB_PATH", "/var/lib/ledgersync/replica.db"),
            ("LEDGERSYNC_BATCH_SIZE", "25"),
            ("LEDGERSYNC_MAX_ATTEMPTS", "not-a-number"),
        ]);

        let mut config = EngineConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/var/lib/ledgersync/replica.db"));
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.max_attempts, 3);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledgersync.toml");

        let mut config = EngineConfig::default();
        config.sync.batch_size = 42;
        config.partitions.push(PartitionConfig {
            tenant: "Acme Traders".into(),
            entity_types: vec!["ledger".into()],
        });
        config.save(Some(path.clone())).unwrap();

        let loaded = EngineConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.sync.batch_size, 42);
        assert_eq!(loaded.partitions(), vec![PartitionKey::new("Acme Traders", "ledger")]);
    }

    #[test]
    fn test_invalid_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledgersync.toml");
        std::fs::write(&path, "[sync]\nbatch_size = \"many\"\n").unwrap();

        let err = EngineConfig::load(Some(path.clone())).unwrap_err();
        assert!(err.is_config_error());

        let fallback = EngineConfig::load_or_default(Some(path));
        assert_eq!(fallback.sync.batch_size, 500);
    }

    #[test]
    fn test_cycle_timeout_disabled_at_zero() {
        let mut settings = SyncSettings::default();
        assert_eq!(settings.cycle_timeout(), Some(Duration::from_secs(1800)));
        settings.cycle_timeout_secs = 0;
        assert_eq!(settings.cycle_timeout(), None);
    }

    #[test]
    fn test_lease_renewed_three_times_per_ttl() {
        let mut settings = SyncSettings::default();
        assert_eq!(settings.lease_renew_interval(), Duration::from_secs(100));

        settings.lease_ttl_secs = 1;
        assert_eq!(settings.lease_renew_interval(), Duration::from_millis(333));
        assert_eq!(settings.lease_ttl(), chrono::Duration::seconds(1));
    }
}
