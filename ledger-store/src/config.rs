//! Configuration for the ledger

use crate::migration::MigrationConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory (JSON accounts, SQLite file, RocksDB files)
    pub data_dir: PathBuf,

    /// Directory of currency definitions
    pub currencies_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Backend selection and connection parameters
    pub storage: StorageConfig,

    /// Bounded cache configuration
    pub cache: CacheConfig,

    /// Reconciliation queue configuration
    pub reconciliation: ReconciliationConfig,

    /// Ranking configuration
    pub ranking: RankingConfig,

    /// Amount formatting configuration
    pub formatting: FormattingConfig,

    /// External economy import
    pub migration: MigrationConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data/ledger");
        Self {
            currencies_dir: data_dir.join("currencies"),
            storage: StorageConfig::for_data_dir(&data_dir),
            data_dir,
            service_name: "ledger-store".to_string(),
            cache: CacheConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            ranking: RankingConfig::default(),
            formatting: FormattingConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

/// Storage technology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One JSON file per account
    #[serde(alias = "json")]
    File,
    /// SQL tables (SQLite)
    #[serde(alias = "sqlite", alias = "sql")]
    Relational,
    /// Embedded document store (RocksDB)
    #[serde(alias = "rocksdb")]
    Document,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::File => "file",
            BackendKind::Relational => "relational",
            BackendKind::Document => "document",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(BackendKind::File),
            "relational" | "sqlite" | "sql" => Ok(BackendKind::Relational),
            "document" | "rocksdb" => Ok(BackendKind::Document),
            other => Err(crate::Error::Config(format!("Unknown storage kind: {}", other))),
        }
    }
}

/// Backend connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which driver to use
    pub kind: BackendKind,

    /// Location: directory for file/document stores, `sqlite://` URL for relational
    pub url: String,

    /// Database / schema name (document store subdirectory)
    pub database: String,

    /// Max pooled connections (relational)
    pub max_connections: u32,

    /// Min pooled connections (relational)
    pub min_connections: u32,

    /// Connection acquire timeout (milliseconds)
    pub connect_timeout_ms: u64,
}

impl StorageConfig {
    /// Default relational store inside `data_dir`
    pub fn for_data_dir(data_dir: &std::path::Path) -> Self {
        Self {
            kind: BackendKind::Relational,
            url: format!("sqlite://{}", data_dir.join("ledger.db").display()),
            database: "ledger".to_string(),
            max_connections: 1,
            min_connections: 1,
            connect_timeout_ms: 5_000,
        }
    }

    /// File store rooted at `dir`
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self {
            kind: BackendKind::File,
            url: dir.into().display().to_string(),
            ..Self::for_data_dir(std::path::Path::new("."))
        }
    }

    /// Relational store at a `sqlite://` URL
    pub fn relational(url: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Relational,
            url: url.into(),
            ..Self::for_data_dir(std::path::Path::new("."))
        }
    }

    /// Document store rooted at `dir`
    pub fn document(dir: impl Into<PathBuf>) -> Self {
        Self {
            kind: BackendKind::Document,
            url: dir.into().display().to_string(),
            ..Self::for_data_dir(std::path::Path::new("."))
        }
    }

    /// Connection acquire timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::for_data_dir(std::path::Path::new("./data/ledger"))
    }
}

/// Bounded cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Evict after this long without access (seconds)
    pub ttl_secs: u64,

    /// Resident account ceiling
    pub max_accounts: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            max_accounts: 10_000,
        }
    }
}

impl CacheConfig {
    /// Idle time before expiry
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Reconciliation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Scan period (milliseconds)
    pub interval_ms: u64,

    /// Time given to pending writes on shutdown (milliseconds)
    pub shutdown_grace_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,     // 2s between scans
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ReconciliationConfig {
    /// Scan period
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Shutdown grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Ranking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Entries per page
    pub page_size: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self { page_size: 10 }
    }
}

/// Amount formatting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattingConfig {
    /// Minimum fraction digits kept by `<short_amount>`
    pub short_amount_precision: u32,
}

impl Default for FormattingConfig {
    fn default() -> Self {
        Self {
            short_amount_precision: 3,
        }
    }
}

impl Config {
    /// Load from file.
    ///
    /// When `data_dir` is set, `currencies_dir` and `storage` that the file
    /// leaves out are placed under it, as [`Config::from_env`] does.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn from_toml(content: &str) -> crate::Result<Self> {
        let parse_error = |e: toml::de::Error| crate::Error::Config(format!("Failed to parse config: {}", e));
        let table: toml::Table = toml::from_str(content).map_err(parse_error)?;
        let mut config: Config = toml::from_str(content).map_err(parse_error)?;

        if table.contains_key("data_dir") {
            if !table.contains_key("currencies_dir") {
                config.currencies_dir = config.data_dir.join("currencies");
            }
            if !table.contains_key("storage") {
                config.storage = StorageConfig::for_data_dir(&config.data_dir);
            }
        }
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
            config.currencies_dir = config.data_dir.join("currencies");
            config.storage = StorageConfig::for_data_dir(&config.data_dir);
        }

        if let Ok(dir) = std::env::var("LEDGER_CURRENCIES_DIR") {
            config.currencies_dir = PathBuf::from(dir);
        }

        if let Ok(kind) = std::env::var("LEDGER_STORAGE_KIND") {
            config.storage.kind = kind.parse()?;
        }

        if let Ok(url) = std::env::var("LEDGER_STORAGE_URL") {
            config.storage.url = url;
        }

        if let Ok(database) = std::env::var("LEDGER_STORAGE_DATABASE") {
            config.storage.database = database;
        }

        if let Ok(size) = std::env::var("LEDGER_PAGE_SIZE") {
            config.ranking.page_size = size
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_PAGE_SIZE: {}", e)))?;
        }

        Ok(config)
    }
}
