use crate::fingerprint::DEFAULT_GENERATION;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::ScanError {
    fn from(e: ConfigError) -> Self {
        crate::ScanError::Config(e.to_string())
    }
}

/// Main configuration for the indexing engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexerConfig {
    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub ast_cache: AstCacheConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Files parsed together; bounds peak frontend memory
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Index test source folders as well
    #[serde(default)]
    pub scan_test_sources: bool,

    /// Generation tag mixed into every cache fingerprint
    #[serde(default = "default_generation")]
    pub generation: String,

    /// Annotations under this namespace get a default symbol when no rule handles them
    #[serde(default = "default_symbol_prefix")]
    pub default_symbol_prefix: Option<String>,

    /// Worker threads used for parsing a chunk
    #[serde(default = "default_parse_threads")]
    pub parse_threads: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            scan_test_sources: false,
            generation: default_generation(),
            default_symbol_prefix: default_symbol_prefix(),
            parse_threads: default_parse_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstCacheConfig {
    /// Inactivity after which a parsed tree is dropped
    #[serde(default = "default_ast_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_ast_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl AstCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

impl Default for AstCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ast_ttl_secs(),
            max_entries: default_ast_max_entries(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Quiet period before build output changes invalidate a project environment
    #[serde(default = "default_output_debounce_ms")]
    pub output_debounce_ms: u64,
}

impl EnvironmentConfig {
    pub fn output_debounce(&self) -> Duration {
        Duration::from_millis(self.output_debounce_ms)
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            output_debounce_ms: default_output_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Disk,
    Memory,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,

    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,

    /// Appended deltas tolerated before a cache file is rewritten as one snapshot
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            directory: default_cache_directory(),
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_source_patterns")]
    pub source_patterns: Vec<String>,

    #[serde(default = "default_output_patterns")]
    pub output_patterns: Vec<String>,

    /// Factory registration files indexed next to the sources; empty disables that indexer
    #[serde(default = "default_factories_patterns")]
    pub factories_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            source_patterns: default_source_patterns(),
            output_patterns: default_output_patterns(),
            factories_patterns: default_factories_patterns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "compact", "full"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_chunk_size() -> usize {
    1000
}
fn default_generation() -> String {
    DEFAULT_GENERATION.to_string()
}
fn default_symbol_prefix() -> Option<String> {
    Some("org.springframework".to_string())
}
fn default_parse_threads() -> usize {
    num_cpus::get()
}
fn default_ast_ttl_secs() -> u64 {
    60
}
fn default_ast_max_entries() -> usize {
    100
}
fn default_reap_interval_secs() -> u64 {
    15
}
fn default_output_debounce_ms() -> u64 {
    100
}
fn default_cache_backend() -> CacheBackend {
    CacheBackend::Disk
}
fn default_cache_directory() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("beanscan")
        .join("index-cache")
}
fn default_compaction_threshold() -> usize {
    20
}
fn default_source_patterns() -> Vec<String> {
    vec!["**/*.java".to_string()]
}
fn default_output_patterns() -> Vec<String> {
    vec![
        "**/*.class".to_string(),
        "**/*.jar".to_string(),
        "**/META-INF/MANIFEST.MF".to_string(),
    ]
}
fn default_factories_patterns() -> Vec<String> {
    vec!["**/META-INF/spring.factories".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager: environment > config file > defaults
pub struct ConfigManager {
    config: IndexerConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (`BEANSCAN_*`)
    /// 2. Config file (`./.beanscan.toml`, then `~/.beanscan/config.toml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let (config, config_path) = Self::load_config_file()?;
        Self::finish(config, config_path)
    }

    /// Load an explicit config file, still honouring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let config = Self::read_toml_file(path)?;
        Self::finish(config, Some(path.to_path_buf()))
    }

    fn finish(config: IndexerConfig, config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        match config_path {
            Some(ref path) => info!(path = %path.display(), "Loaded indexer configuration"),
            None => info!("No config file found, using defaults"),
        }
        debug!(
            chunk_size = config.indexing.chunk_size,
            backend = ?config.cache.backend,
            ast_ttl_secs = config.ast_cache.ttl_secs,
            debounce_ms = config.environment.output_debounce_ms,
            "Indexer configuration"
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    fn load_config_file() -> Result<(IndexerConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".beanscan.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".beanscan").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((IndexerConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<IndexerConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(config: IndexerConfig) -> IndexerConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides(
        mut config: IndexerConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> IndexerConfig {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Option<T> {
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring unparsable value {:?} for {}", value, key);
                    None
                }
            }
        }

        if let Some(v) = lookup("BEANSCAN_CHUNK_SIZE").and_then(|v| parsed("BEANSCAN_CHUNK_SIZE", v)) {
            config.indexing.chunk_size = v;
        }
        if let Some(v) = lookup("BEANSCAN_SCAN_TEST_SOURCES")
            .and_then(|v| parsed("BEANSCAN_SCAN_TEST_SOURCES", v))
        {
            config.indexing.scan_test_sources = v;
        }
        if let Some(v) = lookup("BEANSCAN_GENERATION") {
            config.indexing.generation = v;
        }
        if let Some(v) = lookup("BEANSCAN_AST_TTL_SECS").and_then(|v| parsed("BEANSCAN_AST_TTL_SECS", v)) {
            config.ast_cache.ttl_secs = v;
        }
        if let Some(v) = lookup("BEANSCAN_AST_MAX_ENTRIES")
            .and_then(|v| parsed("BEANSCAN_AST_MAX_ENTRIES", v))
        {
            config.ast_cache.max_entries = v;
        }
        if let Some(v) = lookup("BEANSCAN_OUTPUT_DEBOUNCE_MS")
            .and_then(|v| parsed("BEANSCAN_OUTPUT_DEBOUNCE_MS", v))
        {
            config.environment.output_debounce_ms = v;
        }
        if let Some(v) = lookup("BEANSCAN_CACHE_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "disk" => config.cache.backend = CacheBackend::Disk,
                "memory" => config.cache.backend = CacheBackend::Memory,
                "none" => config.cache.backend = CacheBackend::None,
                other => warn!("Ignoring unknown cache backend {:?}", other),
            }
        }
        if let Some(v) = lookup("BEANSCAN_CACHE_DIR") {
            config.cache.directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("BEANSCAN_COMPACTION_THRESHOLD")
            .and_then(|v| parsed("BEANSCAN_COMPACTION_THRESHOLD", v))
        {
            config.cache.compaction_threshold = v;
        }
        if let Some(v) = lookup("BEANSCAN_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("BEANSCAN_LOG_FORMAT") {
            config.logging.format = v;
        }

        config
    }

    pub fn validate_config(config: &IndexerConfig) -> Result<(), ConfigError> {
        if config.indexing.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "indexing.chunk_size must be greater than zero".to_string(),
            ));
        }
        if config.ast_cache.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "ast_cache.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if config.cache.compaction_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "cache.compaction_threshold must be greater than zero".to_string(),
            ));
        }

        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }

        for pattern in config
            .watch
            .source_patterns
            .iter()
            .chain(config.watch.output_patterns.iter())
            .chain(config.watch.factories_patterns.iter())
        {
            Glob::new(pattern).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid watch pattern {}: {}", pattern, e))
            })?;
        }

        Ok(())
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn into_config(self) -> IndexerConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = IndexerConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
