//! Configuration for the coderag indexing engine.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `CODERAG__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config as cfg;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "CODERAG";

/// Default collection used when a caller does not name one.
pub const DEFAULT_COLLECTION: &str = "code_embeddings";

/// Errors raised while validating or expanding configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to expand path {0}: {1}")]
    Expand(String, String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub search: SearchSettings,
    pub cross_encoder: CrossEncoderConfig,
    pub cache: CacheConfig,
    pub indexing: IndexingConfig,
    pub refactor: RefactorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Sliding-window size in lines
    pub max_chunk_lines: usize,
    /// Lines shared between consecutive windows
    pub overlap_lines: usize,
    /// Windows with less trimmed text than this are dropped
    pub min_chunk_chars: usize,
    /// Attach package/import context to each chunk
    pub include_context: bool,
    pub max_context_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_lines: 512,
            overlap_lines: 128,
            min_chunk_chars: 50,
            include_context: true,
            max_context_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local embedding microservice (`POST /embed`)
    Service,
    /// OpenAI-compatible `/v1/embeddings` endpoint
    OpenAi,
    /// Deterministic token hashing, no network
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub batch_size: usize,
    pub cache_size: usize,
    pub timeout_secs: u64,
    /// Serve hash vectors when the provider fails
    pub fallback_to_hash: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Service,
            url: "http://localhost:8001".to_string(),
            model: "microsoft/codebert-base".to_string(),
            api_key: None,
            dimensions: 768,
            batch_size: 32,
            cache_size: 10_000,
            timeout_secs: 30,
            fallback_to_hash: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Qdrant,
            url: "http://localhost:6334".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub rrf_k: f32,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    /// Each path fetches `limit * candidate_multiplier` candidates
    pub candidate_multiplier: usize,
    /// How many fused results are sent to the cross-encoder
    pub rerank_top_n: usize,
    /// Results whose path contains one of these are dropped
    pub excluded_result_paths: Vec<String>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            semantic_weight: 1.0,
            keyword_weight: 1.0,
            candidate_multiplier: 2,
            rerank_top_n: 20,
            excluded_result_paths: ["node_modules", "vendor", ".next", "dist/", "build/"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEncoderConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for CrossEncoderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8002/rerank".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub search_max_entries: usize,
    pub search_ttl_secs: u64,
    pub file_chunk_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            search_max_entries: 1000,
            search_ttl_secs: 15 * 60,
            file_chunk_max_entries: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub default_collection: String,
    /// Size of the incremental indexer's worker pool
    pub workers: usize,
    pub exclude_dirs: Vec<String>,
    /// File extensions (without the dot) considered source code
    pub extensions: Vec<String>,
    pub respect_gitignore: bool,
    pub data_dir: PathBuf,
    /// Save keyword index, manifest and dependency graph under `data_dir`
    pub persist: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        let exclude_dirs = [
            "node_modules",
            "vendor",
            "dist",
            "build",
            ".git",
            ".next",
            "out",
            "target",
            ".pytest_cache",
            "__pycache__",
            ".tox",
            ".coverage",
            "htmlcov",
        ];
        let extensions = [
            "go", "js", "ts", "jsx", "tsx", "py", "java", "c", "cpp", "h", "hpp", "cs", "rb",
            "php", "swift", "kt", "rs", "scala", "sh", "bash", "zsh", "yml", "yaml", "json",
            "xml", "html", "css", "scss", "sql",
        ];
        Self {
            default_collection: DEFAULT_COLLECTION.to_string(),
            workers: 4,
            exclude_dirs: exclude_dirs.iter().map(|s| s.to_string()).collect(),
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            respect_gitignore: true,
            data_dir: PathBuf::from("~/.coderag"),
            persist: false,
        }
    }
}

/// Batch shape for one refactor processing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefactorConfig {
    /// Change sets smaller than this run in realtime mode
    pub realtime_below: usize,
    pub batch_below: usize,
    pub bulk_below: usize,
    /// A rollback point is recorded above this many changes
    pub rollback_threshold: usize,
    pub max_rollback_points: usize,
    pub batch: ModeSettings,
    pub bulk: ModeSettings,
    pub offline: ModeSettings,
}

impl Default for RefactorConfig {
    fn default() -> Self {
        Self {
            realtime_below: 10,
            batch_below: 100,
            bulk_below: 1000,
            rollback_threshold: 50,
            max_rollback_points: 10,
            batch: ModeSettings {
                batch_size: 50,
                concurrency: 4,
                delay_ms: 100,
            },
            bulk: ModeSettings {
                batch_size: 200,
                concurrency: 8,
                delay_ms: 500,
            },
            offline: ModeSettings {
                batch_size: 500,
                concurrency: 16,
                delay_ms: 0,
            },
        }
    }
}

impl Config {
    /// Load configuration from defaults, a TOML file and the environment.
    ///
    /// When `path` is `None` the user config file is used if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };

        let mut builder = cfg::Config::builder().add_source(
            cfg::Config::try_from(&Config::default()).context("Failed to encode defaults")?,
        );
        if let Some(ref file) = file {
            debug!(path = %file.display(), "Loading config file");
            builder = builder.add_source(cfg::File::from(file.as_path()).required(false));
        }
        builder = builder.add_source(cfg::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: Config = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Check invariants the rest of the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_zero(field: &'static str, value: usize) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        non_zero("chunking.max_chunk_lines", self.chunking.max_chunk_lines)?;
        if self.chunking.overlap_lines >= self.chunking.max_chunk_lines {
            return Err(ConfigError::Invalid {
                field: "chunking.overlap_lines",
                reason: "must be smaller than max_chunk_lines".to_string(),
            });
        }
        non_zero("embedding.dimensions", self.embedding.dimensions)?;
        non_zero("embedding.batch_size", self.embedding.batch_size)?;
        non_zero("cache.search_max_entries", self.cache.search_max_entries)?;
        non_zero("cache.file_chunk_max_entries", self.cache.file_chunk_max_entries)?;
        if self.cache.search_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.search_ttl_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        non_zero("indexing.workers", self.indexing.workers)?;
        if self.indexing.default_collection.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "indexing.default_collection",
                reason: "must not be empty".to_string(),
            });
        }

        let r = &self.refactor;
        if !(r.realtime_below > 0 && r.realtime_below < r.batch_below && r.batch_below < r.bulk_below)
        {
            return Err(ConfigError::Invalid {
                field: "refactor",
                reason: format!(
                    "thresholds must increase: {} < {} < {}",
                    r.realtime_below, r.batch_below, r.bulk_below
                ),
            });
        }
        non_zero("refactor.max_rollback_points", r.max_rollback_points)?;
        for (field, mode) in [
            ("refactor.batch", r.batch),
            ("refactor.bulk", r.bulk),
            ("refactor.offline", r.offline),
        ] {
            non_zero(field, mode.batch_size)?;
            non_zero(field, mode.concurrency)?;
        }
        if !(self.search.rrf_k > 0.0) {
            return Err(ConfigError::Invalid {
                field: "search.rrf_k",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// `data_dir` with `~` and environment variables expanded.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        expand_path(&self.indexing.data_dir)
    }
}

/// Location of the user configuration file, `<config dir>/coderag/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("coderag").join("config.toml"))
}

/// Expand `~` and `$VAR` references in a path.
pub fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| ConfigError::Expand(raw.to_string(), e.to_string()))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
