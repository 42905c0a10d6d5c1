use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Formats handled by the builtin extractor.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "docx", "xlsx", "txt"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub parsing: ParsingConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub lock: LockConfig,
    pub scan: ScanConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadsConfig {
    #[serde(default = "default_upload_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_temp_ttl_hours")]
    pub temp_ttl_hours: i64,
    #[serde(default = "default_upload_max_mb")]
    pub max_mb: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            temp_ttl_hours: default_temp_ttl_hours(),
            max_mb: default_upload_max_mb(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_temp_ttl_hours() -> i64 {
    24
}
fn default_upload_max_mb() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size_chars: default_chunk_size(),
            overlap_chars: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParsingConfig {
    #[serde(default = "default_builtin_threshold")]
    pub builtin_threshold: f64,
    #[serde(default = "default_secondary_threshold")]
    pub secondary_threshold: f64,
    #[serde(default = "default_ocr_threshold")]
    pub ocr_threshold: f64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            builtin_threshold: default_builtin_threshold(),
            secondary_threshold: default_secondary_threshold(),
            ocr_threshold: default_ocr_threshold(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl ParsingConfig {
    /// Case-insensitive allow-list check on a bare extension (no dot).
    pub fn is_allowed(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    }
}

fn default_builtin_threshold() -> f64 {
    0.65
}
fn default_secondary_threshold() -> f64 {
    0.75
}
fn default_ocr_threshold() -> f64 {
    0.85
}
fn default_allowed_extensions() -> Vec<String> {
    SUPPORTED_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_embedding_model() -> String {
    "bge-m3".to_string()
}
fn default_dims() -> usize {
    1024
}
fn default_batch_size() -> usize {
    16
}
fn default_max_chars() -> usize {
    2000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServicesConfig {
    #[serde(default)]
    pub secondary_parser_url: Option<String>,
    #[serde(default)]
    pub ocr_url: Option<String>,
    #[serde(default)]
    pub reranker_url: Option<String>,
    #[serde(default)]
    pub generator_url: Option<String>,
    #[serde(default)]
    pub parser_timeout_secs: Option<u64>,
    #[serde(default)]
    pub ocr_timeout_secs: Option<u64>,
    #[serde(default)]
    pub rerank_timeout_secs: Option<u64>,
    #[serde(default)]
    pub generator_timeout_secs: Option<u64>,
}

impl ServicesConfig {
    pub fn parser_timeout(&self) -> Duration {
        Duration::from_secs(self.parser_timeout_secs.unwrap_or(120))
    }
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs.unwrap_or(180))
    }
    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_secs(self.rerank_timeout_secs.unwrap_or(30))
    }
    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator_timeout_secs.unwrap_or(60))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_lock_key")]
    pub key: String,
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: None,
            key: default_lock_key(),
            ttl_secs: default_lock_ttl(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_lock_key() -> String {
    "gpu_lock".to_string()
}
fn default_lock_ttl() -> u64 {
    1200
}
fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Every source base path must resolve inside this directory.
    pub mount_root: PathBuf,
    #[serde(default = "default_scan_max_files")]
    pub max_files: usize,
    #[serde(default = "default_scan_max_mb")]
    pub max_mb: f64,
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_scan_max_files() -> usize {
    2000
}
fn default_scan_max_mb() -> f64 {
    2048.0
}
fn default_scan_timeout() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub keyword_top_k: usize,
    #[serde(default = "default_top_k")]
    pub vector_top_k: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_final_top_n")]
    pub final_top_n: usize,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default = "default_context_top_m")]
    pub context_top_m: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_top_k: default_top_k(),
            vector_top_k: default_top_k(),
            rrf_k: default_rrf_k(),
            final_top_n: default_final_top_n(),
            rerank_top_n: default_rerank_top_n(),
            context_top_m: default_context_top_m(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_final_top_n() -> usize {
    12
}
fn default_rerank_top_n() -> usize {
    8
}
fn default_context_top_m() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_store_backend")]
    pub queue: StoreBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub scan_interval_secs: Option<u64>,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: default_store_backend(),
            redis_url: None,
            queue_key: default_queue_key(),
            concurrency: default_concurrency(),
            scan_interval_secs: None,
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_queue_key() -> String {
    "ragtp:tasks".to_string()
}
fn default_concurrency() -> usize {
    2
}
fn default_cleanup_interval() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a TOML configuration string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.size_chars == 0 {
        anyhow::bail!("chunking.size_chars must be > 0");
    }

    // Validate parsing thresholds
    let p = &config.parsing;
    for (name, value) in [
        ("builtin_threshold", p.builtin_threshold),
        ("secondary_threshold", p.secondary_threshold),
        ("ocr_threshold", p.ocr_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("parsing.{} must be in [0.0, 1.0]", name);
        }
    }
    if p.builtin_threshold > p.secondary_threshold || p.secondary_threshold > p.ocr_threshold {
        anyhow::bail!(
            "parsing thresholds must be ascending: builtin <= secondary <= ocr"
        );
    }
    for ext in &p.allowed_extensions {
        if !SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            anyhow::bail!(
                "Unknown extension in parsing.allowed_extensions: '{}'. Must be one of pdf, docx, xlsx, txt.",
                ext
            );
        }
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate lock and queue stores
    if config.lock.backend == StoreBackend::Redis && config.lock.redis_url.is_none() {
        anyhow::bail!("lock.redis_url must be set when lock.backend = \"redis\"");
    }
    if config.lock.ttl_secs == 0 {
        anyhow::bail!("lock.ttl_secs must be > 0");
    }
    if config.worker.queue == StoreBackend::Redis && config.worker.redis_url.is_none() {
        anyhow::bail!("worker.redis_url must be set when worker.queue = \"redis\"");
    }
    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be >= 1");
    }

    // Validate retrieval
    if config.retrieval.keyword_top_k < 1 || config.retrieval.vector_top_k < 1 {
        anyhow::bail!("retrieval.keyword_top_k and retrieval.vector_top_k must be >= 1");
    }
    if config.retrieval.final_top_n < 1 {
        anyhow::bail!("retrieval.final_top_n must be >= 1");
    }
    if config.retrieval.rrf_k < 0.0 {
        anyhow::bail!("retrieval.rrf_k must be >= 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/ragtp.sqlite"

[embedding]
url = "http://embedder:8000/v1/embeddings"

[scan]
mount_root = "/mnt/nas"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.chunking.size_chars, 800);
        assert_eq!(cfg.chunking.overlap_chars, 120);
        assert_eq!(cfg.parsing.builtin_threshold, 0.65);
        assert_eq!(cfg.parsing.secondary_threshold, 0.75);
        assert_eq!(cfg.parsing.ocr_threshold, 0.85);
        assert_eq!(cfg.retrieval.rrf_k, 60.0);
        assert_eq!(cfg.lock.key, "gpu_lock");
        assert_eq!(cfg.lock.ttl_secs, 1200);
        assert_eq!(cfg.scan.max_files, 2000);
        assert_eq!(cfg.worker.queue, StoreBackend::Memory);
        assert!(cfg.parsing.is_allowed("PDF"));
        assert!(!cfg.parsing.is_allowed("pptx"));
    }

    #[test]
    fn rejects_descending_thresholds() {
        let content = format!(
            "{}\n[parsing]\nbuiltin_threshold = 0.9\nsecondary_threshold = 0.5\n",
            MINIMAL
        );
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("ascending"));
    }

    #[test]
    fn rejects_unknown_extension() {
        let content = format!("{}\n[parsing]\nallowed_extensions = [\"pptx\"]\n", MINIMAL);
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn example_config_parses() {
        let cfg = parse_config(include_str!("../config/ragtp.example.toml")).unwrap();
        assert_eq!(cfg.lock.backend, StoreBackend::Redis);
        assert_eq!(cfg.worker.queue, StoreBackend::Redis);
        assert!(cfg.services.reranker_url.is_none());
    }

    #[test]
    fn rejects_negative_or_zero_top_k() {
        let zero = format!("{}\n[retrieval]\nvector_top_k = 0\n", MINIMAL);
        let err = parse_config(&zero).unwrap_err();
        assert!(err.to_string().contains("vector_top_k"));

        let negative = format!("{}\n[retrieval]\nkeyword_top_k = -5\n", MINIMAL);
        assert!(parse_config(&negative).is_err());
    }

    #[test]
    fn redis_lock_requires_url() {
        let content = format!("{}\n[lock]\nbackend = \"redis\"\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("lock.redis_url"));
    }
}
