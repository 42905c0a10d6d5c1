//! Shared fixtures for integration tests: a temp database, a mount root,
//! and deterministic in-process stand-ins for every remote service.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use ragtp::backends::{RemoteExtraction, RemoteParser};
use ragtp::config::{parse_config, Config};
use ragtp::embedding::{normalize, Embedder};
use ragtp::error::{PipelineError, Result};
use ragtp::lock::MemoryLockStore;
use ragtp::models::Backend;
use ragtp::services::{Collaborators, Services};

pub const DIMS: usize = 64;

/// Bag-of-words hashing embedder: texts sharing words get similar vectors.
pub struct HashEmbedder;

fn token_slot(token: &str) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in token.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % DIMS as u64) as usize
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        v[token_slot(&token.to_lowercase())] += 1.0;
    }
    if v.iter().all(|x| *x == 0.0) {
        v[0] = 1.0;
    }
    normalize(&mut v);
    v
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

/// [`HashEmbedder`] that can be taken offline mid-test.
pub struct SwitchEmbedder {
    down: AtomicBool,
}

impl SwitchEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl Embedder for SwitchEmbedder {
    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(PipelineError::Embedding("embedder down".into()));
        }
        HashEmbedder.embed(texts).await
    }
}

/// Remote parser returning a fixed result and counting calls.
pub struct StubParser {
    pub backend: Backend,
    pub text: String,
    pub score: f64,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl StubParser {
    pub fn new(backend: Backend, text: &str, score: f64) -> Arc<Self> {
        Arc::new(Self {
            backend,
            text: text.to_string(),
            score,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(backend: Backend) -> Arc<Self> {
        Arc::new(Self {
            backend,
            text: String::new(),
            score: 0.0,
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteParser for StubParser {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn parse(&self, _path: &Path) -> Result<RemoteExtraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PipelineError::RemoteBackendUnavailable(format!(
                "{} offline",
                self.backend
            )));
        }
        Ok(RemoteExtraction {
            text: self.text.clone(),
            quality_score: self.score,
            pages_processed: Some(1),
        })
    }
}

pub struct TestEnv {
    pub tmp: TempDir,
    pub mount: PathBuf,
    pub services: Services,
}

/// Knobs the integration tests vary.
pub struct TestOptions {
    pub max_files: usize,
    pub max_mb: f64,
    pub timeout_secs: u64,
    pub embedder: Arc<dyn Embedder>,
    pub secondary: Option<Arc<dyn RemoteParser>>,
    pub ocr: Option<Arc<dyn RemoteParser>>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            max_files: 2000,
            max_mb: 1024.0,
            timeout_secs: 900,
            embedder: Arc::new(HashEmbedder),
            secondary: None,
            ocr: None,
        }
    }
}

pub fn config_toml(root: &Path, options: &TestOptions) -> String {
    format!(
        r#"
[db]
path = "{root}/data/ragtp.sqlite"

[uploads]
dir = "{root}/uploads"

[embedding]
url = "http://127.0.0.1:9/v1/embeddings"
dims = {dims}

[lock]
poll_interval_ms = 10
ttl_secs = 5

[scan]
mount_root = "{root}/mnt"
max_files = {max_files}
max_mb = {max_mb:?}
timeout_secs = {timeout_secs}
"#,
        root = root.display(),
        dims = DIMS,
        max_files = options.max_files,
        max_mb = options.max_mb,
        timeout_secs = options.timeout_secs,
    )
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_max_files(max_files: usize) -> Self {
        Self::with_options(TestOptions {
            max_files,
            ..TestOptions::default()
        })
        .await
    }

    pub async fn with_parsers(
        secondary: Option<Arc<dyn RemoteParser>>,
        ocr: Option<Arc<dyn RemoteParser>>,
    ) -> Self {
        Self::with_options(TestOptions {
            secondary,
            ocr,
            ..TestOptions::default()
        })
        .await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let tmp = TempDir::new().unwrap();
        let mount = tmp.path().join("mnt");
        fs::create_dir_all(&mount).unwrap();

        let config: Config = parse_config(&config_toml(tmp.path(), &options)).unwrap();
        let pool = ragtp::db::connect(&config).await.unwrap();
        ragtp::migrate::migrate(&pool).await.unwrap();

        let collaborators = Collaborators {
            lock_store: Arc::new(MemoryLockStore::new()),
            embedder: options.embedder,
            secondary: options.secondary,
            ocr: options.ocr,
            reranker: None,
            generator: None,
        };
        let services = Services::build(config, pool, collaborators);
        Self {
            tmp,
            mount,
            services,
        }
    }

    /// Write a file under the mount root, creating parent directories.
    pub fn write_mount(&self, relative: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.mount.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// Write a file outside the mount root (an upload candidate).
    pub fn write_outside(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let dir = self.tmp.path().join("incoming");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }
}

/// `len` chars of filler words with `marker` placed at char offset `at`.
pub fn text_with_marker(len: usize, marker: &str, at: usize) -> String {
    let words = ["river", "stone", "window", "garden", "letter", "market", "silver"];
    let mut filler = String::new();
    let mut i = 0;
    while filler.chars().count() < len {
        filler.push_str(words[i % words.len()]);
        filler.push(' ');
        i += 1;
    }
    let mut chars: Vec<char> = filler.chars().take(len).collect();
    chars[at - 1] = ' ';
    for (offset, c) in marker.chars().enumerate() {
        chars[at + offset] = c;
    }
    chars[at + marker.chars().count()] = ' ';
    chars.into_iter().collect()
}

/// Minimal DOCX with one paragraph per entry.
pub fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("word/document.xml", options).unwrap();
        zip.write_all(document.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf.into_inner()
}
