//! Quality-gated parser fallback chain.
//!
//! Backends run in a fixed order: builtin, then the remote secondary
//! parser, then remote OCR. Only PDFs escalate past builtin. After each
//! stage, [`decide`] compares the best score so far against the threshold
//! of the stage that just ran:
//!
//! | After | Threshold | Next |
//! |-------|-----------|------|
//! | builtin | `builtin_threshold` | secondary |
//! | secondary | `secondary_threshold` | ocr |
//! | ocr | `ocr_threshold` | (warning only) |
//!
//! A stage's output replaces the running best only when its score is
//! strictly higher, so the selected score is always the maximum among the
//! stages that ran. Remote calls are serialized system-wide by the
//! [`ResourceLock`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backends::RemoteParser;
use crate::config::{ParsingConfig, SUPPORTED_EXTENSIONS};
use crate::error::{PipelineError, Result};
use crate::extract::{self, Segment};
use crate::jobs::JobHandle;
use crate::lock::ResourceLock;
use crate::models::Backend;
use crate::paths;

/// Warning recorded when even the best result is below the OCR threshold.
pub const LOW_QUALITY_WARNING: &str = "low extraction quality";

/// What to do after a stage has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Best score meets the stage threshold.
    Accept,
    /// Below threshold and another backend is available.
    Escalate,
    /// Below threshold with nothing left to try; keep the best result.
    Exhausted,
}

/// Pure escalation policy.
pub fn decide(best_score: f64, threshold: f64, next_available: bool) -> Decision {
    if best_score >= threshold {
        Decision::Accept
    } else if next_available {
        Decision::Escalate
    } else {
        Decision::Exhausted
    }
}

/// Result of running the chain on one file.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub quality_score: f64,
    /// Backend whose output was selected.
    pub backend_used: Backend,
    /// Every backend invoked, in order.
    pub backends_tried: Vec<Backend>,
    pub warnings: Vec<String>,
    pub pages_ocred: Option<u32>,
    pub segments: Vec<Segment>,
}

struct Candidate {
    text: String,
    score: f64,
    backend: Backend,
    segments: Vec<Segment>,
}

pub struct ParserChain {
    thresholds: ParsingConfig,
    secondary: Option<Arc<dyn RemoteParser>>,
    ocr: Option<Arc<dyn RemoteParser>>,
    lock: ResourceLock,
}

impl ParserChain {
    pub fn new(
        thresholds: ParsingConfig,
        secondary: Option<Arc<dyn RemoteParser>>,
        ocr: Option<Arc<dyn RemoteParser>>,
        lock: ResourceLock,
    ) -> Self {
        Self {
            thresholds,
            secondary,
            ocr,
            lock,
        }
    }

    fn threshold_after(&self, stage: Backend) -> f64 {
        match stage {
            Backend::Builtin => self.thresholds.builtin_threshold,
            Backend::Secondary => self.thresholds.secondary_threshold,
            Backend::Ocr => self.thresholds.ocr_threshold,
        }
    }

    /// Extract text from `path`, escalating PDFs through remote backends.
    pub async fn extract(&self, path: &Path, job: Option<&JobHandle>) -> Result<Extraction> {
        let ext = paths::extension_of(path).unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(PipelineError::UnsupportedFormat(ext));
        }

        let mut tried = vec![Backend::Builtin];
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut best: Option<Candidate> = match run_builtin(path.to_path_buf(), ext.clone()).await
        {
            Ok(c) => Some(c),
            Err(e) if ext == "pdf" => {
                tracing::warn!(path = %path.display(), error = %e, "builtin PDF extraction failed");
                warnings.push(e.to_string());
                errors.push(e.to_string());
                None
            }
            Err(e) => return Err(e),
        };

        let mut pages_ocred = None;
        if ext == "pdf" {
            let remotes: Vec<&Arc<dyn RemoteParser>> =
                [self.secondary.as_ref(), self.ocr.as_ref()].into_iter().flatten().collect();
            let mut remaining = remotes.into_iter();
            let mut stage = Backend::Builtin;

            loop {
                let best_score = best.as_ref().map(|c| c.score).unwrap_or(0.0);
                let next = remaining.next();
                match decide(best_score, self.threshold_after(stage), next.is_some()) {
                    Decision::Accept | Decision::Exhausted => break,
                    Decision::Escalate => {}
                }
                let Some(remote) = next else { break };
                let backend = remote.backend();
                tracing::info!(
                    path = %path.display(),
                    from = %stage,
                    to = %backend,
                    score = best_score,
                    "escalating parser"
                );
                if let Some(job) = job {
                    job.step(stage_step(backend), stage_progress(backend)).await?;
                }

                tried.push(backend);
                stage = backend;
                let outcome = self
                    .lock
                    .with_exclusive_access(|| remote.parse(path))
                    .await;
                match outcome {
                    Ok(out) => {
                        if backend == Backend::Ocr {
                            pages_ocred = out.pages_processed;
                        }
                        if out.quality_score > best_score || best.is_none() {
                            best = Some(Candidate {
                                text: out.text,
                                score: out.quality_score,
                                backend,
                                segments: Vec::new(),
                            });
                        }
                    }
                    Err(e @ PipelineError::ParseFailure { .. })
                    | Err(e @ PipelineError::RemoteBackendUnavailable(_)) => {
                        tracing::warn!(path = %path.display(), backend = %backend, error = %e, "remote parser failed");
                        warnings.push(e.to_string());
                        errors.push(e.to_string());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let best = match best {
            Some(c) if !(c.text.trim().is_empty() && !errors.is_empty()) => c,
            _ => {
                let last = tried.last().copied().unwrap_or(Backend::Builtin);
                return Err(PipelineError::parse(
                    last,
                    format!("no usable text extracted: {}", errors.join("; ")),
                ));
            }
        };

        if ext == "pdf" && best.score < self.thresholds.ocr_threshold {
            warnings.push(LOW_QUALITY_WARNING.to_string());
        }

        Ok(Extraction {
            text: best.text,
            quality_score: best.score,
            backend_used: best.backend,
            backends_tried: tried,
            warnings,
            pages_ocred,
            segments: best.segments,
        })
    }
}

fn stage_step(backend: Backend) -> &'static str {
    match backend {
        Backend::Builtin => "read_document",
        Backend::Secondary => "secondary_parser",
        Backend::Ocr => "ocr",
    }
}

fn stage_progress(backend: Backend) -> i64 {
    match backend {
        Backend::Builtin => 10,
        Backend::Secondary => 35,
        Backend::Ocr => 55,
    }
}

async fn run_builtin(path: PathBuf, ext: String) -> Result<Candidate> {
    let joined = tokio::task::spawn_blocking(move || extract::extract_file(&path, &ext)).await;
    let out = match joined {
        Ok(Ok(out)) => out,
        Ok(Err(extract::ExtractError::UnsupportedFormat(ext))) => {
            return Err(PipelineError::UnsupportedFormat(ext))
        }
        Ok(Err(e)) => return Err(PipelineError::parse(Backend::Builtin, e.to_string())),
        Err(e) => return Err(PipelineError::parse(Backend::Builtin, e.to_string())),
    };
    Ok(Candidate {
        text: out.text,
        score: out.quality_score,
        backend: Backend::Builtin,
        segments: out.segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::RemoteExtraction;
    use crate::lock::{LockStore, MemoryLockStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedParser {
        backend: Backend,
        text: &'static str,
        score: f64,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FixedParser {
        fn new(backend: Backend, text: &'static str, score: f64) -> Arc<Self> {
            Arc::new(Self {
                backend,
                text,
                score,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(backend: Backend) -> Arc<Self> {
            Arc::new(Self {
                backend,
                text: "",
                score: 0.0,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteParser for FixedParser {
        fn backend(&self) -> Backend {
            self.backend
        }

        async fn parse(&self, _file_path: &Path) -> Result<RemoteExtraction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::parse(self.backend, "service down"));
            }
            Ok(RemoteExtraction {
                text: self.text.to_string(),
                quality_score: self.score,
                pages_processed: (self.backend == Backend::Ocr).then_some(4),
            })
        }
    }

    fn chain(
        store: Arc<dyn LockStore>,
        secondary: Option<Arc<FixedParser>>,
        ocr: Option<Arc<FixedParser>>,
    ) -> ParserChain {
        let lock = ResourceLock::new(
            store,
            "gpu_lock",
            Duration::from_millis(200),
            Duration::from_millis(5),
        );
        ParserChain::new(
            ParsingConfig::default(),
            secondary.map(|p| p as Arc<dyn RemoteParser>),
            ocr.map(|p| p as Arc<dyn RemoteParser>),
            lock,
        )
    }

    /// A file with a `.pdf` name that the builtin extractor cannot read.
    fn broken_pdf(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("scan.pdf");
        std::fs::write(&path, b"not really a pdf").unwrap();
        path
    }

    #[test]
    fn decide_policy() {
        assert_eq!(decide(0.70, 0.65, true), Decision::Accept);
        assert_eq!(decide(0.65, 0.65, true), Decision::Accept);
        assert_eq!(decide(0.64, 0.65, true), Decision::Escalate);
        assert_eq!(decide(0.64, 0.65, false), Decision::Exhausted);
    }

    #[tokio::test]
    async fn text_files_never_escalate() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "short").unwrap();

        let secondary = FixedParser::new(Backend::Secondary, "remote", 1.0);
        let chain = chain(Arc::new(MemoryLockStore::new()), Some(secondary.clone()), None);
        let out = chain.extract(&path, None).await.unwrap();

        assert_eq!(out.text, "short");
        assert_eq!(out.backend_used, Backend::Builtin);
        assert_eq!(out.backends_tried, vec![Backend::Builtin]);
        assert!(out.warnings.is_empty());
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_extension_fails_fast() {
        let chain = chain(Arc::new(MemoryLockStore::new()), None, None);
        let err = chain
            .extract(Path::new("/nowhere/deck.pptx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(ext) if ext == "pptx"));
    }

    #[tokio::test]
    async fn secondary_above_threshold_skips_ocr() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = broken_pdf(&dir);
        let secondary = FixedParser::new(Backend::Secondary, "layout text", 0.80);
        let ocr = FixedParser::new(Backend::Ocr, "ocr text", 0.99);

        let chain = chain(
            Arc::new(MemoryLockStore::new()),
            Some(secondary.clone()),
            Some(ocr.clone()),
        );
        let out = chain.extract(&path, None).await.unwrap();

        assert_eq!(out.text, "layout text");
        assert_eq!(out.backend_used, Backend::Secondary);
        assert_eq!(out.backends_tried, vec![Backend::Builtin, Backend::Secondary]);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
        // builtin failure is kept as a warning; quality is below OCR threshold
        assert_eq!(out.warnings.len(), 2);
        assert_eq!(out.warnings[1], LOW_QUALITY_WARNING);
    }

    #[tokio::test]
    async fn lower_later_score_never_overwrites() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = broken_pdf(&dir);
        let secondary = FixedParser::new(Backend::Secondary, "better", 0.50);
        let ocr = FixedParser::new(Backend::Ocr, "worse", 0.30);

        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let chain = chain(store.clone(), Some(secondary), Some(ocr.clone()));
        let out = chain.extract(&path, None).await.unwrap();

        assert_eq!(out.text, "better");
        assert_eq!(out.quality_score, 0.50);
        assert_eq!(out.backend_used, Backend::Secondary);
        assert_eq!(
            out.backends_tried,
            vec![Backend::Builtin, Backend::Secondary, Backend::Ocr]
        );
        assert_eq!(out.pages_ocred, Some(4));
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
        assert!(out.warnings.iter().any(|w| w == LOW_QUALITY_WARNING));

        // lock released after the chain finished
        assert!(store
            .try_acquire("gpu_lock", "probe", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn remote_failure_falls_through_to_ocr() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = broken_pdf(&dir);
        let secondary = FixedParser::failing(Backend::Secondary);
        let ocr = FixedParser::new(Backend::Ocr, "ocr text", 0.90);

        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let chain = chain(store.clone(), Some(secondary), Some(ocr));
        let out = chain.extract(&path, None).await.unwrap();

        assert_eq!(out.text, "ocr text");
        assert_eq!(out.backend_used, Backend::Ocr);
        assert!(!out.warnings.iter().any(|w| w == LOW_QUALITY_WARNING));
        assert!(store
            .try_acquire("gpu_lock", "probe", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn every_backend_failing_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = broken_pdf(&dir);
        let chain = chain(
            Arc::new(MemoryLockStore::new()),
            Some(FixedParser::failing(Backend::Secondary)),
            Some(FixedParser::failing(Backend::Ocr)),
        );
        let err = chain.extract(&path, None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ParseFailure {
                backend: Backend::Ocr,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn lock_timeout_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = broken_pdf(&dir);
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        store
            .try_acquire("gpu_lock", "busy", Duration::from_secs(60))
            .await
            .unwrap();
        let secondary = FixedParser::new(Backend::Secondary, "x", 1.0);

        let chain = chain(store, Some(secondary.clone()), None);
        let err = chain.extract(&path, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::LockTimeout(_)));
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }
}
