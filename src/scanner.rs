//! Source scanner.
//!
//! Walks a source's tree under the mount root and ingests new and changed
//! files. Both modes share the walk; they differ only in change detection:
//!
//! - [`ScanMode::Incremental`] skips files whose stored fingerprint
//!   (mtime + size) matches the filesystem and whose last ingest succeeded.
//! - [`ScanMode::FullAudit`] re-ingests every matched file.
//!
//! Three budgets are checked before each file: file count, cumulative
//! megabytes, and wall-clock time. Hitting one stops the walk and the job
//! still completes. Progress is the share of the file budget consumed,
//! capped at 90 until the walk ends.
//!
//! The directory walk runs on a blocking thread and streams candidates
//! through a bounded channel, so an early stop also stops the walk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::config::{ParsingConfig, ScanConfig};
use crate::documents::DocumentStore;
use crate::error::{PipelineError, Result};
use crate::ingest::IngestPipeline;
use crate::jobs::{JobHandle, JobTracker};
use crate::models::{Document, DocumentStatus, Fingerprint, JobStatus, JobType, Source};
use crate::paths;
use crate::sources::SourceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Incremental,
    FullAudit,
}

impl ScanMode {
    pub fn job_type(&self) -> JobType {
        match self {
            ScanMode::Incremental => JobType::ScanIncremental,
            ScanMode::FullAudit => JobType::ScanFullAudit,
        }
    }
}

/// Which budget ended a scan early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStop {
    MaxFiles,
    MaxSize,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub job_id: i64,
    pub source_id: i64,
    pub mode: ScanMode,
    /// Files admitted by the budgets.
    pub files_processed: usize,
    pub ingested: usize,
    pub unchanged: usize,
    pub megabytes: f64,
    pub stopped_by: Option<BudgetStop>,
}

/// Include-then-exclude glob filter over source-relative paths.
/// An empty include list matches everything; exclude wins on conflict.
pub struct PathFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let include = if include.is_empty() {
            None
        } else {
            Some(build_globset(include)?)
        };
        Ok(Self {
            include,
            exclude: build_globset(exclude)?,
        })
    }

    pub fn matches(&self, relative_path: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(relative_path) {
                return false;
            }
        }
        !self.exclude.is_match(relative_path)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| PipelineError::InvalidGlob(e.to_string()))?);
    }
    builder
        .build()
        .map_err(|e| PipelineError::InvalidGlob(e.to_string()))
}

/// A file that passed the glob and extension filters.
#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    relative_path: String,
    fingerprint: Fingerprint,
}

pub struct Scanner {
    sources: SourceStore,
    documents: DocumentStore,
    jobs: JobTracker,
    pipeline: Arc<IngestPipeline>,
    scan: ScanConfig,
    parsing: ParsingConfig,
}

impl Scanner {
    pub fn new(
        sources: SourceStore,
        documents: DocumentStore,
        jobs: JobTracker,
        pipeline: Arc<IngestPipeline>,
        scan: ScanConfig,
        parsing: ParsingConfig,
    ) -> Self {
        Self {
            sources,
            documents,
            jobs,
            pipeline,
            scan,
            parsing,
        }
    }

    /// Create a running job for the scan and execute it.
    pub async fn scan(&self, source_id: i64, mode: ScanMode) -> Result<ScanReport> {
        let job_id = self
            .jobs
            .create(mode.job_type(), Some(source_id), None, JobStatus::Running)
            .await?;
        self.scan_with_job(source_id, mode, JobHandle::new(self.jobs.clone(), job_id))
            .await
    }

    /// Execute a scan under an existing job. Errors mark the job failed.
    pub async fn scan_with_job(
        &self,
        source_id: i64,
        mode: ScanMode,
        job: JobHandle,
    ) -> Result<ScanReport> {
        match self.run(source_id, mode, &job).await {
            Ok(report) => {
                let summary = format!(
                    "processed {} files, ingested {}, unchanged {}",
                    report.files_processed, report.ingested, report.unchanged
                );
                job.complete(Some(summary)).await?;
                tracing::info!(
                    source_id,
                    job_id = job.id(),
                    files = report.files_processed,
                    ingested = report.ingested,
                    unchanged = report.unchanged,
                    "scan finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(source_id, job_id = job.id(), error = %e, "scan failed");
                if let Err(report) = job.fail("error", format!("scan error: {}", e)).await {
                    tracing::warn!(job_id = job.id(), error = %report, "could not record job failure");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, source_id: i64, mode: ScanMode, job: &JobHandle) -> Result<ScanReport> {
        let start_step = match mode {
            ScanMode::Incremental => "scan_start",
            ScanMode::FullAudit => "audit_start",
        };
        job.step(start_step, 5).await?;

        let source = self.sources.load_for_scan(source_id).await?;
        let base = self.resolve_base(&source)?;
        let filter = PathFilter::new(&source.include_globs, &source.exclude_globs)?;

        if !tokio::fs::metadata(&base).await?.is_dir() {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("source base is not a directory: {}", base.display()),
            )));
        }

        let (tx, mut rx) = mpsc::channel::<Candidate>(64);
        let walker = {
            let base = base.clone();
            let mount_root = self.scan.mount_root.clone();
            let follow = self.scan.follow_symlinks;
            let parsing = self.parsing.clone();
            tokio::task::spawn_blocking(move || {
                walk_candidates(&base, &mount_root, follow, &filter, &parsing, tx)
            })
        };

        let mut report = ScanReport {
            job_id: job.id(),
            source_id,
            mode,
            files_processed: 0,
            ingested: 0,
            unchanged: 0,
            megabytes: 0.0,
            stopped_by: None,
        };
        let started = Instant::now();
        let timeout = Duration::from_secs(self.scan.timeout_secs);
        let max_files = self.scan.max_files;

        let outcome: Result<()> = async {
            while let Some(candidate) = rx.recv().await {
                let file_mb = candidate.fingerprint.size_bytes as f64 / (1024.0 * 1024.0);
                let stop = if report.files_processed >= max_files {
                    Some(BudgetStop::MaxFiles)
                } else if report.megabytes + file_mb > self.scan.max_mb {
                    Some(BudgetStop::MaxSize)
                } else if started.elapsed() >= timeout {
                    Some(BudgetStop::Timeout)
                } else {
                    None
                };
                if let Some(stop) = stop {
                    tracing::warn!(source_id, ?stop, files = report.files_processed, "scan budget reached");
                    report.stopped_by = Some(stop);
                    break;
                }

                report.files_processed += 1;
                report.megabytes += file_mb;
                let progress = scan_progress(report.files_processed, max_files);
                job.step_with_message(
                    "index_file",
                    progress,
                    format!("indexing {}", candidate.relative_path),
                )
                .await?;

                if self.process(&source, mode, &candidate, job).await? {
                    report.ingested += 1;
                } else {
                    report.unchanged += 1;
                }
            }
            Ok(())
        }
        .await;

        // Dropping the receiver stops the walker at its next send.
        drop(rx);
        if let Err(e) = walker.await {
            tracing::warn!(source_id, error = %e, "walker task ended abnormally");
        }
        outcome?;
        Ok(report)
    }

    /// Returns whether the file was (re-)ingested.
    async fn process(
        &self,
        source: &Source,
        mode: ScanMode,
        candidate: &Candidate,
        job: &JobHandle,
    ) -> Result<bool> {
        let storage_path = candidate.path.to_string_lossy().to_string();
        let (doc, created) = self
            .documents
            .locate_or_create(source.id, &candidate.relative_path, &storage_path)
            .await?;

        if mode == ScanMode::Incremental && !created && is_unchanged(&doc, candidate.fingerprint) {
            tracing::debug!(document_id = %doc.id, path = %candidate.relative_path, "unchanged, skipping");
            return Ok(false);
        }

        self.documents.requeue(&doc.id, &storage_path).await?;
        self.pipeline
            .ingest(&doc.id, Some(candidate.fingerprint), Some(job))
            .await?;
        Ok(true)
    }

    fn resolve_base(&self, source: &Source) -> Result<PathBuf> {
        paths::resolve_within(&self.scan.mount_root, Path::new(&source.base_path))
    }
}

/// A document is up to date only if its last ingest succeeded for this exact
/// file state.
fn is_unchanged(doc: &Document, fingerprint: Fingerprint) -> bool {
    doc.status == DocumentStatus::Ready && doc.meta.fingerprint == Some(fingerprint)
}

/// `files / max_files * 90`, capped at 90.
pub fn scan_progress(files: usize, max_files: usize) -> i64 {
    ((files * 90) / max_files.max(1)).min(90) as i64
}

fn walk_candidates(
    base: &Path,
    mount_root: &Path,
    follow_symlinks: bool,
    filter: &PathFilter,
    parsing: &ParsingConfig,
    tx: mpsc::Sender<Candidate>,
) {
    let canonical_root = if follow_symlinks {
        std::fs::canonicalize(mount_root).ok()
    } else {
        None
    };

    for entry in WalkDir::new(base)
        .follow_links(follow_symlinks)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(base).unwrap_or(path);
        let relative_path = relative.to_string_lossy().replace('\\', "/");

        if !filter.matches(&relative_path) {
            continue;
        }
        let allowed = paths::extension_of(path)
            .map(|ext| parsing.is_allowed(&ext))
            .unwrap_or(false);
        if !allowed {
            continue;
        }

        if let Some(root) = &canonical_root {
            let inside = std::fs::canonicalize(path)
                .map(|real| real.starts_with(root))
                .unwrap_or(false);
            if !inside {
                tracing::warn!(path = %path.display(), "symlink target outside mount root, skipping");
                continue;
            }
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot stat file, skipping");
                continue;
            }
        };
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let candidate = Candidate {
            path: path.to_path_buf(),
            relative_path,
            fingerprint: Fingerprint {
                mtime_ms,
                size_bytes: metadata.len(),
            },
        };
        if tx.blocking_send(candidate).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globs(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_include_matches_everything() {
        let filter = PathFilter::new(&[], &[]).unwrap();
        assert!(filter.matches("a/b/c.pdf"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = PathFilter::new(&globs(&["**/*.pdf"]), &globs(&["archive/**"])).unwrap();
        assert!(filter.matches("reports/q1.pdf"));
        assert!(!filter.matches("archive/q1.pdf"));
        assert!(!filter.matches("reports/q1.docx"));
    }

    #[test]
    fn star_crosses_directories() {
        let filter = PathFilter::new(&globs(&["*.txt"]), &[]).unwrap();
        assert!(filter.matches("deep/nested/notes.txt"));
    }

    #[test]
    fn invalid_glob_rejected() {
        assert!(matches!(
            PathFilter::new(&globs(&["a/[b"]), &[]),
            Err(PipelineError::InvalidGlob(_))
        ));
    }

    #[test]
    fn progress_capped_at_ninety() {
        assert_eq!(scan_progress(0, 10), 0);
        assert_eq!(scan_progress(5, 10), 45);
        assert_eq!(scan_progress(10, 10), 90);
        assert_eq!(scan_progress(50, 10), 90);
        assert_eq!(scan_progress(3, 0), 90);
    }

    #[test]
    fn walker_filters_and_streams() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("dept");
        std::fs::create_dir_all(base.join("sub")).unwrap();
        std::fs::write(base.join("a.txt"), "aaa").unwrap();
        std::fs::write(base.join("sub/b.TXT"), "bbbb").unwrap();
        std::fs::write(base.join("c.pptx"), "x").unwrap();
        std::fs::write(base.join("sub/skip.txt"), "x").unwrap();

        let filter = PathFilter::new(&[], &globs(&["**/skip.txt"])).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        walk_candidates(&base, tmp.path(), false, &filter, &ParsingConfig::default(), tx);

        let mut seen = Vec::new();
        while let Ok(c) = rx.try_recv() {
            seen.push((c.relative_path, c.fingerprint.size_bytes));
        }
        assert_eq!(
            seen,
            vec![("a.txt".to_string(), 3), ("sub/b.TXT".to_string(), 4)]
        );
    }
}
