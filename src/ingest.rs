//! Ingestion pipeline orchestration.
//!
//! Coordinates the per-document flow: validate → parse (fallback chain) →
//! chunk → embed → store. Each step is reported to the job, if any, at a
//! fixed checkpoint:
//!
//! | Step | Progress |
//! |------|----------|
//! | `read_document` | 10 |
//! | `secondary_parser` | 35 (PDF escalation only) |
//! | `ocr` | 55 (PDF escalation only) |
//! | `chunk_embed` | 75 |
//!
//! Re-running is safe: the chunk set and the file fingerprint are replaced
//! in the same transaction that marks the document `ready`. Remote calls
//! (parsers, embedder) happen before that transaction opens. On failure the
//! document and job are both marked `failed`, the previous chunks and
//! fingerprint stay as they were, and the error is returned to the caller. Completing the
//! job is left to the caller, since a scan ingests many documents under
//! one job.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, ParsingConfig};
use crate::documents::DocumentStore;
use crate::embedding::{embed_batched, Embedder};
use crate::error::{PipelineError, Result};
use crate::jobs::JobHandle;
use crate::models::{Backend, DocumentStatus, Fingerprint};
use crate::parser::ParserChain;
use crate::paths;

/// Summary of a successful ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks: usize,
    pub parser_used: Backend,
    pub quality_score: f64,
    pub warnings: Vec<String>,
}

pub struct IngestPipeline {
    documents: DocumentStore,
    parser: Arc<ParserChain>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    parsing: ParsingConfig,
    batch_size: usize,
}

impl IngestPipeline {
    pub fn new(
        documents: DocumentStore,
        parser: Arc<ParserChain>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        parsing: ParsingConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            documents,
            parser,
            embedder,
            chunking,
            parsing,
            batch_size,
        }
    }

    /// Ingest one document, replacing any chunks it already has.
    ///
    /// `fingerprint` is the scanned file's state; it is stored only if the
    /// ingest commits.
    pub async fn ingest(
        &self,
        document_id: &str,
        fingerprint: Option<Fingerprint>,
        job: Option<&JobHandle>,
    ) -> Result<IngestReport> {
        let mut step = "read_document";
        match self.run(document_id, fingerprint, job, &mut step).await {
            Ok(report) => {
                tracing::info!(
                    document_id,
                    chunks = report.chunks,
                    parser = %report.parser_used,
                    quality = report.quality_score,
                    "document ingested"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(document_id, step, error = %e, "ingestion failed");
                if !matches!(e, PipelineError::DocumentNotFound(_)) {
                    if let Err(mark) = self.documents.mark_failed(document_id, &e.to_string()).await {
                        tracing::warn!(document_id, error = %mark, "could not mark document failed");
                    }
                }
                if let Some(job) = job {
                    if let Err(report) = job.fail(step, format!("pipeline error: {}", e)).await {
                        tracing::warn!(job_id = job.id(), error = %report, "could not record job failure");
                    }
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        document_id: &str,
        fingerprint: Option<Fingerprint>,
        job: Option<&JobHandle>,
        step: &mut &'static str,
    ) -> Result<IngestReport> {
        if let Some(job) = job {
            job.step("read_document", 10).await?;
        }
        let doc = self.documents.require(document_id).await?;
        let path = PathBuf::from(&doc.storage_path);

        *step = "validate_extension";
        let ext = paths::extension_of(&path).unwrap_or_default();
        if !self.parsing.is_allowed(&ext) {
            return Err(PipelineError::UnsupportedFormat(ext));
        }

        *step = "parse";
        self.documents
            .set_status(document_id, DocumentStatus::Running)
            .await?;
        let extraction = self.parser.extract(&path, job).await?;

        *step = "chunk_embed";
        if let Some(job) = job {
            job.step("chunk_embed", 75).await?;
        }
        let chunks = chunk_text(
            document_id,
            &extraction.text,
            self.chunking.size_chars,
            self.chunking.overlap_chars,
            &extraction.segments,
        );
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = embed_batched(self.embedder.as_ref(), &texts, self.batch_size).await?;
        tracing::debug!(document_id, chunks = chunks.len(), "chunks embedded");

        *step = "store";
        let warnings = extraction.warnings.clone();
        self.documents
            .complete_ingest(document_id, &chunks, &embeddings, |meta| {
                meta.parser_used = Some(extraction.backend_used);
                meta.backends_tried = extraction.backends_tried.clone();
                meta.quality_score = Some(extraction.quality_score);
                meta.warnings = extraction.warnings.clone();
                meta.ocr_pages_processed = extraction.pages_ocred;
                if fingerprint.is_some() {
                    meta.fingerprint = fingerprint;
                }
                meta.extra.remove("error");
            })
            .await?;

        Ok(IngestReport {
            document_id: document_id.to_string(),
            chunks: chunks.len(),
            parser_used: extraction.backend_used,
            quality_score: extraction.quality_score,
            warnings,
        })
    }
}
