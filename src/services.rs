//! Wiring of stores, pipelines and remote collaborators.
//!
//! [`Services::connect`] builds everything from configuration. Tests build
//! [`Collaborators`] by hand (stub embedder, stub parsers, memory lock) and
//! call [`Services::build`] against a temporary database.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::answer::{AnswerService, Generator, HttpGenerator, HttpReranker, Reranker};
use crate::backends::{HttpRemoteParser, RemoteParser};
use crate::config::{Config, StoreBackend};
use crate::documents::DocumentStore;
use crate::embedding::{Embedder, HttpEmbedder};
use crate::error::{PipelineError, Result};
use crate::ingest::{IngestPipeline, IngestReport};
use crate::jobs::{JobHandle, JobTracker};
use crate::lock::{LockStore, MemoryLockStore, RedisLockStore, ResourceLock};
use crate::models::{Backend, JobStatus, JobType};
use crate::parser::ParserChain;
use crate::paths;
use crate::scanner::Scanner;
use crate::search::HybridSearch;
use crate::sources::SourceStore;
use crate::{db, migrate};

/// The replaceable outside world.
pub struct Collaborators {
    pub lock_store: Arc<dyn LockStore>,
    pub embedder: Arc<dyn Embedder>,
    pub secondary: Option<Arc<dyn RemoteParser>>,
    pub ocr: Option<Arc<dyn RemoteParser>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub generator: Option<Arc<dyn Generator>>,
}

impl Collaborators {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let lock_store: Arc<dyn LockStore> = match config.lock.backend {
            StoreBackend::Memory => Arc::new(MemoryLockStore::new()),
            StoreBackend::Redis => {
                let url = config.lock.redis_url.as_deref().unwrap_or_default();
                Arc::new(RedisLockStore::connect(url).await?)
            }
        };

        let services = &config.services;
        let secondary = match &services.secondary_parser_url {
            Some(url) => Some(Arc::new(HttpRemoteParser::new(
                Backend::Secondary,
                url.clone(),
                services.parser_timeout(),
            )?) as Arc<dyn RemoteParser>),
            None => None,
        };
        let ocr = match &services.ocr_url {
            Some(url) => Some(Arc::new(HttpRemoteParser::new(
                Backend::Ocr,
                url.clone(),
                services.ocr_timeout(),
            )?) as Arc<dyn RemoteParser>),
            None => None,
        };
        let reranker = match &services.reranker_url {
            Some(url) => Some(
                Arc::new(HttpReranker::new(url.clone(), services.rerank_timeout())?) as Arc<dyn Reranker>,
            ),
            None => None,
        };
        let generator = match &services.generator_url {
            Some(url) => Some(Arc::new(HttpGenerator::new(
                url.clone(),
                services.generator_timeout(),
            )?) as Arc<dyn Generator>),
            None => None,
        };

        Ok(Self {
            lock_store,
            embedder: Arc::new(HttpEmbedder::new(&config.embedding)?),
            secondary,
            ocr,
            reranker,
            generator,
        })
    }
}

/// Result of accepting an uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub document_id: String,
    pub job_id: i64,
    pub storage_path: String,
}

pub struct Services {
    pub config: Config,
    pub pool: SqlitePool,
    pub documents: DocumentStore,
    pub sources: SourceStore,
    pub jobs: JobTracker,
    pub pipeline: Arc<IngestPipeline>,
    pub scanner: Scanner,
    pub search: Arc<HybridSearch>,
    pub answers: AnswerService,
}

impl Services {
    /// Open the database, apply the schema and build every collaborator from config.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate(&pool).await?;
        let collaborators = Collaborators::from_config(&config)
            .await
            .context("Failed to set up remote services")?;
        Ok(Self::build(config, pool, collaborators))
    }

    pub fn build(config: Config, pool: SqlitePool, collaborators: Collaborators) -> Self {
        let documents = DocumentStore::new(pool.clone());
        let sources = SourceStore::new(pool.clone());
        let jobs = JobTracker::new(pool.clone());

        let lock = ResourceLock::from_config(collaborators.lock_store, &config.lock);
        let parser = Arc::new(ParserChain::new(
            config.parsing.clone(),
            collaborators.secondary,
            collaborators.ocr,
            lock,
        ));
        let pipeline = Arc::new(IngestPipeline::new(
            documents.clone(),
            parser,
            collaborators.embedder.clone(),
            config.chunking.clone(),
            config.parsing.clone(),
            config.embedding.batch_size,
        ));
        let scanner = Scanner::new(
            sources.clone(),
            documents.clone(),
            jobs.clone(),
            pipeline.clone(),
            config.scan.clone(),
            config.parsing.clone(),
        );
        let search = Arc::new(HybridSearch::new(
            pool.clone(),
            collaborators.embedder,
            config.retrieval.clone(),
        ));
        let answers = AnswerService::new(
            search.clone(),
            collaborators.reranker,
            collaborators.generator,
            config.retrieval.clone(),
        );

        Self {
            config,
            pool,
            documents,
            sources,
            jobs,
            pipeline,
            scanner,
            search,
            answers,
        }
    }

    /// Accept a user file as a `temp` document with a queued ingest job.
    ///
    /// Validation runs before anything is written. The file is copied into
    /// the upload directory under a uuid-prefixed name.
    pub async fn upload(&self, file: &Path) -> Result<Upload> {
        let ext = paths::extension_of(file).unwrap_or_default();
        if !self.config.parsing.is_allowed(&ext) {
            return Err(PipelineError::UnsupportedFormat(ext));
        }

        let size = tokio::fs::metadata(file).await?.len();
        let size_mb = size as f64 / (1024.0 * 1024.0);
        let limit_mb = self.config.uploads.max_mb;
        if size_mb > limit_mb as f64 {
            return Err(PipelineError::FileTooLarge { size_mb, limit_mb });
        }

        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("upload.{}", ext));
        let upload_dir = &self.config.uploads.dir;
        tokio::fs::create_dir_all(upload_dir).await?;
        let stored = upload_dir.join(format!("{}_{}", Uuid::new_v4(), file_name));
        tokio::fs::copy(file, &stored).await?;
        let storage_path = stored.to_string_lossy().to_string();

        let doc = self
            .documents
            .create_temp(&file_name, &storage_path, self.config.uploads.temp_ttl_hours)
            .await?;
        let job_id = self
            .jobs
            .create(JobType::IngestUpload, None, Some(&doc.id), JobStatus::Queued)
            .await?;

        tracing::info!(document_id = %doc.id, job_id, size_bytes = size, "upload accepted");
        Ok(Upload {
            document_id: doc.id,
            job_id,
            storage_path,
        })
    }

    /// Run the ingest job created by [`Services::upload`] and complete it.
    pub async fn ingest_upload(&self, document_id: &str, job_id: i64) -> Result<IngestReport> {
        let job = JobHandle::new(self.jobs.clone(), job_id);
        let report = self.pipeline.ingest(document_id, None, Some(&job)).await?;
        let summary = format!("{} chunks via {}", report.chunks, report.parser_used);
        job.complete(Some(summary)).await?;
        Ok(report)
    }

    /// Soft-delete expired temp documents. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self.documents.cleanup_expired(Utc::now().timestamp()).await?;
        if removed > 0 {
            tracing::info!(removed, "expired temp documents removed");
        }
        Ok(removed)
    }
}
