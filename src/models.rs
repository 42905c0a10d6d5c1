//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, jobs, and sources that flow
//! through ingestion, scanning, and retrieval. Enum-valued columns are
//! stored as lowercase TEXT.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Ad-hoc upload with an expiry.
    Temp,
    /// Found by scanning a configured source tree.
    Nas,
}

impl Scope {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scope::Temp => "temp",
            Scope::Nas => "nas",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temp" => Some(Scope::Temp),
            "nas" => Some(Scope::Nas),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Queued,
    Running,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Queued => "queued",
            DocumentStatus::Running => "running",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(DocumentStatus::Queued),
            "running" => Some(DocumentStatus::Running),
            "ready" => Some(DocumentStatus::Ready),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IngestUpload,
    ScanIncremental,
    ScanFullAudit,
}

impl JobType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobType::IngestUpload => "ingest_upload",
            JobType::ScanIncremental => "scan_incremental",
            JobType::ScanFullAudit => "scan_full_audit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest_upload" => Some(JobType::IngestUpload),
            "scan_incremental" => Some(JobType::ScanIncremental),
            "scan_full_audit" => Some(JobType::ScanFullAudit),
            _ => None,
        }
    }
}

/// Parsing backends, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Builtin,
    Secondary,
    Ocr,
}

impl Backend {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Backend::Builtin => "builtin",
            Backend::Secondary => "secondary",
            Backend::Ocr => "ocr",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Modification-time + byte-size pair used for change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub mtime_ms: i64,
    pub size_bytes: u64,
}

/// Typed view of the `documents.meta` JSON column.
///
/// Known keys are named fields; anything else written by older versions or
/// other tools is preserved in `extra` across read-modify-write cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_used: Option<Backend>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends_tried: Vec<Backend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_pages_processed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DocumentMeta {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// A unit of content stored in SQLite.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_id: Option<i64>,
    pub scope: Scope,
    pub title: String,
    pub storage_path: String,
    pub relative_path: String,
    pub status: DocumentStatus,
    pub meta: DocumentMeta,
    pub expires_at: Option<i64>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
}

/// A contiguous slice of a document's extracted text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub hash: String,
    /// Page or sheet label, when the extractor knows it.
    pub page_or_sheet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub source_id: Option<i64>,
    pub document_id: Option<String>,
    pub status: JobStatus,
    pub progress: i64,
    pub current_step: String,
    pub message: Option<String>,
    pub queue_position: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStep {
    pub id: i64,
    pub job_id: i64,
    pub step_name: String,
    pub status: JobStatus,
    pub progress: i64,
    pub message: Option<String>,
}

/// A configured, recurring file-tree origin.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: i64,
    pub base_path: String,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub enabled: bool,
}
