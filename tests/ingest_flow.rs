//! Upload → parse → chunk → embed → store, exercised through the library.

mod common;

use std::sync::Arc;

use common::{docx_with_paragraphs, text_with_marker, StubParser, TestEnv};
use ragtp::backends::RemoteParser;
use ragtp::error::PipelineError;
use ragtp::models::{Backend, DocumentStatus, JobStatus, Scope};
use ragtp::parser::LOW_QUALITY_WARNING;
use ragtp::search::{ScopeFilter, SearchRequest};

fn temp_request(document_id: &str, query: &str) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        scope: ScopeFilter::Temp {
            document_id: document_id.to_string(),
        },
        path_prefix: None,
        top_n: 12,
    }
}

#[tokio::test]
async fn txt_upload_is_chunked_and_searchable() {
    let env = TestEnv::new().await;
    let text = text_with_marker(6000, "zanzibarite", 3000);
    assert_eq!(text.chars().count(), 6000);
    let file = env.write_outside("notes.txt", &text);

    let upload = env.services.upload(&file).await.unwrap();
    let report = env
        .services
        .ingest_upload(&upload.document_id, upload.job_id)
        .await
        .unwrap();
    assert_eq!(report.chunks, 9);
    assert_eq!(report.parser_used, Backend::Builtin);

    let chunks = env.services.documents.chunks(&upload.document_id).await.unwrap();
    assert_eq!(chunks.len(), 9);
    assert_eq!(chunks[0].content.chars().count(), 800);
    assert_eq!(chunks[8].content.chars().count(), 560);
    let indexes: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indexes, (0..9).collect::<Vec<_>>());

    let doc = env.services.documents.require(&upload.document_id).await.unwrap();
    assert_eq!(doc.scope, Scope::Temp);
    assert_eq!(doc.status, DocumentStatus::Ready);
    assert_eq!(doc.title, "notes.txt");
    assert!(doc.expires_at.is_some());
    assert_eq!(doc.meta.parser_used, Some(Backend::Builtin));
    assert_eq!(doc.meta.backends_tried, vec![Backend::Builtin]);

    let hits = env
        .services
        .search
        .search(&temp_request(&upload.document_id, "zanzibarite"))
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].chunk_index, 4);
    assert_eq!(hits[0].keyword_rank, Some(1));
    assert!(hits[0].content.contains("zanzibarite"));
}

#[tokio::test]
async fn upload_job_records_steps_and_completes() {
    let env = TestEnv::new().await;
    let file = env.write_outside("short.txt", "a short note about invoices");

    let upload = env.services.upload(&file).await.unwrap();
    let queued = env.services.jobs.get(upload.job_id).await.unwrap().unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.queue_position, Some(1));

    env.services
        .ingest_upload(&upload.document_id, upload.job_id)
        .await
        .unwrap();

    let job = env.services.jobs.get(upload.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.queue_position, None);

    let steps = env.services.jobs.steps(upload.job_id).await.unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, vec!["read_document", "chunk_embed", "done"]);
    for pair in steps.windows(2) {
        assert!(pair[0].progress <= pair[1].progress);
    }
}

#[tokio::test]
async fn unsupported_upload_fails_before_side_effects() {
    let env = TestEnv::new().await;
    let file = env.write_outside("slides.pptx", "not really a deck");

    let err = env.services.upload(&file).await.unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedFormat(ref ext) if ext == "pptx"));

    let uploads = env.tmp.path().join("uploads");
    let stored = std::fs::read_dir(&uploads).map(|d| d.count()).unwrap_or(0);
    assert_eq!(stored, 0);
    assert!(env.services.jobs.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn docx_upload_extracts_paragraphs() {
    let env = TestEnv::new().await;
    let file = env.write_outside(
        "memo.docx",
        docx_with_paragraphs(&["Quarterly budget review", "The ferry schedule changes in May"]),
    );

    let upload = env.services.upload(&file).await.unwrap();
    env.services
        .ingest_upload(&upload.document_id, upload.job_id)
        .await
        .unwrap();

    let chunks = env.services.documents.chunks(&upload.document_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(
        chunks[0].content,
        "Quarterly budget review\nThe ferry schedule changes in May"
    );
}

#[tokio::test]
async fn temp_scope_only_sees_its_document() {
    let env = TestEnv::new().await;
    let a = env.write_outside("a.txt", "the lighthouse keeper logs every storm");
    let b = env.write_outside("b.txt", "the lighthouse was painted red");

    let first = env.services.upload(&a).await.unwrap();
    env.services
        .ingest_upload(&first.document_id, first.job_id)
        .await
        .unwrap();
    let second = env.services.upload(&b).await.unwrap();
    env.services
        .ingest_upload(&second.document_id, second.job_id)
        .await
        .unwrap();

    let hits = env
        .services
        .search
        .search(&temp_request(&second.document_id, "lighthouse"))
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.document_id == second.document_id));

    // Uploads never leak into source-scoped queries.
    let nas = env
        .services
        .search
        .search(&SearchRequest {
            query: "lighthouse".into(),
            scope: ScopeFilter::Sources { source_ids: vec![] },
            path_prefix: None,
            top_n: 12,
        })
        .await
        .unwrap();
    assert!(nas.is_empty());
}

#[tokio::test]
async fn expired_uploads_disappear_from_search() {
    let env = TestEnv::new().await;
    let file = env.write_outside("old.txt", "archived meeting minutes");
    let upload = env.services.upload(&file).await.unwrap();
    env.services
        .ingest_upload(&upload.document_id, upload.job_id)
        .await
        .unwrap();

    // Nothing has expired yet.
    assert_eq!(env.services.cleanup_expired().await.unwrap(), 0);

    let far_future = chrono::Utc::now().timestamp() + 48 * 3600;
    let removed = env.services.documents.cleanup_expired(far_future).await.unwrap();
    assert_eq!(removed, 1);

    let doc = env.services.documents.require(&upload.document_id).await.unwrap();
    assert!(doc.deleted_at.is_some());
    let hits = env
        .services
        .search
        .search(&temp_request(&upload.document_id, "minutes"))
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn broken_pdf_escalates_to_secondary_parser() {
    let secondary = StubParser::new(Backend::Secondary, "recovered contract text", 0.9);
    let ocr = StubParser::new(Backend::Ocr, "ocr text", 0.99);
    let env = TestEnv::with_parsers(
        Some(secondary.clone() as Arc<dyn RemoteParser>),
        Some(ocr.clone() as Arc<dyn RemoteParser>),
    )
    .await;
    let file = env.write_outside("scan.pdf", b"%PDF-1.4 truncated");

    let upload = env.services.upload(&file).await.unwrap();
    let report = env
        .services
        .ingest_upload(&upload.document_id, upload.job_id)
        .await
        .unwrap();

    assert_eq!(report.parser_used, Backend::Secondary);
    assert_eq!(secondary.calls(), 1);
    assert_eq!(ocr.calls(), 0);

    let doc = env.services.documents.require(&upload.document_id).await.unwrap();
    assert_eq!(doc.meta.backends_tried, vec![Backend::Builtin, Backend::Secondary]);
    assert_eq!(doc.meta.quality_score, Some(0.9));
    // 0.9 clears the OCR threshold, so no low-quality warning.
    assert!(!doc.meta.warnings.iter().any(|w| w == LOW_QUALITY_WARNING));

    let steps = env.services.jobs.steps(upload.job_id).await.unwrap();
    assert!(steps.iter().any(|s| s.step_name == "secondary_parser" && s.progress == 35));
    assert!(!steps.iter().any(|s| s.step_name == "ocr"));
}

#[tokio::test]
async fn pdf_with_every_backend_down_fails_job_and_document() {
    let env = TestEnv::with_parsers(
        Some(StubParser::failing(Backend::Secondary) as Arc<dyn RemoteParser>),
        Some(StubParser::failing(Backend::Ocr) as Arc<dyn RemoteParser>),
    )
    .await;
    let file = env.write_outside("scan.pdf", b"not a pdf at all");

    let upload = env.services.upload(&file).await.unwrap();
    let err = env
        .services
        .ingest_upload(&upload.document_id, upload.job_id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ParseFailure {
            backend: Backend::Ocr,
            ..
        }
    ));

    let job = env.services.jobs.get(upload.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.message.unwrap_or_default().starts_with("pipeline error:"));

    let doc = env.services.documents.require(&upload.document_id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(doc.meta.extra.contains_key("error"));
}

#[tokio::test]
async fn answer_without_generator_lists_fragments() {
    let env = TestEnv::new().await;
    let file = env.write_outside("policy.txt", "Travel expenses are reimbursed within 30 days.");
    let upload = env.services.upload(&file).await.unwrap();
    env.services
        .ingest_upload(&upload.document_id, upload.job_id)
        .await
        .unwrap();

    let answer = env
        .services
        .answers
        .ask(
            "when are travel expenses reimbursed",
            ScopeFilter::Temp {
                document_id: upload.document_id.clone(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].doc_id, upload.document_id);
    assert_eq!(answer.citations[0].title, "policy.txt");
    assert!(answer.answer.contains("reimbursed within 30 days"));
}

#[tokio::test]
async fn answer_with_no_evidence_uses_fallback() {
    let env = TestEnv::new().await;
    let answer = env
        .services
        .answers
        .ask("anything", ScopeFilter::Sources { source_ids: vec![] }, None)
        .await
        .unwrap();
    assert!(answer.citations.is_empty());
    assert_eq!(answer.answer, ragtp::answer::FALLBACK_ANSWER);
}
