//! Hybrid retrieval: full-text + vector channels fused by reciprocal rank.
//!
//! Both channels run over chunks of documents that match the scope filter
//! and are not soft-deleted:
//!
//! - **keyword**: FTS5 `MATCH` ordered by `bm25()`, top `keyword_top_k`
//! - **vector**: cosine similarity against the query embedding, computed
//!   in Rust over stored vectors, top `vector_top_k`
//!
//! Each chunk's fused score is `Σ 1 / (rrf_k + rank)` over the channels it
//! appears in (ranks are 1-based). Results are sorted by fused score with a
//! stable sort, so ties keep first-seen order (keyword channel first).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, parse_vector, Embedder};
use crate::error::{PipelineError, Result};

/// Which documents a query may see.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeFilter {
    /// A single uploaded document.
    Temp { document_id: String },
    /// Scanned documents from these sources; empty means every source.
    Sources { source_ids: Vec<i64> },
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub scope: ScopeFilter,
    /// Case-insensitive prefix on the document's relative path.
    pub path_prefix: Option<String>,
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub page_or_sheet: Option<String>,
    pub title: String,
    pub relative_path: String,
    pub score: f64,
    pub keyword_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

/// Fuse ranked lists of ids. Each list is in rank order (index 0 = rank 1).
///
/// Returns `(id, score)` sorted by score descending; ties keep the order in
/// which ids were first seen across the lists.
pub fn reciprocal_rank_fusion(channels: &[&[String]], k: f64) -> Vec<(String, f64)> {
    let mut fused: Vec<(String, f64)> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();

    for channel in channels {
        for (i, id) in channel.iter().enumerate() {
            let contribution = 1.0 / (k + (i + 1) as f64);
            match position.get(id.as_str()) {
                Some(&pos) => fused[pos].1 += contribution,
                None => {
                    position.insert(id.as_str(), fused.len());
                    fused.push((id.clone(), contribution));
                }
            }
        }
    }

    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

/// Turn free text into an FTS5 query: each word quoted, joined with OR.
/// Returns `None` when nothing searchable remains.
pub fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn push_scope(qb: &mut QueryBuilder<'_, Sqlite>, scope: &ScopeFilter, path_prefix: Option<&str>) {
    qb.push(" AND d.deleted_at IS NULL");
    match scope {
        ScopeFilter::Temp { document_id } => {
            qb.push(" AND d.id = ").push_bind(document_id.clone());
        }
        ScopeFilter::Sources { source_ids } => {
            qb.push(" AND d.scope = 'nas'");
            if !source_ids.is_empty() {
                qb.push(" AND d.source_id IN (");
                let mut separated = qb.separated(", ");
                for id in source_ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }
        }
    }
    if let Some(prefix) = path_prefix.filter(|p| !p.is_empty()) {
        let escaped = prefix
            .to_lowercase()
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        qb.push(" AND lower(d.relative_path) LIKE ")
            .push_bind(format!("{}%", escaped))
            .push(" ESCAPE '\\'");
    }
}

pub struct HybridSearch {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    retrieval: RetrievalConfig,
}

impl HybridSearch {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, retrieval: RetrievalConfig) -> Self {
        Self {
            pool,
            embedder,
            retrieval,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        if request.query.trim().is_empty() || request.top_n == 0 {
            return Ok(Vec::new());
        }
        let prefix = request.path_prefix.as_deref();

        let keyword = match fts_query(&request.query) {
            Some(q) => self.keyword_channel(&q, &request.scope, prefix).await?,
            None => Vec::new(),
        };
        let vector = self
            .vector_channel(&request.query, &request.scope, prefix)
            .await?;
        tracing::debug!(
            keyword = keyword.len(),
            vector = vector.len(),
            "retrieval channels fetched"
        );

        let mut fused = reciprocal_rank_fusion(&[keyword.as_slice(), vector.as_slice()], self.retrieval.rrf_k);
        fused.truncate(request.top_n);
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let keyword_ranks: HashMap<&str, usize> = keyword
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i + 1))
            .collect();
        let vector_ranks: HashMap<&str, usize> = vector
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i + 1))
            .collect();

        let mut details = self.load_hits(&fused).await?;
        let mut hits = Vec::with_capacity(fused.len());
        for (chunk_id, score) in &fused {
            if let Some(mut hit) = details.remove(chunk_id) {
                hit.score = *score;
                hit.keyword_rank = keyword_ranks.get(chunk_id.as_str()).copied();
                hit.vector_rank = vector_ranks.get(chunk_id.as_str()).copied();
                hits.push(hit);
            }
        }
        Ok(hits)
    }

    async fn keyword_channel(
        &self,
        fts: &str,
        scope: &ScopeFilter,
        prefix: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT chunks_fts.chunk_id AS chunk_id FROM chunks_fts JOIN documents d ON d.id = chunks_fts.document_id WHERE chunks_fts MATCH ",
        );
        qb.push_bind(fts.to_string());
        push_scope(&mut qb, scope, prefix);
        qb.push(" ORDER BY bm25(chunks_fts) LIMIT ")
            .push_bind(self.retrieval.keyword_top_k as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| row.get("chunk_id")).collect())
    }

    async fn vector_channel(
        &self,
        query: &str,
        scope: &ScopeFilter,
        prefix: Option<&str>,
    ) -> Result<Vec<String>> {
        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Embedding("no vector for query".into()))?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT c.id AS chunk_id, c.embedding AS embedding FROM chunks c JOIN documents d ON d.id = c.document_id WHERE 1 = 1",
        );
        push_scope(&mut qb, scope, prefix);
        qb.push(" ORDER BY c.document_id, c.chunk_index");
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut scored: Vec<(String, f32)> = rows
            .iter()
            .filter_map(|row| {
                let literal: String = row.get("embedding");
                let vec = parse_vector(&literal)?;
                Some((row.get("chunk_id"), cosine_similarity(&query_vec, &vec)))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.retrieval.vector_top_k);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    async fn load_hits(&self, fused: &[(String, f64)]) -> Result<HashMap<String, SearchHit>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT c.id, c.document_id, c.chunk_index, c.content, c.meta, d.title, d.relative_path FROM chunks c JOIN documents d ON d.id = c.document_id WHERE c.id IN (",
        );
        let mut separated = qb.separated(", ");
        for (id, _) in fused {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let meta: String = row.get("meta");
                let page_or_sheet = serde_json::from_str::<serde_json::Value>(&meta)
                    .ok()
                    .and_then(|v| v.get("page_or_sheet").and_then(|p| p.as_str()).map(String::from));
                let hit = SearchHit {
                    chunk_id: row.get("id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    content: row.get("content"),
                    page_or_sheet,
                    title: row.get("title"),
                    relative_path: row.get("relative_path"),
                    score: 0.0,
                    keyword_rank: None,
                    vector_rank: None,
                };
                (hit.chunk_id.clone(), hit)
            })
            .collect())
    }
}
