//! Question answering over retrieved chunks.
//!
//! `ask` runs hybrid search, reranks the candidates, keeps the top few as
//! evidence, and asks a generator for an answer with citations. The
//! reranker and generator are remote and optional; when either fails the
//! caller still gets an answer:
//!
//! - rerank failure → pre-rerank order truncated to `rerank_top_n`
//! - generator failure or no evidence → [`FALLBACK_ANSWER`]
//! - no generator configured → the evidence snippets themselves

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::error::{PipelineError, Result};
use crate::search::{HybridSearch, ScopeFilter, SearchHit, SearchRequest};

pub const FALLBACK_ANSWER: &str = "Not enough data to answer the question.";
/// Maximum citation snippet length, in chars.
pub const SNIPPET_CHARS: usize = 280;

const SYSTEM_PROMPT: &str = "Answer the question using only the numbered fragments. \
Cite fragments as [n]. If the fragments do not contain the answer, say that there is not enough data.";

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RerankItem {
    pub index: usize,
    pub score: f64,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Items ordered by descending score, at most `top_n`.
    async fn rerank(&self, query: &str, passages: &[String], top_n: usize) -> Result<Vec<RerankItem>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ============ HTTP clients ============

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::RemoteBackendUnavailable(e.to_string()))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
) -> Result<serde_json::Value> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| PipelineError::RemoteBackendUnavailable(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::RemoteBackendUnavailable(format!(
            "{} returned {}",
            url, status
        )));
    }
    response
        .json()
        .await
        .map_err(|e| PipelineError::RemoteBackendUnavailable(e.to_string()))
}

/// `{query, passages, top_n}` → `{items: [{index, score}]}`
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
}

impl HttpReranker {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[derive(Deserialize)]
struct RerankResponse {
    items: Vec<RerankItem>,
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, passages: &[String], top_n: usize) -> Result<Vec<RerankItem>> {
        let body = serde_json::json!({
            "query": query,
            "passages": passages,
            "top_n": top_n,
        });
        let json = post_json(&self.client, &self.url, &body).await?;
        let parsed: RerankResponse = serde_json::from_value(json)
            .map_err(|e| PipelineError::RemoteBackendUnavailable(format!("invalid rerank response: {}", e)))?;
        Ok(parsed.items)
    }
}

/// `{messages, stream: false}` → an answer in one of several shapes.
pub struct HttpGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpGenerator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "messages": messages,
            "stream": false,
        });
        let json = post_json(&self.client, &self.url, &body).await?;
        extract_answer(&json).ok_or_else(|| {
            PipelineError::RemoteBackendUnavailable("generator response has no answer".into())
        })
    }
}

/// Pull the answer out of `answer`, `content`, `choices[0].message.content`
/// or `choices[0].text`, in that order. Blank strings don't count.
pub fn extract_answer(json: &serde_json::Value) -> Option<String> {
    let first_choice = json.get("choices").and_then(|c| c.get(0));
    [
        json.get("answer"),
        json.get("content"),
        first_choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content")),
        first_choice.and_then(|c| c.get("text")),
    ]
    .into_iter()
    .flatten()
    .filter_map(|v| v.as_str())
    .map(str::trim)
    .find(|s| !s.is_empty())
    .map(String::from)
}

/// Reorder `hits` by rerank items, dropping out-of-range and repeated
/// indices, and keep at most `top_n`.
pub fn apply_rerank(hits: Vec<SearchHit>, items: &[RerankItem], top_n: usize) -> Vec<SearchHit> {
    let mut slots: Vec<Option<SearchHit>> = hits.into_iter().map(Some).collect();
    items
        .iter()
        .filter_map(|item| slots.get_mut(item.index).and_then(Option::take))
        .take(top_n)
        .collect()
}

// ============ Answer service ============

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub doc_id: String,
    pub title: String,
    pub relative_path: String,
    pub page_or_sheet: Option<String>,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

pub struct AnswerService {
    search: Arc<HybridSearch>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Option<Arc<dyn Generator>>,
    retrieval: RetrievalConfig,
}

impl AnswerService {
    pub fn new(
        search: Arc<HybridSearch>,
        reranker: Option<Arc<dyn Reranker>>,
        generator: Option<Arc<dyn Generator>>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            search,
            reranker,
            generator,
            retrieval,
        }
    }

    pub async fn ask(
        &self,
        question: &str,
        scope: ScopeFilter,
        path_prefix: Option<String>,
    ) -> Result<Answer> {
        let request = SearchRequest {
            query: question.to_string(),
            scope,
            path_prefix,
            top_n: self.retrieval.final_top_n,
        };
        let hits = match self.search.search(&request).await {
            Ok(hits) => hits,
            Err(e @ PipelineError::Embedding(_)) | Err(e @ PipelineError::RemoteBackendUnavailable(_)) => {
                tracing::warn!(error = %e, "retrieval unavailable, answering with fallback");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let ranked = self.rerank(question, hits).await;
        let evidence: Vec<SearchHit> = ranked.into_iter().take(self.retrieval.context_top_m).collect();
        if evidence.is_empty() {
            return Ok(Answer {
                answer: FALLBACK_ANSWER.to_string(),
                citations: Vec::new(),
            });
        }

        let citations: Vec<Citation> = evidence
            .iter()
            .map(|hit| Citation {
                doc_id: hit.document_id.clone(),
                title: hit.title.clone(),
                relative_path: hit.relative_path.clone(),
                page_or_sheet: hit.page_or_sheet.clone(),
                snippet: hit.content.chars().take(SNIPPET_CHARS).collect(),
            })
            .collect();

        let answer = match &self.generator {
            Some(generator) => {
                let messages = build_messages(question, &evidence);
                match generator.generate(&messages).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "generator failed, using fallback answer");
                        FALLBACK_ANSWER.to_string()
                    }
                }
            }
            None => {
                let mut lines = vec!["Relevant fragments:".to_string()];
                lines.extend(citations.iter().map(|c| c.snippet.clone()));
                lines.join("\n")
            }
        };

        Ok(Answer { answer, citations })
    }

    async fn rerank(&self, question: &str, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let top_n = self.retrieval.rerank_top_n;
        let Some(reranker) = &self.reranker else {
            return hits.into_iter().take(top_n).collect();
        };
        if hits.is_empty() {
            return hits;
        }

        let passages: Vec<String> = hits.iter().map(|h| h.content.clone()).collect();
        match reranker.rerank(question, &passages, top_n).await {
            Ok(items) => apply_rerank(hits, &items, top_n),
            Err(e) => {
                tracing::warn!(error = %e, "rerank failed, keeping fused order");
                hits.into_iter().take(top_n).collect()
            }
        }
    }
}

fn build_messages(question: &str, evidence: &[SearchHit]) -> Vec<ChatMessage> {
    let fragments: Vec<String> = evidence
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            let location = match &hit.page_or_sheet {
                Some(label) => format!("{}, {}", hit.relative_path, label),
                None => hit.relative_path.clone(),
            };
            format!("[{}] {} ({})\n{}", i + 1, hit.title, location, hit.content)
        })
        .collect();
    vec![
        ChatMessage {
            role: "system",
            content: SYSTEM_PROMPT.to_string(),
        },
        ChatMessage {
            role: "user",
            content: format!("Question: {}\n\nFragments:\n{}", question, fragments.join("\n\n")),
        },
    ]
}
