//! # ragtp
//!
//! Document ingestion and hybrid retrieval for two kinds of content: files
//! uploaded by users (short-lived `temp` documents) and trees on a shared
//! network mount (`nas` documents, discovered by scanning registered
//! sources).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Upload / │──▶│ Parser chain     │──▶│ Chunk+Embed  │──▶│  SQLite  │
//! │ Scanner  │   │ builtin→2nd→OCR  │   │              │   │ FTS5+Vec │
//! └──────────┘   └────────┬─────────┘   └──────────────┘   └────┬─────┘
//!                         │ accelerator lock                    │
//!                         ▼                                     ▼
//!                 remote parsers                     hybrid search → answer
//! ```
//!
//! Every long-running operation reports into a job row with per-step
//! history, so callers can poll progress.
//!
//! ## Quick Start
//!
//! ```bash
//! ragtp init
//! ragtp source add /mnt/nas/contracts --include "**/*.pdf"
//! ragtp scan 1
//! ragtp upload ./report.docx
//! ragtp search "payment terms" --source 1
//! ragtp ask "what are the payment terms?"
//! ragtp worker --schedule
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Pipeline error kinds |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`paths`] | Path containment checks |
//! | [`jobs`] | Job and step tracking |
//! | [`lock`] | Accelerator lock |
//! | [`extract`] | Builtin PDF/DOCX/XLSX/TXT extraction |
//! | [`backends`] | Remote parser clients |
//! | [`parser`] | Parser fallback chain |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding client and vector helpers |
//! | [`documents`] | Document and chunk storage |
//! | [`sources`] | Source administration |
//! | [`ingest`] | Per-document ingestion pipeline |
//! | [`scanner`] | Source scanning |
//! | [`search`] | Hybrid keyword + vector search |
//! | [`answer`] | Reranking, generation and citations |
//! | [`worker`] | Task queue and worker pool |
//! | [`services`] | Wiring of all of the above |

pub mod answer;
pub mod backends;
pub mod chunk;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod jobs;
pub mod lock;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod paths;
pub mod scanner;
pub mod search;
pub mod services;
pub mod sources;
pub mod worker;
