//! # Survey QA
//!
//! Question answering over survey spreadsheets.
//!
//! A spreadsheet is split into row (or sheet) chunks, every chunk is embedded,
//! the most relevant and mutually diverse chunks are retrieved for a question,
//! and a language model answers from that evidence alone under a fixed prompt.
//! Nothing is persisted: each request rebuilds its chunks and index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Loader  │──▶│ Embedder │──▶│  Index   │──▶│  Prompt  │──▶│   LLM    │
//! │xlsx/xls/ │   │ fastembed│   │   MMR    │   │ template │   │  Ollama  │
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘   └──────────┘
//!        └──────────────── Pipeline (one request) ───────────────┘
//!                         ▲                 ▲
//!                    ┌────┴────┐       ┌────┴────┐
//!                    │   CLI   │       │  HTTP   │
//!                    └─────────┘       └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! survey-qa chunks ./survey.xlsx
//! survey-qa ask ./survey.xlsx "Which brand has the most sustainable packaging?"
//! survey-qa serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and pipeline stages |
//! | [`models`] | Core data types |
//! | [`loader`] | Spreadsheet → chunks |
//! | [`embedding`] | Embedder trait and backends |
//! | [`index`] | Per-request vector index with MMR retrieval |
//! | [`prompt`] | Fixed prompt template |
//! | [`llm`] | Language-model client |
//! | [`guardrails`] | Post-generation answer checks |
//! | [`pipeline`] | End-to-end request orchestration |
//! | [`server`] | HTTP upload page and JSON API |
//! | [`telemetry`] | Logging setup |

pub mod config;
pub mod embedding;
pub mod error;
pub mod guardrails;
pub mod index;
pub mod llm;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod server;
pub mod telemetry;
