//! # ragnote
//!
//! A retrieval-augmented question-answering backend.
//!
//! Users upload documents (PDF, DOCX, PPTX, text), which are extracted,
//! chunked, embedded, and indexed. Chat messages are answered from the most
//! relevant passages by a local or hosted language model. Notes and accounts
//! are stored alongside in SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Upload / CLI │──▶│ Extract +   │──▶│  SQLite   │
//! │   ingest     │   │ Chunk+Embed │   │ FTS5+Vec  │
//! └──────────────┘   └─────────────┘   └─────┬─────┘
//!                                            │
//!                     ┌──────────────────────┤
//!                     ▼                      ▼
//!               ┌───────────┐   ┌─────────────────────┐
//!               │ Retrieval │──▶│ Prompt + LLM (chat) │
//!               └───────────┘   └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragnote init                          # create database
//! ragnote ingest ./docs                 # index local files
//! ragnote embed pending                 # generate embeddings
//! ragnote ask "What is the refund policy?"
//! ragnote serve                         # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF / DOCX / PPTX / text extraction |
//! | [`chunk`] | Text chunking |
//! | [`ingest`] | Upload and local-file indexing pipeline |
//! | [`embedding`] | Embedding providers and vector utilities |
//! | [`index`] | In-memory vector index |
//! | [`search`] | Keyword, semantic, and hybrid retrieval |
//! | [`prompt`] | Prompt assembly |
//! | [`llm`] | Language model clients |
//! | [`chat`] | Grounded question answering |
//! | [`auth`] | Accounts, password hashing, bearer tokens |
//! | [`notes`] | Note storage |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod auth;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod documents;
pub mod embed_cmd;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod local_files;
pub mod migrate;
pub mod models;
pub mod notes;
pub mod prompt;
pub mod retry;
pub mod search;
pub mod server;
pub mod stats;
