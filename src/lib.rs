//! # scope-rag
//!
//! A scoped retrieval-augmented chat service over SQLite.
//!
//! Documents are chunked and indexed under *scopes*: the shared `global`
//! scope and one scope per conversation. Each question retrieves from the
//! conversation's scope and the global scope independently, merges the
//! results local-first, and hands the assembled context to a generation
//! backend (Groq or Gemini) along with a bounded history window.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │   Uploads    │──▶│  Chunk+Embed │──▶│    SQLite     │
//! │ txt/md/pdf/… │   │              │   │ FTS5+Vectors  │
//! └──────────────┘   └──────────────┘   └──────┬────────┘
//!                                              │
//!                          ┌───────────────────┤
//!                          ▼                   ▼
//!                    ┌──────────┐        ┌──────────┐
//!                    │   CLI    │        │   HTTP   │
//!                    │  (rag)   │        │ (axum)   │
//!                    └──────────┘        └────┬─────┘
//!                                             ▼
//!                                       ┌──────────┐
//!                                       │ Groq /   │
//!                                       │ Gemini   │
//!                                       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag init                          # create database
//! rag ingest ./docs                 # load the global scope
//! rag ask "What is covered here?"   # one-shot smoke test
//! rag serve                         # start the chat API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction from txt/md/pdf/docx/pptx/xlsx |
//! | [`chunk`] | Size-bounded paragraph-aware splitting and chunk ids |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Scoped chunk store over FTS5 and vectors |
//! | [`retrieve`] | Two-scope retrieval, context assembly, citations |
//! | [`history`] | Bounded conversation history window |
//! | [`llm`] | Generation backends (Groq, Gemini) |
//! | [`auth`] | Accounts and bearer tokens |
//! | [`ask`] | Question orchestration |
//! | [`ingest`] | Document ingestion and the bulk CLI loader |
//! | [`inspect`] | Index statistics for the operator CLI |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ask;
pub mod auth;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod history;
pub mod index;
pub mod ingest;
pub mod inspect;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod server;
