//! # IMOS
//!
//! Intelligent Memory OS: chat with the documents in your Google Drive.
//!
//! IMOS connects to a Drive account, imports the files you pick, splits
//! their text into overlapping chunks, embeds every chunk and keeps the
//! vectors in a local SQLite database. Questions are answered by a hosted
//! chat model, grounded on the stored chunks most similar to the question.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────┐   ┌──────────┐
//! │ Google Drive │──▶│ Extract+Chunk+Embed  │──▶│  SQLite  │
//! │  (OAuth 2)   │   │       (ingest)       │   │ vectors  │
//! └──────────────┘   └──────────────────────┘   └────┬─────┘
//!                                                    │ top-K cosine
//!                                                    ▼
//!                     ┌──────────┐   prompt    ┌───────────┐
//!                     │   CLI    │◀───────────▶│ Chat LLM  │
//!                     │  (imos)  │             │ (OpenAI-  │
//!                     └──────────┘             │ compatible)│
//!                                              └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! imos init                              # create database
//! imos connect                           # authorize Drive access
//! imos list --search "board"             # browse importable files
//! imos import --all --search "board"     # import them
//! imos ask "What did the board decide?"
//! imos chat                              # interactive conversation
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`credentials`] | OAuth credential lifecycle |
//! | [`drive`] | Drive listing and download |
//! | [`extract`] | Text extraction per file type |
//! | [`chunk`] | Overlapping text chunking |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | Chunk and vector storage |
//! | [`ingest`] | Import pipeline |
//! | [`retrieve`] | Top-K similarity search |
//! | [`llm`] | Chat-completion client |
//! | [`assemble`] | Prompt assembly |
//! | [`session`] | Session state machine |
//! | [`commands`] | CLI command handlers |

pub mod assemble;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod db;
pub mod drive;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retrieve;
pub mod session;
pub mod store;

pub use error::{Error, Result};
