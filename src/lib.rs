//! # Vault Assist
//!
//! An AI assistant that lives inside a folder of markdown notes.
//!
//! Vault Assist keeps a heading-aware chunk index of the vault up to date
//! as documents change, assembles a small retrieval context for each user
//! message, and runs a streaming tool-calling loop in which every tool call
//! passes through consent, rate limiting, and an audit log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  events  ┌──────────┐  snapshot  ┌────────────┐
//! │  Vault   │─────────▶│ Indexer  │───────────▶│ index.json │
//! │ (FsVault)│          └────┬─────┘            └────────────┘
//! └────┬─────┘               │ ChunkStore
//!      │                     ▼
//!      │              ┌──────────────┐   stream   ┌───────────┐
//!      │              │ Orchestrator │◀──────────▶│ ChatModel │
//!      │              └──────┬───────┘            └───────────┘
//!      │                     │ tool calls
//!      │                     ▼
//!      │   ┌───────────────────────────────────────────────┐
//!      └──▶│ ToolDispatcher: consent ▸ rate limit ▸ audit   │
//!          └───────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`vault`] | Host document store abstraction and filesystem implementation |
//! | [`indexer`] | Incremental indexing with debounced snapshot persistence |
//! | [`watch`] | Filesystem watcher producing vault events |
//! | [`tools`] | Tool trait, registry, and built-in tools |
//! | [`consent`] | Per-call user consent |
//! | [`rate_limit`] | Sliding-window admission control |
//! | [`audit`] | Append-only JSONL execution log |
//! | [`model`] | Chat model transport (OpenAI-compatible, Ollama) |
//! | [`dispatch`] | The gate every tool call passes through |
//! | [`orchestrator`] | Conversation and tool-call loop |
//! | [`app`] | Service wiring from configuration |
//!
//! Chunking, the chunk store, and retrieval scoring live in the I/O-free
//! `vault_assist_core` crate.

pub mod app;
pub mod audit;
pub mod config;
pub mod consent;
pub mod dispatch;
pub mod indexer;
pub mod model;
pub mod orchestrator;
pub mod rate_limit;
pub mod tools;
pub mod vault;
pub mod watch;
