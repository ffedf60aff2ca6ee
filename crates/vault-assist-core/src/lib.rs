//! # Vault Assist Core
//!
//! Shared, I/O-free logic for Vault Assist: chunk models, heading-aware
//! markdown chunking, the in-memory chunk store, and the retrieval
//! algorithm (scoring, mention resolution, prompt assembly).
//!
//! This crate performs no filesystem or network access and has no async
//! runtime dependency. The application crate feeds it document text and
//! reads back chunks and assembled prompts.

pub mod chunk;
pub mod models;
pub mod retrieve;
pub mod sanitize;
pub mod store;
