//! microcdn: a content-addressed micro-CDN for minified scripts
//!
//! Uploads go through the [`compiler::CompilePipeline`] into
//! [`script_storage::StorageEngine`]; reads go through the
//! [`fetcher::FetchOrchestrator`], which keeps hot objects in a
//! [`script_lru_cache::ScriptCache`].

pub mod compiler;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod headers;
pub mod server;
pub mod streams;
pub mod types;
