//! colossus: a local model-serving runtime.
//!
//! Validates model files on disk, keeps models resident behind a pluggable
//! inference engine, and streams text and chat completions over an
//! Ollama-style HTTP API.

pub mod catalog;
pub mod config;
pub mod format;
pub mod gpu;
pub mod inference;
pub mod server;
