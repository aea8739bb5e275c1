//! HTTP server providing an Ollama-compatible API.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: NDJSON streaming for fragment-by-fragment responses

pub mod api;
pub mod streaming;
