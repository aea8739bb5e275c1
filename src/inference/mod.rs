//! Inference engines.
//!
//! - [`engine`]: The engine contract and the backend-driven implementation
//! - [`registry`]: Resident models and their locks
//! - [`generation`]: The token loop
//! - [`sampling`]: Temperature, top-k and top-p sampling
//! - [`chat`]: Conversation to prompt formatting
//! - [`backend`]: Backend and session traits
//! - [`fallback`]: Offline byte-level backend
//! - [`native`]: llama.cpp backend (`llama` feature)
//! - [`factory`]: Engine selection and default load options
//! - [`types`]: Requests, results and options

pub mod backend;
pub mod chat;
pub mod engine;
pub mod factory;
pub mod fallback;
pub mod generation;
pub mod native;
pub mod registry;
pub mod sampling;
pub mod types;

pub use engine::{EngineError, InferenceEngine, LocalEngine};
pub use factory::{EngineConfig, EngineFactory, EngineKind};
pub use types::{
    ChatMessage, ChatRequest, GenerateOptions, GenerateRequest, GenerationResult, ModelInfo,
    ModelOptions, Role,
};
