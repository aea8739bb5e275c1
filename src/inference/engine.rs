//! The engine contract and its backend-driven implementation.
//!
//! Every engine exposes the same lifecycle (load, unload, query) and the
//! same four generation entry points. [`LocalEngine`] implements them on
//! top of any [`Backend`], keeping resident models in a [`ModelRegistry`].
//!
//! All methods are blocking. Async callers should run them on a blocking
//! thread (`tokio::task::spawn_blocking`).

use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::format;
use crate::inference::backend::{Backend, BackendError, ContextParams, ModelParams};
use crate::inference::chat;
use crate::inference::factory::EngineKind;
use crate::inference::generation::{self, Completion, Fragment, GenerationParams};
use crate::inference::registry::{LoadedModel, ModelRegistry};
use crate::inference::types::{
    estimate_memory, unix_now, ChatRequest, GenerateOptions, GenerateRequest, GenerationResult,
    ModelInfo, ModelOptions,
};

/// Parameter count assumed when a file's metadata gives no estimate.
pub const DEFAULT_PARAMETER_ESTIMATE: u64 = 7_000_000_000;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model not loaded: {0}")]
    NotLoaded(String),

    #[error("failed to load model {name}: {source}")]
    LoadFailed {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("tokenize failed: {0}")]
    TokenizeFailed(#[source] BackendError),

    #[error("evaluation failed: {0}")]
    EvalFailed(#[source] BackendError),

    #[error("sampling failed: {0}")]
    SampleFailed(String),

    #[error("prompt of {tokens} tokens does not fit a {n_ctx}-token context")]
    ContextOverflow { tokens: usize, n_ctx: usize },

    /// The streaming callback refused a fragment.
    #[error("delivery failed: {0}")]
    Delivery(anyhow::Error),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("shutdown incomplete: {}", .0.join("; "))]
    Shutdown(Vec<String>),
}

impl EngineError {
    pub fn is_not_loaded(&self) -> bool {
        matches!(self, EngineError::NotLoaded(_))
    }
}

/// Streaming delivery callback. Returning an error stops generation.
pub type Deliver<'a> = dyn FnMut(GenerationResult) -> anyhow::Result<()> + 'a;

/// Capability interface every inference engine satisfies.
pub trait InferenceEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Load `path` under `name`. Loading a name that is already resident
    /// succeeds without reloading.
    fn load_model(&self, name: &str, path: &Path, options: &ModelOptions)
        -> Result<(), EngineError>;

    /// Release a resident model's resources before returning.
    fn unload_model(&self, name: &str) -> Result<(), EngineError>;

    /// Never waits on a load or generation in progress.
    fn is_loaded(&self, name: &str) -> bool;

    fn loaded_models(&self) -> Vec<String>;

    fn generate(&self, request: &GenerateRequest) -> Result<GenerationResult, EngineError>;

    /// Deliver fragments in order; the last one has `done = true`.
    fn generate_stream(
        &self,
        request: &GenerateRequest,
        deliver: &mut Deliver<'_>,
    ) -> Result<(), EngineError>;

    fn chat(&self, request: &ChatRequest) -> Result<GenerationResult, EngineError>;

    fn chat_stream(&self, request: &ChatRequest, deliver: &mut Deliver<'_>)
        -> Result<(), EngineError>;

    fn describe(&self, name: &str) -> Result<ModelInfo, EngineError>;

    /// Unload everything. Keeps going past individual failures.
    fn shutdown(&self) -> Result<(), EngineError>;
}

/// Engine backed by an in-process [`Backend`].
pub struct LocalEngine {
    kind: EngineKind,
    backend: Box<dyn Backend>,
    registry: ModelRegistry,
}

impl LocalEngine {
    pub fn new(kind: EngineKind, backend: Box<dyn Backend>) -> Self {
        Self {
            kind,
            backend,
            registry: ModelRegistry::new(),
        }
    }

    fn open(
        &self,
        name: &str,
        path: &Path,
        options: &ModelOptions,
    ) -> Result<LoadedModel, EngineError> {
        let model_params = ModelParams::from(options);
        let ctx_params = ContextParams::from(options);

        info!(
            model = %name,
            path = %path.display(),
            backend = self.backend.name(),
            n_ctx = ctx_params.n_ctx,
            gpu_layers = model_params.n_gpu_layers,
            threads = ctx_params.n_threads,
            "Loading model"
        );

        let session = self
            .backend
            .load(path, &model_params, &ctx_params)
            .map_err(|source| EngineError::LoadFailed {
                name: name.to_string(),
                source,
            })?;

        let parameters = format::decode(path)
            .ok()
            .filter(|d| d.valid && d.parameter_estimate > 0)
            .map(|d| d.parameter_estimate)
            .unwrap_or(DEFAULT_PARAMETER_ESTIMATE);

        let context_size = session.n_ctx() as u32;
        let info = ModelInfo {
            name: name.to_string(),
            path: path.display().to_string(),
            context_size,
            vocab_size: session.n_vocab() as u32,
            parameters,
            gpu_layers: options.gpu_layers,
            memory_used: estimate_memory(context_size, options.gpu_layers),
        };

        Ok(LoadedModel::new(name, info, session))
    }

    fn run(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
        deliver: &mut dyn FnMut(Fragment) -> anyhow::Result<()>,
    ) -> Result<Completion, EngineError> {
        let params = GenerationParams::from(options);
        self.registry.with_model(model, |loaded| {
            let completion = generation::run(loaded.session_mut(), prompt, &params, deliver)?;
            info!(
                model = %model,
                prompt_tokens = completion.prompt_tokens,
                completion_tokens = completion.completion_tokens,
                reason = ?completion.reason,
                "Generation complete"
            );
            Ok(completion)
        })
    }

    fn complete(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerationResult, EngineError> {
        let mut text = String::new();
        self.run(model, prompt, options, &mut |fragment| {
            text.push_str(&fragment.text);
            Ok(())
        })?;
        Ok(GenerationResult {
            model: model.to_string(),
            created_at: unix_now(),
            text,
            done: true,
        })
    }

    fn stream(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
        deliver: &mut Deliver<'_>,
    ) -> Result<(), EngineError> {
        self.run(model, prompt, options, &mut |fragment| {
            deliver(GenerationResult {
                model: model.to_string(),
                created_at: unix_now(),
                text: fragment.text,
                done: fragment.done,
            })
        })?;
        Ok(())
    }
}

impl InferenceEngine for LocalEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn load_model(
        &self,
        name: &str,
        path: &Path,
        options: &ModelOptions,
    ) -> Result<(), EngineError> {
        let loaded = self.registry.load_with(name, || self.open(name, path, options))?;
        if loaded {
            info!(model = %name, "Model loaded");
        } else {
            info!(model = %name, "Model already loaded");
        }
        Ok(())
    }

    fn unload_model(&self, name: &str) -> Result<(), EngineError> {
        let model = self.registry.unload(name)?;
        info!(
            model = %name,
            resident_secs = model.loaded_at().elapsed().map(|d| d.as_secs()).unwrap_or(0),
            "Model unloaded"
        );
        drop(model);
        Ok(())
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.registry.is_loaded(name)
    }

    fn loaded_models(&self) -> Vec<String> {
        self.registry.names()
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GenerationResult, EngineError> {
        self.complete(&request.model, &request.prompt, &request.options)
    }

    fn generate_stream(
        &self,
        request: &GenerateRequest,
        deliver: &mut Deliver<'_>,
    ) -> Result<(), EngineError> {
        self.stream(&request.model, &request.prompt, &request.options, deliver)
    }

    fn chat(&self, request: &ChatRequest) -> Result<GenerationResult, EngineError> {
        let prompt = chat::format_prompt(&request.messages);
        self.complete(&request.model, &prompt, &request.options)
    }

    fn chat_stream(
        &self,
        request: &ChatRequest,
        deliver: &mut Deliver<'_>,
    ) -> Result<(), EngineError> {
        let prompt = chat::format_prompt(&request.messages);
        self.stream(&request.model, &prompt, &request.options, deliver)
    }

    fn describe(&self, name: &str) -> Result<ModelInfo, EngineError> {
        self.registry.with_model(name, |loaded| Ok(loaded.info().clone()))
    }

    fn shutdown(&self) -> Result<(), EngineError> {
        let mut failures = Vec::new();
        for name in self.registry.names() {
            match self.unload_model(&name) {
                Ok(()) => {}
                // Raced with another unload; already gone.
                Err(e) if e.is_not_loaded() => {}
                Err(e) => {
                    warn!(model = %name, error = %e, "Unload failed during shutdown");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            info!("Engine shut down");
            Ok(())
        } else {
            Err(EngineError::Shutdown(failures))
        }
    }
}
