//! Backend seam: a loaded model plus its evaluation context.
//!
//! A [`Backend`] turns a file into a [`Session`]. The session owns both the
//! model weights and the evaluation context and frees them when dropped, so
//! removing a session from the registry is what releases its resources.

use std::path::Path;

use thiserror::Error;

use crate::inference::types::ModelOptions;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Context creation failed: {0}")]
    ContextFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Token ID type.
pub type TokenId = i32;

/// Model parameters (mirrors llama_model_params).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    /// Number of layers to offload.
    pub n_gpu_layers: u32,

    /// Use memory mapping for the model file.
    pub use_mmap: bool,

    /// Use memory locking.
    pub use_mlock: bool,

    pub main_gpu: u32,
    pub tensor_split: Vec<f32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            main_gpu: 0,
            tensor_split: Vec::new(),
        }
    }
}

impl From<&ModelOptions> for ModelParams {
    fn from(opts: &ModelOptions) -> Self {
        Self {
            n_gpu_layers: opts.gpu_layers,
            use_mmap: opts.use_mmap,
            use_mlock: opts.use_mlock,
            main_gpu: 0,
            tensor_split: opts.tensor_split.clone(),
        }
    }
}

/// Context parameters (mirrors llama_context_params).
#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    /// Context size in tokens.
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    pub n_batch: u32,

    /// Number of threads for computation.
    pub n_threads: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_threads: 4,
        }
    }
}

impl From<&ModelOptions> for ContextParams {
    fn from(opts: &ModelOptions) -> Self {
        Self {
            n_ctx: opts.context_size,
            n_batch: opts.batch_size,
            n_threads: opts.resolved_threads(),
        }
    }
}

/// Something that can open model files.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn load(
        &self,
        path: &Path,
        model: &ModelParams,
        context: &ContextParams,
    ) -> Result<Box<dyn Session>, BackendError>;
}

/// An open model with one evaluation context.
///
/// Not assumed safe for concurrent use; callers hold it exclusively.
pub trait Session: Send {
    fn n_vocab(&self) -> usize;
    fn n_ctx(&self) -> usize;

    /// Tokens currently held in the KV cache.
    fn kv_cache_used(&self) -> usize;

    /// Clear the KV cache.
    fn kv_cache_clear(&mut self);

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError>;

    /// Process a batch of tokens, appending them to the KV cache.
    fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError>;

    /// Logits for the position after the last decoded token.
    fn logits(&self) -> Result<&[f32], BackendError>;

    /// Raw bytes of a token. May be a partial UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;
}
