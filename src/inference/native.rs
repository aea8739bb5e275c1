//! Native backend over llama.cpp, through the `llama-cpp-2` bindings.
//!
//! Only compiled with the `llama` feature (or one of the accelerator
//! features that imply it); without it this module reports the backend as
//! unavailable and the factory falls back to the offline engine.

use std::ops::Range;

use crate::inference::backend::Backend;

/// Whether a native engine can be built. `force` skips the runtime
/// initialization check.
pub fn is_available(force: bool) -> bool {
    #[cfg(feature = "llama")]
    {
        force || llama::backend_handle().is_some()
    }

    #[cfg(not(feature = "llama"))]
    {
        let _ = force;
        false
    }
}

pub fn backend() -> Option<Box<dyn Backend>> {
    #[cfg(feature = "llama")]
    {
        Some(Box::new(llama::NativeBackend))
    }

    #[cfg(not(feature = "llama"))]
    {
        None
    }
}

/// Split a decode of `len` tokens into batches of at most `n_batch`.
///
/// llama.cpp rejects a batch larger than the context's `n_batch`, so long
/// prompts are evaluated in several calls.
pub fn batch_ranges(len: usize, n_batch: usize) -> impl Iterator<Item = Range<usize>> {
    let step = n_batch.max(1);
    (0..len)
        .step_by(step)
        .map(move |start| start..(start + step).min(len))
}

#[cfg(feature = "llama")]
mod llama {
    use std::mem::ManuallyDrop;
    use std::num::NonZeroU32;
    use std::path::Path;
    use std::ptr::NonNull;
    use std::sync::OnceLock;

    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::context::LlamaContext;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::{AddBos, LlamaModel, Special};
    use llama_cpp_2::token::LlamaToken;
    use tracing::{debug, warn};

    use super::batch_ranges;
    use crate::inference::backend::{
        Backend, BackendError, ContextParams, ModelParams, Session, TokenId,
    };

    /// llama.cpp may only be initialized once per process.
    pub fn backend_handle() -> Option<&'static LlamaBackend> {
        static BACKEND: OnceLock<Option<LlamaBackend>> = OnceLock::new();
        BACKEND
            .get_or_init(|| match LlamaBackend::init() {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!(error = %e, "llama.cpp backend init failed");
                    None
                }
            })
            .as_ref()
    }

    pub struct NativeBackend;

    impl Backend for NativeBackend {
        fn name(&self) -> &'static str {
            "llama.cpp"
        }

        fn load(
            &self,
            path: &Path,
            model: &ModelParams,
            context: &ContextParams,
        ) -> Result<Box<dyn Session>, BackendError> {
            let backend = backend_handle()
                .ok_or_else(|| BackendError::Unavailable("llama backend init failed".into()))?;

            if !model.tensor_split.is_empty() {
                warn!("tensor_split is not supported by the native backend, ignoring");
            }
            let model_params = LlamaModelParams::default()
                .with_n_gpu_layers(model.n_gpu_layers)
                .with_main_gpu(model.main_gpu as i32)
                .with_use_mlock(model.use_mlock);

            let loaded = LlamaModel::load_from_file(backend, path, &model_params)
                .map_err(|e| BackendError::ModelLoadFailed(format!("{}: {e}", path.display())))?;
            let model_ptr = NonNull::from(Box::leak(Box::new(loaded)));
            // SAFETY: the model is freed only in NativeSession::drop, after the
            // context borrowing it. On the error paths below it is freed here.
            let model_ref: &'static LlamaModel = unsafe { model_ptr.as_ref() };

            let n_batch = context.n_batch.max(1);
            let ctx_params = LlamaContextParams::default()
                .with_n_ctx(NonZeroU32::new(context.n_ctx))
                .with_n_batch(n_batch)
                .with_n_threads(context.n_threads as i32)
                .with_n_threads_batch(context.n_threads as i32);

            let ctx = match model_ref.new_context(backend, ctx_params) {
                Ok(ctx) => ctx,
                Err(e) => {
                    // SAFETY: nothing borrows the model yet.
                    drop(unsafe { Box::from_raw(model_ptr.as_ptr()) });
                    return Err(BackendError::ContextFailed(e.to_string()));
                }
            };

            let n_vocab = model_ref.n_vocab().max(0) as usize;
            let n_ctx = ctx.n_ctx() as usize;
            debug!(n_vocab, n_ctx, n_batch, "Native context created");

            Ok(Box::new(NativeSession {
                ctx: ManuallyDrop::new(ctx),
                batch: LlamaBatch::new(n_batch as usize, 1),
                model: model_ptr,
                n_vocab,
                n_ctx,
                n_batch: n_batch as usize,
                n_past: 0,
                logits_index: None,
            }))
        }
    }

    /// A model and the one context that borrows it.
    struct NativeSession {
        ctx: ManuallyDrop<LlamaContext<'static>>,
        batch: LlamaBatch,
        model: NonNull<LlamaModel>,
        n_vocab: usize,
        n_ctx: usize,
        n_batch: usize,
        n_past: usize,
        /// Batch index holding the logits of the last decoded token.
        logits_index: Option<i32>,
    }

    // SAFETY: the session is only used through &mut self or while the
    // registry's per-model lock is held; llama.cpp objects may move threads.
    unsafe impl Send for NativeSession {}

    impl NativeSession {
        fn model(&self) -> &LlamaModel {
            // SAFETY: valid until drop.
            unsafe { self.model.as_ref() }
        }
    }

    impl Drop for NativeSession {
        fn drop(&mut self) {
            // SAFETY: the context goes first, then the model it borrows; both
            // exactly once.
            unsafe {
                ManuallyDrop::drop(&mut self.ctx);
                drop(Box::from_raw(self.model.as_ptr()));
            }
        }
    }

    impl Session for NativeSession {
        fn n_vocab(&self) -> usize {
            self.n_vocab
        }

        fn n_ctx(&self) -> usize {
            self.n_ctx
        }

        fn kv_cache_used(&self) -> usize {
            self.n_past
        }

        fn kv_cache_clear(&mut self) {
            self.ctx.clear_kv_cache();
            self.n_past = 0;
            self.logits_index = None;
        }

        fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, BackendError> {
            let add_bos = if add_bos { AddBos::Always } else { AddBos::Never };
            let tokens = self
                .model()
                .str_to_token(text, add_bos)
                .map_err(|e| BackendError::TokenizeFailed(e.to_string()))?;
            Ok(tokens.into_iter().map(|t| t.0).collect())
        }

        fn decode(&mut self, tokens: &[TokenId]) -> Result<(), BackendError> {
            if self.n_past + tokens.len() > self.n_ctx {
                return Err(BackendError::DecodeFailed("context full".into()));
            }

            for chunk in batch_ranges(tokens.len(), self.n_batch) {
                self.batch.clear();
                for (offset, i) in chunk.clone().enumerate() {
                    let pos = (self.n_past + offset) as i32;
                    let wants_logits = i + 1 == tokens.len();
                    self.batch
                        .add(LlamaToken::new(tokens[i]), pos, &[0], wants_logits)
                        .map_err(|e| BackendError::DecodeFailed(e.to_string()))?;
                }
                self.ctx
                    .decode(&mut self.batch)
                    .map_err(|e| BackendError::DecodeFailed(e.to_string()))?;
                self.n_past += chunk.len();
                self.logits_index = None;
            }

            if !tokens.is_empty() {
                self.logits_index = Some(self.batch.n_tokens() - 1);
            }
            Ok(())
        }

        fn logits(&self) -> Result<&[f32], BackendError> {
            let index = self
                .logits_index
                .ok_or_else(|| BackendError::DecodeFailed("no tokens decoded".into()))?;
            Ok(self.ctx.get_logits_ith(index))
        }

        fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
            self.model()
                .token_to_bytes(LlamaToken::new(token), Special::Plaintext)
                .map_err(|e| BackendError::DecodeFailed(format!("token {token}: {e}")))
        }

        fn is_end_of_generation(&self, token: TokenId) -> bool {
            self.model().is_eog_token(LlamaToken::new(token))
        }
    }
}
