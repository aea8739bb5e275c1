//! Request, result and option types shared by every engine.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::gpu::device::AcceleratorKind;
use crate::inference::sampling::SamplingParams;

/// Tokens predicted when a request leaves `num_predict` unset or zero.
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Load-time configuration for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Context window in tokens.
    pub context_size: u32,

    /// Layers offloaded to the accelerator (0 = CPU only).
    pub gpu_layers: u32,

    /// Compute threads (0 = one per available core).
    pub threads: u32,

    /// Prompt evaluation batch size.
    pub batch_size: u32,

    pub use_mmap: bool,
    pub use_mlock: bool,
    pub low_vram: bool,

    /// Per-device split ratios when several accelerators are used.
    pub tensor_split: Vec<f32>,

    /// Accelerator backend the layers are offloaded to.
    pub accelerator: AcceleratorKind,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            context_size: 2048,
            gpu_layers: 0,
            threads: 0,
            batch_size: 512,
            use_mmap: true,
            use_mlock: false,
            low_vram: false,
            tensor_split: Vec::new(),
            accelerator: AcceleratorKind::None,
        }
    }
}

impl ModelOptions {
    /// Thread count with `0` resolved to the host's available parallelism.
    pub fn resolved_threads(&self) -> u32 {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    }
}

/// Per-request sampling and stopping options. Unset fields take defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    /// `0.0` selects greedy decoding.
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,

    /// Maximum tokens to predict.
    pub num_predict: Option<usize>,

    /// Generation ends once any of these appears in the output.
    pub stop: Vec<String>,

    /// Seeds the sampler so non-greedy runs are reproducible.
    pub seed: Option<u64>,
}

impl GenerateOptions {
    pub fn sampling(&self) -> SamplingParams {
        let defaults = SamplingParams::default();
        SamplingParams {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            seed: self.seed,
        }
    }

    pub fn max_tokens(&self) -> usize {
        match self.num_predict {
            Some(n) if n > 0 => n,
            _ => DEFAULT_MAX_TOKENS,
        }
    }
}

/// Completion of a flat prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,

    #[serde(default)]
    pub stream: bool,

    #[serde(default)]
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            stream: false,
            options: GenerateOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Any role this runtime does not know; dropped when formatting.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Completion of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: bool,

    #[serde(default)]
    pub options: GenerateOptions,
}

/// One complete result, or one fragment of a streamed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub model: String,

    /// Seconds since the Unix epoch.
    pub created_at: u64,

    pub text: String,
    pub done: bool,
}

/// Derived facts about a resident model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub path: String,
    pub context_size: u32,
    pub vocab_size: u32,

    /// Approximate; derived from tensor count and architecture.
    pub parameters: u64,

    pub gpu_layers: u32,

    /// Estimated resident bytes.
    pub memory_used: u64,
}

const BASE_MEMORY: u64 = 1_000_000_000;
const BYTES_PER_CONTEXT_TOKEN: u64 = 1000;

/// Rough resident-size estimate: a fixed base plus a per-token context
/// share, halved when layers live on the accelerator.
pub fn estimate_memory(context_size: u32, gpu_layers: u32) -> u64 {
    let context = u64::from(context_size) * BYTES_PER_CONTEXT_TOKEN;
    if gpu_layers > 0 {
        BASE_MEMORY + context / 2
    } else {
        BASE_MEMORY + context
    }
}
