//! Engine selection and default load options.
//!
//! The factory is handed an explicit [`EngineConfig`]; it never reads the
//! environment. A native engine is only built when the `llama` feature is
//! compiled in and the library initializes (or `force_native` is set);
//! otherwise the offline fallback engine is used.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gpu::device::{AcceleratorKind, AcceleratorProbe, SystemProbe};
use crate::inference::engine::{InferenceEngine, LocalEngine};
use crate::inference::fallback::FallbackBackend;
use crate::inference::native;
use crate::inference::types::ModelOptions;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Accelerator memory kept free for the runtime and scratch buffers.
pub const RESERVED_ACCELERATOR_BYTES: u64 = 2 * GIB;

/// Model size assumed when deriving offload layers before a file is read.
pub const ASSUMED_PARAMETERS: u64 = 7_000_000_000;

pub const NATIVE_CONTEXT_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Fallback,
    Native,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Fallback => f.write_str("fallback"),
            EngineKind::Native => f.write_str("native"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    /// Accepts the engine names and their common aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fallback" | "simulated" | "demo" | "test" => Ok(EngineKind::Fallback),
            "native" | "llama" | "llamacpp" | "llama.cpp" => Ok(EngineKind::Native),
            other => Err(format!("unknown engine: {other}")),
        }
    }
}

/// What the caller wants built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Requested engine.
    pub kind: EngineKind,

    /// Build the native engine without checking that the library
    /// initializes. Still requires the `llama` feature.
    pub force_native: bool,

    /// Override the derived offload-layer count.
    pub gpu_layers: Option<u32>,

    pub context_size: Option<u32>,
    pub batch_size: Option<u32>,
}

/// Per-layer memory and layer cap for one model size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadTier {
    pub max_parameters: u64,
    pub bytes_per_layer: u64,
    pub max_layers: u32,
}

pub static OFFLOAD_TIERS: [OffloadTier; 3] = [
    OffloadTier {
        max_parameters: 3_000_000_000,
        bytes_per_layer: 100 * MIB,
        max_layers: 32,
    },
    OffloadTier {
        max_parameters: 7_000_000_000,
        bytes_per_layer: 100 * MIB,
        max_layers: 40,
    },
    OffloadTier {
        max_parameters: u64::MAX,
        bytes_per_layer: 200 * MIB,
        max_layers: 80,
    },
];

/// Layers that fit in `total_bytes` of accelerator memory for a model of
/// `parameters`, after the reserve. Zero when nothing fits.
pub fn offload_layers(total_bytes: u64, parameters: u64) -> u32 {
    let tier = OFFLOAD_TIERS
        .iter()
        .find(|t| parameters <= t.max_parameters)
        .unwrap_or(&OFFLOAD_TIERS[OFFLOAD_TIERS.len() - 1]);

    let usable = total_bytes.saturating_sub(RESERVED_ACCELERATOR_BYTES);
    let layers = usable / tier.bytes_per_layer;
    layers.min(u64::from(tier.max_layers)) as u32
}

pub struct EngineFactory<P = SystemProbe> {
    config: EngineConfig,
    probe: P,
}

impl EngineFactory<SystemProbe> {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            probe: SystemProbe,
        }
    }
}

impl<P: AcceleratorProbe> EngineFactory<P> {
    pub fn with_probe(config: EngineConfig, probe: P) -> Self {
        Self { config, probe }
    }

    /// The engine [`create`](Self::create) will build.
    pub fn selected_kind(&self) -> EngineKind {
        match self.config.kind {
            EngineKind::Fallback => EngineKind::Fallback,
            EngineKind::Native if native::is_available(self.config.force_native) => {
                EngineKind::Native
            }
            EngineKind::Native => {
                warn!("Native inference library not available, falling back to offline engine");
                EngineKind::Fallback
            }
        }
    }

    pub fn create(&self) -> Arc<dyn InferenceEngine> {
        let kind = self.selected_kind();
        info!(engine = %kind, "Creating inference engine");
        match kind {
            EngineKind::Native => match native::backend() {
                Some(backend) => Arc::new(LocalEngine::new(EngineKind::Native, backend)),
                None => {
                    warn!("Native backend could not be constructed, using offline engine");
                    Arc::new(LocalEngine::new(
                        EngineKind::Fallback,
                        Box::new(FallbackBackend::new()),
                    ))
                }
            },
            EngineKind::Fallback => Arc::new(LocalEngine::new(
                EngineKind::Fallback,
                Box::new(FallbackBackend::new()),
            )),
        }
    }

    /// Load options for models served by an engine of `kind`.
    pub fn default_options(&self, kind: EngineKind) -> ModelOptions {
        let mut opts = ModelOptions::default();

        if kind == EngineKind::Native {
            opts.context_size = NATIVE_CONTEXT_SIZE;

            let accel = self.probe.probe();
            if accel.is_available() {
                let total = accel.total_memory();
                opts.gpu_layers = offload_layers(total, ASSUMED_PARAMETERS);
                opts.accelerator = accel.kind;
                info!(
                    accelerator = %accel.kind,
                    total_memory = total,
                    gpu_layers = opts.gpu_layers,
                    "Derived offload layers"
                );
            } else {
                opts.accelerator = AcceleratorKind::None;
            }
        }

        if let Some(layers) = self.config.gpu_layers {
            opts.gpu_layers = layers;
        }
        if let Some(ctx) = self.config.context_size {
            opts.context_size = ctx;
        }
        if let Some(batch) = self.config.batch_size {
            opts.batch_size = batch;
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::{stub_devices, AcceleratorInfo, FixedProbe};

    #[test]
    fn test_offload_layers() {
        assert_eq!(offload_layers(0, ASSUMED_PARAMETERS), 0);
        assert_eq!(offload_layers(GIB, ASSUMED_PARAMETERS), 0);
        assert_eq!(offload_layers(2 * GIB, ASSUMED_PARAMETERS), 0);
        // 2 GiB usable at 100 MiB per layer.
        assert_eq!(offload_layers(4 * GIB, ASSUMED_PARAMETERS), 20);
        assert_eq!(offload_layers(16 * GIB, ASSUMED_PARAMETERS), 40);
        assert_eq!(offload_layers(16 * GIB, 1_000_000_000), 32);
        assert_eq!(offload_layers(12 * GIB, 13_000_000_000), 51);
        assert_eq!(offload_layers(48 * GIB, 70_000_000_000), 80);
    }

    #[test]
    fn test_fallback_defaults() {
        let factory = EngineFactory::with_probe(
            EngineConfig::default(),
            FixedProbe(stub_devices(2, 8 * GIB)),
        );
        let opts = factory.default_options(EngineKind::Fallback);
        assert_eq!(opts, ModelOptions::default());
        assert_eq!(opts.context_size, 2048);
        assert_eq!(opts.gpu_layers, 0);
    }

    #[test]
    fn test_native_defaults_use_probe() {
        let factory = EngineFactory::with_probe(
            EngineConfig::default(),
            FixedProbe(stub_devices(2, 8 * GIB)),
        );
        let opts = factory.default_options(EngineKind::Native);
        assert_eq!(opts.context_size, NATIVE_CONTEXT_SIZE);
        assert_eq!(opts.gpu_layers, 40);
        assert_eq!(opts.accelerator, AcceleratorKind::Cuda);

        let factory =
            EngineFactory::with_probe(EngineConfig::default(), FixedProbe(AcceleratorInfo::none()));
        let opts = factory.default_options(EngineKind::Native);
        assert_eq!(opts.gpu_layers, 0);
        assert_eq!(opts.accelerator, AcceleratorKind::None);
    }

    #[test]
    fn test_overrides_win() {
        let config = EngineConfig {
            gpu_layers: Some(3),
            context_size: Some(1024),
            batch_size: Some(64),
            ..Default::default()
        };
        let factory = EngineFactory::with_probe(config, FixedProbe(stub_devices(1, 24 * GIB)));
        let opts = factory.default_options(EngineKind::Native);
        assert_eq!(opts.gpu_layers, 3);
        assert_eq!(opts.context_size, 1024);
        assert_eq!(opts.batch_size, 64);
    }

    #[test]
    fn test_selection() {
        let factory = EngineFactory::with_probe(
            EngineConfig::default(),
            FixedProbe(AcceleratorInfo::none()),
        );
        assert_eq!(factory.selected_kind(), EngineKind::Fallback);
        assert_eq!(factory.create().kind(), EngineKind::Fallback);

        let config = EngineConfig {
            kind: EngineKind::Native,
            ..Default::default()
        };
        let factory = EngineFactory::with_probe(config, FixedProbe(AcceleratorInfo::none()));
        if !cfg!(feature = "llama") {
            assert_eq!(factory.selected_kind(), EngineKind::Fallback);
        }
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("llamacpp".parse::<EngineKind>().unwrap(), EngineKind::Native);
        assert_eq!("Simulated".parse::<EngineKind>().unwrap(), EngineKind::Fallback);
        assert!("gpu".parse::<EngineKind>().is_err());
    }
}
