//! Plausibility checks for non-GGUF formats.
//!
//! These only confirm that a file looks like the claimed format; none of
//! them parse the full structure.

use super::{Invalid, ModelDescriptor, ModelFormat, GGML_MAGIC};

/// Largest SafeTensors JSON header accepted (100 MiB).
pub const MAX_SAFETENSORS_HEADER: u64 = 100 * 1024 * 1024;

/// ONNX files smaller than this are rejected outright.
pub const MIN_ONNX_SIZE: u64 = 1024;

/// Default size class for formats that carry no usable metadata.
const DEFAULT_PARAMETERS: u64 = 7_000_000_000;

/// Leading bytes of a pickle stream: protocol opcode, or list/tuple marks.
pub fn has_pickle_marker(head: &[u8]) -> bool {
    matches!(head.first(), Some(0x80 | b']' | b'('))
}

pub fn validate_ggml(head: &[u8], file_size: u64) -> ModelDescriptor {
    let Some(bytes) = head.get(..4) else {
        return ModelDescriptor::invalid(ModelFormat::Ggml, file_size, Invalid::Truncated("magic"));
    };
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != GGML_MAGIC {
        return ModelDescriptor::invalid(ModelFormat::Ggml, file_size, Invalid::InvalidMagic(magic));
    }

    ModelDescriptor {
        architecture: "unknown".to_string(),
        parameter_estimate: DEFAULT_PARAMETERS,
        ..ModelDescriptor::valid(ModelFormat::Ggml, file_size)
    }
}

/// SafeTensors starts with a u64 little-endian JSON header length.
pub fn validate_safetensors(head: &[u8], file_size: u64) -> ModelDescriptor {
    let Some(len_bytes) = head.get(..8) else {
        return ModelDescriptor::invalid(
            ModelFormat::SafeTensors,
            file_size,
            Invalid::Truncated("header length"),
        );
    };
    let mut buf = [0u8; 8];
    buf.copy_from_slice(len_bytes);
    let header_len = u64::from_le_bytes(buf);

    if header_len > MAX_SAFETENSORS_HEADER {
        return ModelDescriptor::invalid(
            ModelFormat::SafeTensors,
            file_size,
            Invalid::HeaderTooLarge(header_len),
        );
    }

    ModelDescriptor {
        architecture: "transformer".to_string(),
        ..ModelDescriptor::valid(ModelFormat::SafeTensors, file_size)
    }
}

pub fn validate_pytorch(head: &[u8], file_size: u64) -> ModelDescriptor {
    if !has_pickle_marker(head) {
        return ModelDescriptor::invalid(ModelFormat::PyTorch, file_size, Invalid::NotPickle);
    }

    ModelDescriptor {
        architecture: "transformer".to_string(),
        parameter_estimate: DEFAULT_PARAMETERS,
        ..ModelDescriptor::valid(ModelFormat::PyTorch, file_size)
    }
}

pub fn validate_onnx(file_size: u64) -> ModelDescriptor {
    if file_size < MIN_ONNX_SIZE {
        return ModelDescriptor::invalid(ModelFormat::Onnx, file_size, Invalid::TooSmall(file_size));
    }

    ModelDescriptor {
        architecture: "onnx".to_string(),
        ..ModelDescriptor::valid(ModelFormat::Onnx, file_size)
    }
}
