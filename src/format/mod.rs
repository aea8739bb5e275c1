//! Model file format detection and validation.
//!
//! - [`gguf`]: full header/metadata decoding for GGUF containers
//! - [`shallow`]: plausibility checks for the other supported formats
//!
//! [`decode`] is the entry point. It only fails on I/O: malformed content
//! comes back as a [`ModelDescriptor`] with `valid == false`, so a
//! directory scan can skip bad files instead of aborting.

pub mod gguf;
pub mod shallow;

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

pub use gguf::{GGUF_MAGIC, GGUF_VERSIONS};

/// Legacy GGML magic number ("ggml" read as a little-endian u32).
pub const GGML_MAGIC: u32 = 0x6767_6d6c;

/// File extensions recognised as model files.
pub const MODEL_EXTENSIONS: [&str; 7] = ["gguf", "ggml", "bin", "safetensors", "onnx", "pt", "pth"];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a file failed validation. Carried as data, never raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Invalid {
    #[error("invalid-magic: 0x{0:08x}")]
    InvalidMagic(u32),

    #[error("unsupported-version: {0}")]
    UnsupportedVersion(u32),

    #[error("key-too-long: {0} bytes")]
    KeyTooLong(u64),

    #[error("string-too-long: {0} bytes")]
    StringTooLong(u64),

    #[error("array-too-long: {0} elements")]
    ArrayTooLong(u64),

    #[error("nesting-too-deep")]
    NestingTooDeep,

    #[error("unknown-value-type: {0}")]
    UnknownValueType(u32),

    #[error("truncated: {0}")]
    Truncated(&'static str),

    #[error("invalid-utf8: {0}")]
    InvalidUtf8(&'static str),

    #[error("header-too-large: {0} bytes")]
    HeaderTooLarge(u64),

    #[error("not-a-pickle")]
    NotPickle,

    #[error("file-too-small: {0} bytes")]
    TooSmall(u64),

    #[error("unsupported-format")]
    UnsupportedFormat,
}

impl Serialize for Invalid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Container formats the decoder can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModelFormat {
    Unknown,
    Gguf,
    Ggml,
    SafeTensors,
    PyTorch,
    Onnx,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Gguf => "GGUF",
            Self::Ggml => "GGML",
            Self::SafeTensors => "SafeTensors",
            Self::PyTorch => "PyTorch",
            Self::Onnx => "ONNX",
        };
        f.write_str(name)
    }
}

/// Result of decoding a model file. Immutable once produced.
///
/// `error` is `Some` exactly when `valid` is false; use the constructors
/// below rather than building the struct by hand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub format: ModelFormat,

    /// Container version, e.g. "v3". Empty when the format has none.
    pub format_version: String,

    /// Architecture name; empty if the file does not say.
    pub architecture: String,

    pub context_length: u64,
    pub vocab_size: u64,

    /// Rough parameter count. See [`gguf::estimate_parameters`].
    pub parameter_estimate: u64,

    pub file_size: u64,
    pub metadata_count: u64,

    pub valid: bool,
    pub error: Option<Invalid>,
}

impl ModelDescriptor {
    fn valid(format: ModelFormat, file_size: u64) -> Self {
        Self {
            format,
            format_version: String::new(),
            architecture: String::new(),
            context_length: 0,
            vocab_size: 0,
            parameter_estimate: 0,
            file_size,
            metadata_count: 0,
            valid: true,
            error: None,
        }
    }

    fn invalid(format: ModelFormat, file_size: u64, reason: Invalid) -> Self {
        Self {
            valid: false,
            error: Some(reason),
            ..Self::valid(format, file_size)
        }
    }

    /// Digest used in model listings: `"{FORMAT}-{version}"` for valid files.
    pub fn digest(&self) -> String {
        if self.valid {
            format!("{}-{}", self.format, self.format_version)
        } else {
            String::new()
        }
    }
}

/// Whether a file name carries one of the supported model extensions.
pub fn is_model_file(name: impl AsRef<Path>) -> bool {
    extension(name.as_ref())
        .map(|ext| MODEL_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Human-readable names of every format the decoder understands.
pub fn supported_formats() -> Vec<String> {
    [
        ModelFormat::Gguf,
        ModelFormat::Ggml,
        ModelFormat::SafeTensors,
        ModelFormat::PyTorch,
        ModelFormat::Onnx,
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn magic_of(head: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = head.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Pick a format from the extension hint, then the leading bytes.
pub fn detect_format(path: &Path, head: &[u8]) -> ModelFormat {
    let magic = magic_of(head);

    match extension(path).as_deref() {
        Some("gguf") => return ModelFormat::Gguf,
        Some(ext @ ("ggml" | "bin")) => {
            if magic == Some(GGML_MAGIC) {
                return ModelFormat::Ggml;
            }
            if shallow::has_pickle_marker(head) {
                return ModelFormat::PyTorch;
            }
            if ext == "bin" {
                return ModelFormat::Ggml;
            }
        }
        Some("safetensors") => return ModelFormat::SafeTensors,
        Some("onnx") => return ModelFormat::Onnx,
        Some("pt" | "pth") => return ModelFormat::PyTorch,
        _ => {}
    }

    match magic {
        Some(GGUF_MAGIC) => ModelFormat::Gguf,
        Some(GGML_MAGIC) => ModelFormat::Ggml,
        _ => ModelFormat::Unknown,
    }
}

/// Decode a model file into a descriptor.
///
/// Returns `Err` only when the file cannot be opened or read.
pub fn decode(path: impl AsRef<Path>) -> Result<ModelDescriptor, DecodeError> {
    let path = path.as_ref();
    let io_err = |source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let file_size = file.metadata().map_err(io_err)?.len();
    let mut reader = BufReader::new(file);

    let mut head = Vec::with_capacity(16);
    (&mut reader)
        .take(16)
        .read_to_end(&mut head)
        .map_err(io_err)?;
    reader.seek(SeekFrom::Start(0)).map_err(io_err)?;

    let format = detect_format(path, &head);
    debug!(path = %path.display(), %format, file_size, "Detected model format");

    let descriptor = match format {
        ModelFormat::Gguf => decode_gguf(reader, file_size).map_err(io_err)?,
        ModelFormat::Ggml => shallow::validate_ggml(&head, file_size),
        ModelFormat::SafeTensors => shallow::validate_safetensors(&head, file_size),
        ModelFormat::PyTorch => shallow::validate_pytorch(&head, file_size),
        ModelFormat::Onnx => shallow::validate_onnx(file_size),
        ModelFormat::Unknown => {
            ModelDescriptor::invalid(ModelFormat::Unknown, file_size, Invalid::UnsupportedFormat)
        }
    };

    if let Some(reason) = &descriptor.error {
        debug!(path = %path.display(), %format, %reason, "Model file failed validation");
    }

    Ok(descriptor)
}

fn decode_gguf<R: Read>(reader: R, file_size: u64) -> Result<ModelDescriptor, io::Error> {
    let header = match gguf::read_header(reader) {
        Ok(header) => header,
        Err(gguf::ParseError::Invalid(reason)) => {
            return Ok(ModelDescriptor::invalid(ModelFormat::Gguf, file_size, reason));
        }
        Err(gguf::ParseError::Io(e)) => return Err(e),
    };

    let fields = gguf::extract(&header);
    let parameter_estimate = gguf::estimate_parameters(header.tensor_count, &fields.architecture);

    Ok(ModelDescriptor {
        format_version: format!("v{}", header.version),
        context_length: fields.context_length,
        vocab_size: fields.vocab_size,
        parameter_estimate,
        metadata_count: header.metadata.len() as u64,
        architecture: fields.architecture,
        ..ModelDescriptor::valid(ModelFormat::Gguf, file_size)
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::gguf::tests::GgufBuilder;
    use super::*;

    fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_decode_valid_gguf() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = GgufBuilder::new()
            .string("general.architecture", "llama")
            .u32("llama.context_length", 4096)
            .u32("llama.vocab_size", 32000);
        builder.tensor_count = 291;
        let path = write_file(&dir, "tiny.gguf", &builder.build());

        let desc = decode(&path).unwrap();
        assert!(desc.valid);
        assert_eq!(desc.error, None);
        assert_eq!(desc.format, ModelFormat::Gguf);
        assert_eq!(desc.format_version, "v3");
        assert_eq!(desc.architecture, "llama");
        assert_eq!(desc.context_length, 4096);
        assert_eq!(desc.vocab_size, 32000);
        assert_eq!(desc.parameter_estimate, 291 * 150_000_000);
        assert_eq!(desc.metadata_count, 3);
        assert_eq!(desc.digest(), "GGUF-v3");
    }

    #[test]
    fn test_decode_sniffs_gguf_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = GgufBuilder::new()
            .string("general.architecture", "phi2")
            .build();
        let path = write_file(&dir, "model", &bytes);

        let desc = decode(&path).unwrap();
        assert_eq!(desc.format, ModelFormat::Gguf);
        assert_eq!(desc.architecture, "phi2");
    }

    #[test]
    fn test_unsupported_version_is_data_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = GgufBuilder::new();
        builder.version = 7;
        let path = write_file(&dir, "future.gguf", &builder.build());

        let desc = decode(&path).unwrap();
        assert!(!desc.valid);
        assert_eq!(desc.error, Some(Invalid::UnsupportedVersion(7)));
        assert!(desc.error.as_ref().unwrap().to_string().starts_with("unsupported-version"));
        assert_eq!(desc.digest(), "");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = decode(dir.path().join("nope.gguf"));
        assert!(matches!(result, Err(DecodeError::Io { .. })));
    }

    #[test]
    fn test_unknown_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "notes.txt", b"hello world");
        let desc = decode(&path).unwrap();
        assert_eq!(desc.format, ModelFormat::Unknown);
        assert_eq!(desc.error, Some(Invalid::UnsupportedFormat));
    }

    #[test]
    fn test_detect_format_hints() {
        let ggml = GGML_MAGIC.to_le_bytes();
        assert_eq!(detect_format(Path::new("a.bin"), &ggml), ModelFormat::Ggml);
        assert_eq!(detect_format(Path::new("a.bin"), &[0x80, 2]), ModelFormat::PyTorch);
        assert_eq!(detect_format(Path::new("a.bin"), b"zzzz"), ModelFormat::Ggml);
        assert_eq!(detect_format(Path::new("a.ggml"), b"zzzz"), ModelFormat::Unknown);
        assert_eq!(detect_format(Path::new("a.PT"), b""), ModelFormat::PyTorch);
        assert_eq!(
            detect_format(Path::new("a.safetensors"), b""),
            ModelFormat::SafeTensors
        );
        assert_eq!(detect_format(Path::new("a"), &ggml), ModelFormat::Ggml);
        assert_eq!(detect_format(Path::new("a"), b"GG"), ModelFormat::Unknown);
    }

    #[test]
    fn test_is_model_file() {
        assert!(is_model_file("llama.gguf"));
        assert!(is_model_file("weights.SafeTensors"));
        assert!(!is_model_file("readme.md"));
        assert!(!is_model_file("gguf"));
        assert_eq!(supported_formats().len(), 5);
    }
}
