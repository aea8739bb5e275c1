//! GGUF container parsing.
//!
//! Reads the fixed header and the typed metadata table of a GGUF file
//! sequentially, without seeking. Tensor descriptors and tensor data are
//! never touched: the tensor count is only used for parameter estimation.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! u32 magic | u32 version | u64 tensor_count | u64 kv_count
//! kv_count × { u64 key_len | key bytes | u32 value_type | payload }
//! ```

use std::collections::HashMap;
use std::io::{self, Read};

use super::Invalid;

/// GGUF magic number: "GGUF" read as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// The only container versions this decoder accepts.
pub const GGUF_VERSIONS: [u32; 2] = [2, 3];

/// Upper bound on any length-prefixed string (keys and string values).
pub const MAX_STRING_LEN: u64 = 1024 * 1024;

/// Upper bound on array element counts.
///
/// Tokenizer vocabularies and merge tables are the largest arrays seen in
/// practice (a few hundred thousand entries).
pub const MAX_ARRAY_LEN: u64 = 8 * 1024 * 1024;

/// Arrays of arrays deeper than this are rejected.
const MAX_NESTING: usize = 4;

/// Metadata value type tags as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

impl TryFrom<u32> for ValueType {
    type Error = Invalid;

    fn try_from(tag: u32) -> Result<Self, Invalid> {
        Ok(match tag {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            other => return Err(Invalid::UnknownValueType(other)),
        })
    }
}

/// A decoded metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    /// Homogeneous array; the element tag is kept so empty arrays stay typed.
    Array(ValueType, Vec<MetadataValue>),
}

impl MetadataValue {
    /// The on-disk tag this value was decoded from.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::U8(_) => ValueType::U8,
            Self::I8(_) => ValueType::I8,
            Self::U16(_) => ValueType::U16,
            Self::I16(_) => ValueType::I16,
            Self::U32(_) => ValueType::U32,
            Self::I32(_) => ValueType::I32,
            Self::U64(_) => ValueType::U64,
            Self::I64(_) => ValueType::I64,
            Self::F32(_) => ValueType::F32,
            Self::F64(_) => ValueType::F64,
            Self::Bool(_) => ValueType::Bool,
            Self::String(_) => ValueType::String,
            Self::Array(..) => ValueType::Array,
        }
    }

    /// Any non-negative integer, widened to u64.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v.into()),
            Self::U16(v) => Some(v.into()),
            Self::U32(v) => Some(v.into()),
            Self::U64(v) => Some(v),
            Self::I8(v) => u64::try_from(v).ok(),
            Self::I16(v) => u64::try_from(v).ok(),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            Self::Array(_, items) => Some(items),
            _ => None,
        }
    }
}

/// One key/value pair from the metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: MetadataValue,
}

/// Decoded GGUF header plus metadata table.
#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata: Vec<MetadataEntry>,
}

impl GgufHeader {
    /// Index the metadata table by key. Later duplicates win.
    pub fn metadata_map(&self) -> HashMap<&str, &MetadataValue> {
        self.metadata
            .iter()
            .map(|e| (e.key.as_str(), &e.value))
            .collect()
    }
}

/// Failure while parsing: either the content is malformed (a validity
/// failure) or the underlying read failed for a reason other than EOF.
#[derive(Debug)]
pub enum ParseError {
    Invalid(Invalid),
    Io(io::Error),
}

impl From<Invalid> for ParseError {
    fn from(reason: Invalid) -> Self {
        Self::Invalid(reason)
    }
}

/// Sequential little-endian reader over any byte source.
struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn fill(&mut self, buf: &mut [u8], what: &'static str) -> Result<(), ParseError> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ParseError::Invalid(Invalid::Truncated(what))
            } else {
                ParseError::Io(e)
            }
        })
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], ParseError> {
        let mut buf = [0u8; N];
        self.fill(&mut buf, what)?;
        Ok(buf)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.array(what)?))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, ParseError> {
        Ok(u64::from_le_bytes(self.array(what)?))
    }

    fn string(
        &mut self,
        what: &'static str,
        too_long: fn(u64) -> Invalid,
    ) -> Result<String, ParseError> {
        let len = self.u64(what)?;
        if len > MAX_STRING_LEN {
            return Err(too_long(len).into());
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf, what)?;
        String::from_utf8(buf).map_err(|_| Invalid::InvalidUtf8(what).into())
    }

    fn value(&mut self, ty: ValueType, depth: usize) -> Result<MetadataValue, ParseError> {
        let value = match ty {
            ValueType::U8 => MetadataValue::U8(u8::from_le_bytes(self.array("u8 value")?)),
            ValueType::I8 => MetadataValue::I8(i8::from_le_bytes(self.array("i8 value")?)),
            ValueType::U16 => MetadataValue::U16(u16::from_le_bytes(self.array("u16 value")?)),
            ValueType::I16 => MetadataValue::I16(i16::from_le_bytes(self.array("i16 value")?)),
            ValueType::U32 => MetadataValue::U32(self.u32("u32 value")?),
            ValueType::I32 => MetadataValue::I32(i32::from_le_bytes(self.array("i32 value")?)),
            ValueType::U64 => MetadataValue::U64(self.u64("u64 value")?),
            ValueType::I64 => MetadataValue::I64(i64::from_le_bytes(self.array("i64 value")?)),
            ValueType::F32 => MetadataValue::F32(f32::from_le_bytes(self.array("f32 value")?)),
            ValueType::F64 => MetadataValue::F64(f64::from_le_bytes(self.array("f64 value")?)),
            ValueType::Bool => {
                let [b] = self.array::<1>("bool value")?;
                MetadataValue::Bool(b != 0)
            }
            ValueType::String => {
                MetadataValue::String(self.string("string value", Invalid::StringTooLong)?)
            }
            ValueType::Array => {
                if depth >= MAX_NESTING {
                    return Err(Invalid::NestingTooDeep.into());
                }
                let elem_ty = ValueType::try_from(self.u32("array element type")?)?;
                let count = self.u64("array length")?;
                if count > MAX_ARRAY_LEN {
                    return Err(Invalid::ArrayTooLong(count).into());
                }
                // Grow as we read so a lying count cannot force a huge allocation.
                let mut items = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    items.push(self.value(elem_ty, depth + 1)?);
                }
                MetadataValue::Array(elem_ty, items)
            }
        };
        Ok(value)
    }
}

/// Parse a GGUF header and its metadata table from the start of `source`.
pub fn read_header<R: Read>(source: R) -> Result<GgufHeader, ParseError> {
    let mut r = Reader { inner: source };

    let magic = r.u32("magic")?;
    if magic != GGUF_MAGIC {
        return Err(Invalid::InvalidMagic(magic).into());
    }

    let version = r.u32("version")?;
    if !GGUF_VERSIONS.contains(&version) {
        return Err(Invalid::UnsupportedVersion(version).into());
    }

    let tensor_count = r.u64("tensor count")?;
    let kv_count = r.u64("metadata count")?;

    let mut metadata = Vec::with_capacity(kv_count.min(1024) as usize);
    for _ in 0..kv_count {
        let key = r.string("metadata key", Invalid::KeyTooLong)?;
        let ty = ValueType::try_from(r.u32("value type")?)?;
        let value = r.value(ty, 0)?;
        metadata.push(MetadataEntry { key, value });
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata,
    })
}

/// Fields the runtime cares about, pulled out of the metadata table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub architecture: String,
    pub context_length: u64,
    pub vocab_size: u64,
}

/// Look up `general.architecture`, then the architecture-prefixed
/// context length and vocabulary size. Missing keys stay at zero.
pub fn extract(header: &GgufHeader) -> Extracted {
    let map = header.metadata_map();

    let architecture = map
        .get("general.architecture")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let context_length = map
        .get(format!("{architecture}.context_length").as_str())
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let vocab_size = map
        .get(format!("{architecture}.vocab_size").as_str())
        .and_then(|v| v.as_u64())
        .or_else(|| {
            map.get("tokenizer.ggml.tokens")
                .and_then(|v| v.as_array())
                .map(|tokens| tokens.len() as u64)
        })
        .unwrap_or(0);

    Extracted {
        architecture,
        context_length,
        vocab_size,
    }
}

/// Approximate parameter count from the tensor count.
///
/// This is a coarse heuristic (a per-architecture constant times the number
/// of tensors), not a measurement. Callers must treat it as a rough size
/// class only.
pub fn estimate_parameters(tensor_count: u64, architecture: &str) -> u64 {
    let per_tensor: u64 = match architecture.to_ascii_lowercase().as_str() {
        "llama" => 150_000_000,
        "gpt2" => 100_000_000,
        "bert" => 80_000_000,
        _ => 100_000_000,
    };
    tensor_count.saturating_mul(per_tensor)
}
