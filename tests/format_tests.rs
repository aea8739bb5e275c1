//! Integration tests for model-file decoding and the local catalog.

use std::path::Path;

use colossus::catalog::{CatalogError, ModelCatalog, ModelSource};
use colossus::format::{self, Invalid, ModelFormat};

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend((s.len() as u64).to_le_bytes());
    out.extend(s.as_bytes());
}

/// A minimal GGUF v3 file: architecture, context length and a token list.
fn gguf_bytes(tensor_count: u64) -> Vec<u8> {
    let mut out = b"GGUF".to_vec();
    out.extend(3u32.to_le_bytes());
    out.extend(tensor_count.to_le_bytes());
    out.extend(3u64.to_le_bytes());

    put_str(&mut out, "general.architecture");
    out.extend(8u32.to_le_bytes());
    put_str(&mut out, "llama");

    put_str(&mut out, "llama.context_length");
    out.extend(4u32.to_le_bytes());
    out.extend(4096u32.to_le_bytes());

    put_str(&mut out, "tokenizer.ggml.tokens");
    out.extend(9u32.to_le_bytes());
    out.extend(8u32.to_le_bytes());
    out.extend(4u64.to_le_bytes());
    for token in ["<s>", "</s>", "a", "b"] {
        put_str(&mut out, token);
    }
    out
}

fn write(dir: &Path, rel: &str, bytes: &[u8]) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn test_decode_gguf_file() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = gguf_bytes(2);
    write(dir.path(), "llama.gguf", &bytes);

    let desc = format::decode(dir.path().join("llama.gguf")).unwrap();
    assert!(desc.valid);
    assert_eq!(desc.format, ModelFormat::Gguf);
    assert_eq!(desc.format_version, "v3");
    assert_eq!(desc.architecture, "llama");
    assert_eq!(desc.context_length, 4096);
    assert_eq!(desc.vocab_size, 4);
    assert_eq!(desc.parameter_estimate, 300_000_000);
    assert_eq!(desc.metadata_count, 3);
    assert_eq!(desc.file_size, bytes.len() as u64);
    assert_eq!(desc.digest(), "GGUF-v3");
}

#[test]
fn test_truncated_gguf_is_invalid_not_error() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = gguf_bytes(2);
    write(dir.path(), "cut.gguf", &bytes[..bytes.len() - 3]);

    let desc = format::decode(dir.path().join("cut.gguf")).unwrap();
    assert!(!desc.valid);
    assert!(matches!(desc.error, Some(Invalid::Truncated(_))));
    assert_eq!(desc.digest(), "");
}

#[test]
fn test_magic_sniffing_without_extension() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "blob", &gguf_bytes(1));
    write(dir.path(), "noise", b"not a model at all");

    assert_eq!(format::decode(dir.path().join("blob")).unwrap().format, ModelFormat::Gguf);

    let desc = format::decode(dir.path().join("noise")).unwrap();
    assert_eq!(desc.format, ModelFormat::Unknown);
    assert_eq!(desc.error, Some(Invalid::UnsupportedFormat));
}

#[test]
fn test_missing_file_is_io_error() {
    assert!(format::decode("/no/such/model.gguf").is_err());
}

#[test]
fn test_catalog_lists_nested_models_sorted() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "zeta.gguf", &gguf_bytes(1));
    write(dir.path(), "family/alpha.gguf", &gguf_bytes(1));
    write(dir.path(), "broken.gguf", b"GGUF");
    write(dir.path(), "notes.txt", b"ignored");

    let catalog = ModelCatalog::new(dir.path());
    let entries = catalog.list().unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["broken", "family/alpha", "zeta"]);

    assert_eq!(entries[0].digest, "");
    assert_eq!(entries[1].digest, "GGUF-v3");
    assert!(entries[2].descriptor.as_ref().unwrap().valid);
}

#[test]
fn test_catalog_of_missing_directory_is_empty() {
    let catalog = ModelCatalog::new("/no/such/models");
    assert!(catalog.list().unwrap().is_empty());
}

#[test]
fn test_resolve_and_remove() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "tiny.bin", b"lmgg....");
    write(dir.path(), "tiny.gguf", &gguf_bytes(1));

    let catalog = ModelCatalog::new(dir.path());
    assert_eq!(catalog.resolve("tiny").unwrap(), dir.path().join("tiny.gguf"));

    catalog.remove("tiny").unwrap();
    assert_eq!(catalog.resolve("tiny").unwrap(), dir.path().join("tiny.bin"));

    catalog.remove("tiny").unwrap();
    assert!(matches!(catalog.resolve("tiny"), Err(CatalogError::NotFound(_))));
}

#[test]
fn test_supported_formats() {
    let formats = format::supported_formats();
    assert!(formats.contains(&"GGUF".to_string()));
    assert!(format::is_model_file("x/model.SafeTensors"));
    assert!(!format::is_model_file("readme.md"));
}
