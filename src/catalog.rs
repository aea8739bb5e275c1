//! Local model catalog.
//!
//! Scans a models directory for files with a model extension, decodes each
//! one, and produces listing entries. Also resolves a model name to a local
//! path, which is all the engine needs from model acquisition.
//!
//! Names come from HTTP clients, so resolution never leaves the models
//! directory: absolute names and `..` are rejected, and a candidate whose
//! real path lies outside the directory (a symlink out) is not found.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::format::{self, ModelDescriptor};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("invalid model name: {0:?}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Anything that can turn a model name into a local file path.
///
/// The local catalog is one implementation; a hub downloader or an alias
/// table would be others.
pub trait ModelSource: Send + Sync {
    fn resolve(&self, name: &str) -> Result<PathBuf, CatalogError>;
}

/// One row of a model listing.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    /// Path relative to the models directory, without extension.
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub modified_at: u64,
    /// `"{FORMAT}-{version}"` for valid files, empty otherwise.
    pub digest: String,
    pub descriptor: Option<ModelDescriptor>,
}

/// Model files under a single directory.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    root: PathBuf,
}

/// Extensions tried, in order, when resolving a bare model name.
const RESOLVE_EXTENSIONS: [&str; 2] = ["gguf", "bin"];

impl ModelCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every model file under the root, sorted by name.
    ///
    /// Files that fail to decode are still listed (with an empty digest);
    /// a file that cannot be read at all is logged and listed without a
    /// descriptor.
    pub fn list(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut files = Vec::new();
        if self.root.is_dir() {
            walk(&self.root, &mut files)?;
        }

        let mut entries: Vec<CatalogEntry> = files
            .into_iter()
            .filter(|p| format::is_model_file(p))
            .filter_map(|path| self.entry(path))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn entry(&self, path: PathBuf) -> Option<CatalogEntry> {
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable model file");
                return None;
            }
        };

        let descriptor = match format::decode(&path) {
            Ok(desc) => Some(desc),
            Err(e) => {
                warn!(error = %e, "Failed to validate model");
                None
            }
        };

        let rel = path.strip_prefix(&self.root).unwrap_or(&path);
        let name = rel.with_extension("").to_string_lossy().replace('\\', "/");

        debug!(name = %name, valid = descriptor.as_ref().map(|d| d.valid), "Catalog entry");

        Some(CatalogEntry {
            name,
            size: meta.len(),
            modified_at: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
            digest: descriptor.as_ref().map(|d| d.digest()).unwrap_or_default(),
            descriptor,
            path,
        })
    }

    /// Delete the file a model name resolves to.
    pub fn remove(&self, name: &str) -> Result<PathBuf, CatalogError> {
        let path = self.resolve(name)?;
        fs::remove_file(&path)?;
        Ok(path)
    }
}

impl ModelSource for ModelCatalog {
    /// `{root}/{name}.gguf`, then `{root}/{name}.bin`. `name` may name a
    /// subdirectory (`org/model`) but must stay under the root.
    fn resolve(&self, name: &str) -> Result<PathBuf, CatalogError> {
        if !is_relative_name(name) {
            return Err(CatalogError::InvalidName(name.to_string()));
        }
        let Ok(root) = fs::canonicalize(&self.root) else {
            return Err(CatalogError::NotFound(name.to_string()));
        };

        for ext in RESOLVE_EXTENSIONS {
            let candidate = self.root.join(format!("{name}.{ext}"));
            if !candidate.is_file() {
                continue;
            }
            if fs::canonicalize(&candidate)?.starts_with(&root) {
                return Ok(candidate);
            }
            warn!(path = %candidate.display(), "Model file points outside the models directory");
        }

        Err(CatalogError::NotFound(name.to_string()))
    }
}

/// Non-empty and made only of plain path segments.
fn is_relative_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
