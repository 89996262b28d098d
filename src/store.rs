use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::error::{StoreError, ValidationError};

pub const CAPTURE_EXTENSIONS: [&str; 3] = ["pcap", "pcapng", "cap"];

/// Capture format taken from the final extension, so `a.b.pcapng` is `pcapng`.
pub fn capture_kind(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    CAPTURE_EXTENSIONS.iter().copied().find(|known| *known == ext)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub modified: f64,
    pub kind: &'static str,
}

/// Capture files living in one working directory. Names never leave it.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list(&self) -> Result<Vec<StoredFile>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(kind) = capture_kind(&name) else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64());
            files.push(StoredFile {
                name,
                size: meta.len(),
                modified,
                kind,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Maps a client-supplied name or path to a file inside the store.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let file_name = safe_name(name)?;
        let path = self.root.join(&file_name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StoreError::NotFound(file_name))
        }
    }

    /// Writes an uploaded capture and returns the name it was stored under.
    pub fn save(&self, original_name: &str, bytes: &[u8]) -> crate::error::Result<String> {
        let name = safe_name(original_name)?;
        if capture_kind(&name).is_none() {
            return Err(ValidationError::UnsupportedExtension(name).into());
        }

        let stored = if self.root.join(&name).exists() {
            format!("{}_{}", Utc::now().format("%Y%m%d%H%M%S%3f"), name)
        } else {
            name
        };
        fs::write(self.root.join(&stored), bytes).map_err(StoreError::from)?;
        info!("Stored upload {} ({} bytes)", stored, bytes.len());
        Ok(stored)
    }

    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        fs::remove_file(&path)?;
        info!("Deleted {}", path.display());
        Ok(())
    }
}

fn safe_name(name: &str) -> Result<String, StoreError> {
    let file_name = Path::new(name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
    if file_name.starts_with('.') {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(file_name)
}
