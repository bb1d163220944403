//! Uploaded file abstraction: a multipart part is held either in memory or
//! behind a temp file that is removed when the value is dropped.

use rand::Rng;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Map of multipart field name to the file parsed for it.
pub type FileMap = HashMap<String, UploadedFile>;

/// One file extracted from a `multipart/form-data` body.
///
/// Small parts stay in memory; parts over the configured thresholds are
/// spilled to a temp file under the configured temp directory. A disk-backed
/// value owns its temp file and unlinks it on drop; unlink failures are
/// logged, never surfaced.
#[derive(Debug)]
pub struct UploadedFile {
    name: String,
    content_type: String,
    data: Vec<u8>,
    temp_path: Option<PathBuf>,
}

impl UploadedFile {
    /// Build an in-memory file.
    pub fn in_memory(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
            temp_path: None,
        }
    }

    /// Build a disk-backed file that owns `temp_path`.
    pub fn on_disk(
        name: impl Into<String>,
        content_type: impl Into<String>,
        temp_path: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: Vec::new(),
            temp_path: Some(temp_path),
        }
    }

    /// Display name of the file (the `filename` from the part headers, or
    /// the field name for parts uploaded without one).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The raw bytes for in-memory files; empty for disk-backed ones.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Path of the owned temp file, when spilled to disk.
    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    pub fn in_memory_storage(&self) -> bool {
        self.temp_path.is_none()
    }

    /// Size in bytes, regardless of where the content lives. Disk-backed
    /// files whose temp file cannot be inspected report zero.
    pub fn size(&self) -> u64 {
        match &self.temp_path {
            None => self.data.len() as u64,
            Some(path) => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }
}

impl Drop for UploadedFile {
    fn drop(&mut self) {
        if let Some(path) = self.temp_path.take() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "Failed to delete temp file");
            }
        }
    }
}

/// Build a collision-resistant temp path `<prefix>-XXXX-XXXX` (random hex)
/// under `dir`. Used for both multipart spill files and request-body spill
/// files.
pub(crate) fn unique_temp_path(dir: &Path, prefix: &str) -> PathBuf {
    let mut rng = rand::thread_rng();
    dir.join(format!(
        "{}-{:04x}-{:04x}",
        prefix,
        rng.gen::<u16>(),
        rng.gen::<u16>()
    ))
}
