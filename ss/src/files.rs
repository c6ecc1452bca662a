//! File registry behind the HTTP binding
//!
//! Uploads are written under a generated id inside the upload directory. The registry maps
//! each id back to the sanitized name the file was uploaded with, which is the name it is
//! downloaded under. Only registered ids ever touch the filesystem.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ShareError, ShareResult};

/// A file read back from the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Name the file was uploaded under
    pub name: String,
    pub contents: Vec<u8>,
}

#[derive(Debug)]
pub struct FileRegistry {
    dir: PathBuf,
    names: Mutex<HashMap<String, String>>,
}

impl FileRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            names: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn names(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.names.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Save `contents` and return the id it can be downloaded under
    ///
    /// A name with nothing usable left after sanitizing is a [`ShareError::Protocol`] error.
    pub async fn save(&self, original_name: &str, contents: &[u8]) -> ShareResult<String> {
        let name = secure_filename(original_name)
            .ok_or_else(|| ShareError::Protocol(format!("Unusable file name: {:?}", original_name)))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let id = Uuid::now_v7().to_string();
        tokio::fs::write(self.dir.join(&id), contents).await?;

        info!(%id, %name, size = contents.len(), "File uploaded");
        self.names().insert(id.clone(), name);
        Ok(id)
    }

    /// Read a registered file; unknown ids and files gone from disk are `None`
    pub async fn load(&self, id: &str) -> ShareResult<Option<StoredFile>> {
        let Some(name) = self.names().get(id).cloned() else {
            debug!(%id, "FileRegistry::load: unknown id");
            return Ok(None);
        };
        match tokio::fs::read(self.dir.join(id)).await {
            Ok(contents) => Ok(Some(StoredFile { name, contents })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a registered file, returning whether it existed
    pub async fn remove(&self, id: &str) -> ShareResult<bool> {
        if !self.names().contains_key(id) {
            return Ok(false);
        }
        match tokio::fs::remove_file(self.dir.join(id)).await {
            Ok(()) => {
                self.names().remove(id);
                info!(%id, "File deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Registered ids with their original names
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self.names().iter().map(|(id, name)| (id.clone(), name.clone())).collect();
        entries.sort();
        entries
    }
}

/// Reduce an uploaded name to a plain ASCII file name
///
/// Drops any directory part, turns whitespace into `_`, keeps `[A-Za-z0-9._-]` and trims
/// leading and trailing dots and underscores.
pub fn secure_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() => Some('_'),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            _ => None,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}
