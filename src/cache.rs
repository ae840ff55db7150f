//! Durable local cache: string slots stored as files in one directory.
//!
//! DESIGN
//! ======
//! Each key maps to `<dir>/<key>.json`. Writes go to a uniquely named
//! temp file in the same directory and are renamed over the slot, so a
//! concurrent reader (this process or another) sees either the old value
//! or the new one, never a torn write.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Errors produced by cache slot operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Slot keys are limited to ASCII letters, digits, `_` and `-`.
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),

    /// Filesystem access failed.
    #[error("cache I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidKey`] for keys that are not plain names.
    pub fn slot_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(CacheError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// Read a slot. A missing slot is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] for invalid keys and I/O failures other than
    /// the slot not existing.
    pub fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.slot_path(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Replace a slot atomically.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] for invalid keys or when the temp file cannot
    /// be written or renamed into place.
    pub fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let path = self.slot_path(key)?;
        let tmp = self.dir.join(format!(".{key}.{}.tmp", Uuid::new_v4().simple()));

        let written = fs::File::create(&tmp).and_then(|mut file| {
            file.write_all(value.as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written {
            remove_quietly(&tmp);
            return Err(CacheError::io(&tmp, e));
        }

        fs::rename(&tmp, &path).map_err(|e| {
            remove_quietly(&tmp);
            CacheError::io(&path, e)
        })
    }

    /// Delete a slot. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] for invalid keys and I/O failures.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.slot_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::debug!(path = %path.display(), error = %e, "temp file cleanup failed");
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
