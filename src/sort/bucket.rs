//! One partition of the external sort: an append-only file, its mutex and
//! its entry counter.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use super::SortError;

/// Mutable part of a bucket, only reachable through the bucket's mutex.
#[derive(Debug)]
struct BucketState {
    file: Option<File>,
    num_entries: u64,
}

/// A single bucket file.
///
/// All appends go through [`Bucket::write`], which serializes writers of
/// the same bucket while leaving other buckets free for concurrent flushes.
#[derive(Debug)]
pub(crate) struct Bucket {
    path: PathBuf,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Creates (or truncates) the bucket file for writing.
    pub(crate) fn create(path: PathBuf) -> Result<Self, SortError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| SortError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "bucket created");
        Ok(Self {
            path,
            state: Mutex::new(BucketState {
                file: Some(file),
                num_entries: 0,
            }),
        })
    }

    /// Opens an existing bucket file without truncation.
    ///
    /// The entry count is derived from the file length, since bucket files
    /// carry no header.
    pub(crate) fn open_existing(path: PathBuf, record_size: usize) -> Result<Self, SortError> {
        let len = fs::metadata(&path)
            .map_err(|source| SortError::Io {
                path: path.clone(),
                source,
            })?
            .len();
        let record_size = record_size as u64;
        if record_size == 0 || len % record_size != 0 {
            return Err(SortError::TruncatedBucket {
                path,
                len,
                record_size,
            });
        }
        debug!(path = %path.display(), entries = len / record_size, "bucket opened read-only");
        Ok(Self {
            path,
            state: Mutex::new(BucketState {
                file: None,
                num_entries: len / record_size,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BucketState>, SortError> {
        self.state
            .lock()
            .map_err(|_| SortError::Internal(format!("bucket lock poisoned: {}", self.path.display())))
    }

    /// Appends `count` already-encoded records under the bucket's mutex.
    pub(crate) fn write(&self, data: &[u8], count: u64) -> Result<(), SortError> {
        let mut state = self.lock()?;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| SortError::BucketClosed(self.path.clone()))?;
        file.write_all(data).map_err(|source| SortError::Io {
            path: self.path.clone(),
            source,
        })?;
        state.num_entries += count;
        trace!(path = %self.path.display(), count, "bucket append");
        Ok(())
    }

    pub(crate) fn num_entries(&self) -> Result<u64, SortError> {
        Ok(self.lock()?.num_entries)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and releases the write handle. Idempotent.
    pub(crate) fn close(&self) -> Result<(), SortError> {
        let mut state = self.lock()?;
        if let Some(mut file) = state.file.take() {
            file.flush().map_err(|source| SortError::Io {
                path: self.path.clone(),
                source,
            })?;
            debug!(path = %self.path.display(), entries = state.num_entries, "bucket closed");
        }
        Ok(())
    }

    /// Deletes the bucket file. A file that is already gone is not an error.
    pub(crate) fn remove(&self) -> Result<(), SortError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "bucket removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SortError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
