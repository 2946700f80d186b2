//! # Flat Table
//!
//! A homogeneous, append-only file of fixed-size records with no header.
//! The entry count travels out-of-band in a [`TableInfo`] descriptor.
//!
//! ## Writing
//!
//! A table created with zero entries is a **writer**: [`DiskTable::write`]
//! stages encoded records in a write-budget [`ByteBuffer`] and issues one
//! bulk write per full buffer. Writers are single-threaded; a pipeline
//! gives the table to exactly one stage worker as its local state.
//!
//! ## Reading
//!
//! A table described by a descriptor with a non-zero count is a **reader**.
//! [`DiskTable::read`] splits `[0, num_entries)` into contiguous blocks of
//! `block_size` records (the last one may be shorter) and hands them to a
//! pool of read workers. Every worker owns an independently opened file
//! handle and its own block buffer, so no worker contends on a shared file
//! cursor. Each block is emitted as `(records, block_start_offset)`.
//!
//! ## On-disk layout
//!
//! ```text
//! [record 0][record 1] ... [record N-1]      (N × T::DISK_SIZE bytes)
//! ```

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::buffer::ByteBuffer;
use crate::encoding::{self, EncodingError, FixedRecord};
use crate::pipeline::{self, PipelineError, StageInput, ThreadPool};

/// Upper bound on concurrent read workers per table.
pub const MAX_READ_THREADS: usize = 256;

/// Smallest accepted read block, in records.
pub const MIN_READ_BLOCK: usize = 1024;

/// Default write staging budget in bytes.
pub const DEFAULT_WRITE_CACHE_SIZE: usize = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by flat table operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error on the table file.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid read thread count or block size.
    #[error("invalid table config: {0}")]
    InvalidConfig(String),

    /// The table is still open for writing.
    #[error("table '{0}' is still being written")]
    NotFinalized(PathBuf),

    /// The table describes an existing, finalized file.
    #[error("table '{0}' is read-only")]
    ReadOnly(PathBuf),

    /// Record encoding or decoding failed.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A pipeline stage failed.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

// ------------------------------------------------------------------------------------------------
// TableInfo — descriptor
// ------------------------------------------------------------------------------------------------

/// Descriptor of a finalized table: its file and how many records it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub file_name: PathBuf,
    pub num_entries: u64,
}

impl TableInfo {
    /// Deletes the table file.
    pub fn remove(&self) -> Result<(), TableError> {
        fs::remove_file(&self.file_name).map_err(|source| TableError::Io {
            path: self.file_name.clone(),
            source,
        })?;
        debug!(path = %self.file_name.display(), "table removed");
        Ok(())
    }
}

/// Splits `[0, num_entries)` into `(start, len)` blocks of `block_size`
/// records; only the last block may be shorter.
pub fn block_partition(num_entries: u64, block_size: u64) -> impl Iterator<Item = (u64, u64)> {
    let block_size = block_size.max(1);
    (0..num_entries.div_ceil(block_size)).map(move |i| {
        let start = i * block_size;
        (start, block_size.min(num_entries - start))
    })
}

// ------------------------------------------------------------------------------------------------
// DiskTable
// ------------------------------------------------------------------------------------------------

/// Per-worker state of the read pool.
struct BlockReader {
    file: File,
    buffer: Vec<u8>,
}

/// A flat table of `T` records.
pub struct DiskTable<T> {
    file_name: PathBuf,
    num_entries: u64,
    cache: ByteBuffer,
    file_out: Option<File>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for DiskTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTable")
            .field("file_name", &self.file_name)
            .field("num_entries", &self.num_entries)
            .field("writing", &self.file_out.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: FixedRecord> DiskTable<T> {
    /// Creates a writer when `num_entries == 0`, otherwise describes an
    /// existing finalized file.
    pub fn new(
        file_name: impl AsRef<Path>,
        num_entries: u64,
        write_cache_size: usize,
    ) -> Result<Self, TableError> {
        if num_entries == 0 {
            Self::create(file_name, write_cache_size)
        } else {
            Ok(Self::open(&TableInfo {
                file_name: file_name.as_ref().to_path_buf(),
                num_entries,
            }))
        }
    }

    /// Opens a fresh, truncated file for writing.
    pub fn create(file_name: impl AsRef<Path>, write_cache_size: usize) -> Result<Self, TableError> {
        let file_name = file_name.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&file_name)
            .map_err(|source| TableError::Io {
                path: file_name.clone(),
                source,
            })?;
        debug!(path = %file_name.display(), "table created");
        Ok(Self {
            file_name,
            num_entries: 0,
            cache: ByteBuffer::for_record::<T>(write_cache_size),
            file_out: Some(file),
            _marker: PhantomData,
        })
    }

    /// Describes an existing, finalized table. The file is opened lazily
    /// by [`DiskTable::read`].
    pub fn open(info: &TableInfo) -> Self {
        Self {
            file_name: info.file_name.clone(),
            num_entries: info.num_entries,
            cache: ByteBuffer::for_record::<T>(0),
            file_out: None,
            _marker: PhantomData,
        }
    }

    /// Descriptor of this table. While writing, counts flushed records only.
    pub fn info(&self) -> TableInfo {
        TableInfo {
            file_name: self.file_name.clone(),
            num_entries: self.num_entries,
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    /// Appends one record. Not thread-safe.
    pub fn write(&mut self, entry: &T) -> Result<(), TableError> {
        if self.file_out.is_none() {
            return Err(TableError::ReadOnly(self.file_name.clone()));
        }
        self.cache.push(entry)?;
        if self.cache.is_full() {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes all staged records in a single call.
    pub fn flush(&mut self) -> Result<(), TableError> {
        let Some(file) = self.file_out.as_mut() else {
            return Err(TableError::ReadOnly(self.file_name.clone()));
        };
        if self.cache.is_empty() {
            return Ok(());
        }
        file.write_all(self.cache.filled())
            .map_err(|source| TableError::Io {
                path: self.file_name.clone(),
                source,
            })?;
        self.num_entries += self.cache.count() as u64;
        self.cache.reset();
        Ok(())
    }

    /// Flushes and releases the write handle. A no-op for readers.
    pub fn close(&mut self) -> Result<(), TableError> {
        if self.file_out.is_none() {
            return Ok(());
        }
        self.flush()?;
        if let Some(mut file) = self.file_out.take() {
            file.flush().map_err(|source| TableError::Io {
                path: self.file_name.clone(),
                source,
            })?;
        }
        debug!(path = %self.file_name.display(), entries = self.num_entries, "table closed");
        Ok(())
    }

    /// Streams the table to `output` as `(records, block_start_offset)`
    /// blocks using `num_read_threads` workers.
    ///
    /// # Errors
    ///
    /// - [`TableError::InvalidConfig`] if `num_read_threads` is zero or
    ///   above [`MAX_READ_THREADS`], or `block_size` is below
    ///   [`MIN_READ_BLOCK`].
    /// - [`TableError::NotFinalized`] if the table is still being written.
    /// - [`TableError::Io`] on any open, seek or short read.
    pub fn read(
        &self,
        output: &StageInput<(Vec<T>, u64)>,
        num_read_threads: usize,
        block_size: usize,
    ) -> Result<(), TableError> {
        if num_read_threads == 0 || num_read_threads > MAX_READ_THREADS {
            return Err(TableError::InvalidConfig(format!(
                "num_read_threads must be in 1..={MAX_READ_THREADS}, got {num_read_threads}"
            )));
        }
        if block_size < MIN_READ_BLOCK {
            return Err(TableError::InvalidConfig(format!(
                "block_size must be >= {MIN_READ_BLOCK}, got {block_size}"
            )));
        }
        if self.file_out.is_some() {
            return Err(TableError::NotFinalized(self.file_name.clone()));
        }
        if self.num_entries == 0 {
            return Ok(());
        }

        let begin = Instant::now();
        let block_size = block_size as u64;
        let num_blocks = self.num_entries.div_ceil(block_size);
        let buffer_len = block_size.min(self.num_entries) as usize * T::DISK_SIZE;

        let mut locals = Vec::new();
        for _ in 0..(num_read_threads as u64).min(num_blocks) {
            let file = File::open(&self.file_name).map_err(|source| TableError::Io {
                path: self.file_name.clone(),
                source,
            })?;
            locals.push(BlockReader {
                file,
                buffer: vec![0u8; buffer_len],
            });
        }

        let out = output.clone();
        let path = self.file_name.clone();
        let pool = ThreadPool::new(
            "table/read",
            locals,
            num_read_threads,
            move |(start, count): (u64, u64), reader: &mut BlockReader| {
                let records = read_block::<T>(&path, reader, start, count)?;
                out.take((records, start))?;
                Ok(())
            },
        )?;

        let mut submitted = Ok(());
        for block in block_partition(self.num_entries, block_size) {
            if let Err(e) = pool.take(block) {
                submitted = Err(e);
                break;
            }
        }
        pipeline::settle(vec![submitted, pool.close().map(|_| ())])?;

        info!(
            path = %self.file_name.display(),
            entries = self.num_entries,
            blocks = num_blocks,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "table read"
        );
        Ok(())
    }
}

impl<T> Drop for DiskTable<T> {
    fn drop(&mut self) {
        let Some(mut file) = self.file_out.take() else {
            return;
        };
        if !self.cache.is_empty() {
            if let Err(e) = file.write_all(self.cache.filled()) {
                error!(path = %self.file_name.display(), "table flush on drop failed: {e}");
            }
            self.cache.reset();
        }
    }
}

/// Reads `count` records starting at record `start` with one seek and one read.
fn read_block<T: FixedRecord>(
    path: &Path,
    reader: &mut BlockReader,
    start: u64,
    count: u64,
) -> Result<Vec<T>, TableError> {
    let io_err = |source| TableError::Io {
        path: path.to_path_buf(),
        source,
    };
    let len = count as usize * T::DISK_SIZE;
    reader
        .file
        .seek(SeekFrom::Start(start * T::DISK_SIZE as u64))
        .map_err(io_err)?;
    reader.file.read_exact(&mut reader.buffer[..len]).map_err(io_err)?;

    let mut records = Vec::with_capacity(count as usize);
    encoding::decode_into(&reader.buffer[..len], &mut records)?;
    Ok(records)
}
