//! # Bucketed External Sort
//!
//! Sorts record sets that do not fit in memory by partitioning them on
//! disk first and sorting each partition in memory afterwards.
//!
//! ## Design Overview
//!
//! A [`DiskSort`] owns `2^log_num_buckets` [bucket files](bucket::Bucket).
//! A record is routed to bucket `key >> (key_size - log_num_buckets)`, i.e.
//! by the top `log_num_buckets` bits of its `key_size`-bit sort key, so the
//! buckets split the key space into disjoint, ordered ranges.
//!
//! Producers never touch bucket files directly. Each producer thread
//! acquires its own [`WriteCache`], which batches encoded records per
//! bucket and appends a whole batch under that bucket's mutex once it
//! reaches the write budget.
//!
//! [`DiskSort::read`] loads every bucket, sorts it in memory by the **full**
//! key and emits `(sorted_records, bucket_start_offset)`. Because bucket
//! ranges are ordered, concatenating the batches by offset yields a
//! globally sorted sequence, even though batches from different workers
//! arrive interleaved.
//!
//! ## Lifecycle
//!
//! Bucket files are scratch state. [`DiskSort::close`] (also run on drop)
//! closes every handle and deletes the files unless `keep_files` was set.
//! Write caches must be flushed or dropped **before** the sort is closed,
//! otherwise their pending batches are lost.
//!
//! ## Failure policy
//!
//! Any open, read or write failure is fatal and returned immediately. A
//! failed pass cannot be resumed; it is rerun from its inputs.

mod bucket;

#[cfg(test)]
mod tests;

use std::fs::{self, File};
use std::io::{self, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::buffer::ByteBuffer;
use crate::encoding::{self, EncodingError, FixedRecord, SortKey};
use crate::pipeline::{self, PipelineError, StageInput, ThreadPool};

use bucket::Bucket;

/// Largest supported `log_num_buckets` (65 536 bucket files).
pub const MAX_LOG_NUM_BUCKETS: u32 = 16;

/// Default bytes of records read per load chunk (per read thread).
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Default bytes of records buffered per bucket per write cache.
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 256 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by external sort operations.
#[derive(Debug, Error)]
pub enum SortError {
    /// Underlying I/O error on a bucket file.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid key size, bucket count or thread count.
    #[error("invalid sort config: {0}")]
    InvalidConfig(String),

    /// An existing bucket file does not hold a whole number of records.
    #[error("bucket '{path}' holds {len} bytes, not a multiple of {record_size}")]
    TruncatedBucket {
        path: PathBuf,
        len: u64,
        record_size: u64,
    },

    /// A key or raw write addressed a bucket that does not exist.
    #[error("bucket index {index} out of range ({num_buckets} buckets)")]
    BucketOutOfRange { index: u64, num_buckets: usize },

    /// A write reached a bucket whose handle has been closed.
    #[error("bucket '{0}' is closed")]
    BucketClosed(PathBuf),

    /// Writes were attempted on a sort opened read-only.
    #[error("sort is read-only")]
    ReadOnly,

    /// The sort has already been closed.
    #[error("sort is closed")]
    Closed,

    /// Record encoding or decoding failed.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A pipeline stage failed.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Internal invariant violation (poisoned lock, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// SortInfo — descriptor handed between phases
// ------------------------------------------------------------------------------------------------

/// Where the buckets of a sort live; enough to reopen them later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortInfo {
    pub path: PathBuf,
    pub prefix: String,
}

/// Deterministic file name of bucket `index`.
pub fn bucket_file_name(path: &Path, prefix: &str, index: usize) -> PathBuf {
    path.join(format!("{prefix}bucket_{index:04}.tmp"))
}

// ------------------------------------------------------------------------------------------------
// Shared bucket set
// ------------------------------------------------------------------------------------------------

/// Routing parameters plus the buckets, shared by the sort and its caches.
#[derive(Debug)]
struct BucketSet {
    key_size: u32,
    key_shift: u32,
    read_only: bool,
    buckets: Vec<Bucket>,
}

impl BucketSet {
    /// Bucket index for `key`: its top `log_num_buckets` bits.
    fn index_of(&self, key: u64) -> Result<usize, SortError> {
        if self.key_size < 64 && key >> self.key_size != 0 {
            return Err(SortError::BucketOutOfRange {
                index: key.checked_shr(self.key_shift).unwrap_or(0),
                num_buckets: self.buckets.len(),
            });
        }
        Ok(key.checked_shr(self.key_shift).unwrap_or(0) as usize)
    }

    fn bucket(&self, index: usize) -> Result<&Bucket, SortError> {
        self.buckets.get(index).ok_or(SortError::BucketOutOfRange {
            index: index as u64,
            num_buckets: self.buckets.len(),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// WriteCache — per-thread batching
// ------------------------------------------------------------------------------------------------

/// Per-thread batching buffer bound to one [`DiskSort`].
///
/// Never shared across threads; each producer acquires its own through
/// [`DiskSort::acquire_write_cache`]. Pending batches are flushed on drop,
/// but an explicit [`WriteCache::flush`] is the only way to observe a
/// write failure.
pub struct WriteCache<T> {
    set: Arc<BucketSet>,
    batches: Vec<ByteBuffer>,
    _marker: PhantomData<fn(T)>,
}

impl<T> std::fmt::Debug for WriteCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCache")
            .field("buckets", &self.batches.len())
            .finish_non_exhaustive()
    }
}

impl<T: FixedRecord + SortKey> WriteCache<T> {
    /// Routes `entry` to its bucket batch, flushing the batch once full.
    pub fn add(&mut self, entry: &T) -> Result<(), SortError> {
        let index = self.set.index_of(entry.sort_key())?;
        let batch = &mut self.batches[index];
        batch.push(entry)?;
        if batch.is_full() {
            self.flush_bucket(index)?;
        }
        Ok(())
    }

    /// Flushes every non-empty batch.
    pub fn flush(&mut self) -> Result<(), SortError> {
        for index in 0..self.batches.len() {
            self.flush_bucket(index)?;
        }
        Ok(())
    }

    fn flush_bucket(&mut self, index: usize) -> Result<(), SortError> {
        let batch = &mut self.batches[index];
        if batch.is_empty() {
            return Ok(());
        }
        self.set
            .bucket(index)?
            .write(batch.filled(), batch.count() as u64)?;
        batch.reset();
        Ok(())
    }
}

impl<T> Drop for WriteCache<T> {
    fn drop(&mut self) {
        for (index, batch) in self.batches.iter_mut().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let result = self
                .set
                .bucket(index)
                .and_then(|bucket| bucket.write(batch.filled(), batch.count() as u64));
            if let Err(e) = result {
                error!("write cache flush on drop failed: {e}");
            }
            batch.reset();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// DiskSort
// ------------------------------------------------------------------------------------------------

/// Work item of the load stage.
struct LoadJob {
    path: PathBuf,
    num_entries: u64,
    offset: u64,
}

/// A bucketed external sort over records of type `T`.
pub struct DiskSort<T> {
    key_size: u32,
    log_num_buckets: u32,
    path: PathBuf,
    prefix: String,
    keep_files: bool,
    read_chunk_size: usize,
    write_chunk_size: usize,
    set: Arc<BucketSet>,
    closed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for DiskSort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSort")
            .field("path", &self.path)
            .field("prefix", &self.prefix)
            .field("key_size", &self.key_size)
            .field("log_num_buckets", &self.log_num_buckets)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T: FixedRecord + SortKey> DiskSort<T> {
    /// Creates or opens the `2^log_num_buckets` bucket files of a sort.
    ///
    /// In write mode the directory is created if needed and every bucket
    /// file is truncated. In read-only mode existing files are opened as-is.
    ///
    /// # Errors
    ///
    /// - [`SortError::InvalidConfig`] if `key_size` is not in `1..=64` or
    ///   `log_num_buckets` exceeds `key_size` or [`MAX_LOG_NUM_BUCKETS`].
    /// - [`SortError::Io`] if a bucket file cannot be opened.
    pub fn open(
        key_size: u32,
        log_num_buckets: u32,
        path: impl AsRef<Path>,
        prefix: &str,
        read_only: bool,
        keep_files: bool,
    ) -> Result<Self, SortError> {
        if key_size == 0 || key_size > 64 {
            return Err(SortError::InvalidConfig(format!(
                "key_size must be in 1..=64, got {key_size}"
            )));
        }
        if log_num_buckets > key_size || log_num_buckets > MAX_LOG_NUM_BUCKETS {
            return Err(SortError::InvalidConfig(format!(
                "log_num_buckets must be <= min(key_size, {MAX_LOG_NUM_BUCKETS}), got {log_num_buckets}"
            )));
        }
        if T::DISK_SIZE == 0 {
            return Err(SortError::InvalidConfig("record size must be non-zero".into()));
        }

        let path = path.as_ref().to_path_buf();
        if !read_only {
            fs::create_dir_all(&path).map_err(|source| SortError::Io {
                path: path.clone(),
                source,
            })?;
        }

        let num_buckets = 1usize << log_num_buckets;
        let mut buckets = Vec::with_capacity(num_buckets);
        for index in 0..num_buckets {
            let file_name = bucket_file_name(&path, prefix, index);
            let bucket = if read_only {
                Bucket::open_existing(file_name, T::DISK_SIZE)?
            } else {
                Bucket::create(file_name)?
            };
            buckets.push(bucket);
        }

        info!(
            path = %path.display(),
            prefix,
            num_buckets,
            read_only,
            "disk sort opened"
        );

        Ok(Self {
            key_size,
            log_num_buckets,
            path,
            prefix: prefix.to_string(),
            keep_files,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            set: Arc::new(BucketSet {
                key_size,
                key_shift: key_size - log_num_buckets,
                read_only,
                buckets,
            }),
            closed: false,
            _marker: PhantomData,
        })
    }

    /// Reopens the buckets described by `info`.
    pub fn open_info(
        key_size: u32,
        log_num_buckets: u32,
        info: &SortInfo,
        read_only: bool,
        keep_files: bool,
    ) -> Result<Self, SortError> {
        Self::open(key_size, log_num_buckets, &info.path, &info.prefix, read_only, keep_files)
    }

    /// Overrides the read and write byte budgets (defaults:
    /// [`DEFAULT_READ_CHUNK_SIZE`], [`DEFAULT_WRITE_CHUNK_SIZE`]).
    pub fn with_chunk_sizes(mut self, read_chunk_size: usize, write_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self.write_chunk_size = write_chunk_size;
        self
    }

    pub fn info(&self) -> SortInfo {
        SortInfo {
            path: self.path.clone(),
            prefix: self.prefix.clone(),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.set.buckets.len()
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn log_num_buckets(&self) -> u32 {
        self.log_num_buckets
    }

    /// Records currently stored in bucket `index`.
    pub fn bucket_entries(&self, index: usize) -> Result<u64, SortError> {
        self.set.bucket(index)?.num_entries()
    }

    /// Records currently stored across all buckets.
    pub fn num_entries(&self) -> Result<u64, SortError> {
        let mut total = 0;
        for bucket in &self.set.buckets {
            total += bucket.num_entries()?;
        }
        Ok(total)
    }

    /// Returns a new write cache bound to this sort.
    ///
    /// # Errors
    ///
    /// [`SortError::ReadOnly`] or [`SortError::Closed`].
    pub fn acquire_write_cache(&self) -> Result<WriteCache<T>, SortError> {
        if self.closed {
            return Err(SortError::Closed);
        }
        if self.set.read_only {
            return Err(SortError::ReadOnly);
        }
        check_budget::<T>("write_chunk_size", self.write_chunk_size)?;
        let batches = (0..self.set.buckets.len())
            .map(|_| ByteBuffer::for_record::<T>(self.write_chunk_size))
            .collect();
        Ok(WriteCache {
            set: Arc::clone(&self.set),
            batches,
            _marker: PhantomData,
        })
    }

    /// Appends `count` pre-encoded records to bucket `index`. Thread-safe.
    ///
    /// For callers that have already grouped their data by bucket. The
    /// caller is responsible for routing: records are not re-checked.
    pub fn write(&self, index: usize, data: &[u8], count: u64) -> Result<(), SortError> {
        if self.closed {
            return Err(SortError::Closed);
        }
        if self.set.read_only {
            return Err(SortError::ReadOnly);
        }
        let expected = usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(T::DISK_SIZE))
            .ok_or(EncodingError::SizeMismatch {
                expected: usize::MAX,
                actual: data.len(),
            })?;
        if data.len() != expected {
            return Err(EncodingError::SizeMismatch {
                expected,
                actual: data.len(),
            }
            .into());
        }
        self.set.bucket(index)?.write(data, count)
    }

    /// Loads, sorts and emits every bucket.
    ///
    /// Each non-empty bucket becomes one `(records, bucket_start_offset)`
    /// batch on `output`, sorted by the full sort key. Batches arrive in no
    /// particular order; `bucket_start_offset` is the batch's position in
    /// the globally sorted sequence.
    ///
    /// `num_threads` workers sort; `num_read_threads` workers (default:
    /// half of `num_threads`, at least one) load bucket files.
    ///
    /// All write caches must have been flushed before calling this.
    pub fn read(
        &self,
        output: &StageInput<(Vec<T>, u64)>,
        num_threads: usize,
        num_read_threads: Option<usize>,
    ) -> Result<(), SortError> {
        if self.closed {
            return Err(SortError::Closed);
        }
        if num_threads == 0 {
            return Err(SortError::InvalidConfig("num_threads must be >= 1".into()));
        }
        let num_read_threads = num_read_threads.unwrap_or((num_threads / 2).max(1));
        if num_read_threads == 0 {
            return Err(SortError::InvalidConfig("num_read_threads must be >= 1".into()));
        }
        check_budget::<T>("read_chunk_size", self.read_chunk_size)?;

        let begin = Instant::now();

        let mut jobs = Vec::with_capacity(self.set.buckets.len());
        let mut offset = 0u64;
        for bucket in &self.set.buckets {
            let num_entries = bucket.num_entries()?;
            if num_entries > 0 {
                jobs.push(LoadJob {
                    path: bucket.path().to_path_buf(),
                    num_entries,
                    offset,
                });
            }
            offset += num_entries;
        }

        let out = output.clone();
        let sorter = ThreadPool::new(
            "sort/sort",
            vec![(); num_threads],
            num_threads,
            move |(mut records, offset): (Vec<T>, u64), _: &mut ()| {
                records.sort_unstable_by_key(|entry| entry.sort_key());
                out.take((records, offset))?;
                Ok(())
            },
        )?;

        let sort_input = sorter.input()?;
        let locals = (0..num_read_threads)
            .map(|_| ByteBuffer::for_record::<T>(self.read_chunk_size))
            .collect();
        let loader = ThreadPool::new(
            "sort/load",
            locals,
            num_read_threads,
            move |job: LoadJob, buffer: &mut ByteBuffer| {
                let records = load_bucket::<T>(&job, buffer)?;
                sort_input.take((records, job.offset))?;
                Ok(())
            },
        )?;

        let mut submitted = Ok(());
        for job in jobs {
            if let Err(e) = loader.take(job) {
                submitted = Err(e);
                break;
            }
        }

        pipeline::settle(vec![
            submitted,
            loader.close().map(|_| ()),
            sorter.close().map(|_| ()),
        ])?;

        info!(
            path = %self.path.display(),
            prefix = %self.prefix,
            entries = offset,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "disk sort read"
        );
        Ok(())
    }

    /// Closes every bucket and deletes the files unless `keep_files` was set.
    ///
    /// Idempotent; also run on drop.
    pub fn close(&mut self) -> Result<(), SortError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let live_caches = Arc::strong_count(&self.set) - 1;
        if live_caches > 0 {
            warn!(
                prefix = %self.prefix,
                live_caches,
                "closing disk sort while write caches are alive; their pending records are lost"
            );
        }

        for bucket in &self.set.buckets {
            bucket.close()?;
        }
        if !self.keep_files {
            for bucket in &self.set.buckets {
                bucket.remove()?;
            }
        }
        debug!(prefix = %self.prefix, keep_files = self.keep_files, "disk sort closed");
        Ok(())
    }
}

impl<T> Drop for DiskSort<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for bucket in &self.set.buckets {
            if let Err(e) = bucket.close() {
                error!("bucket close on drop failed: {e}");
            }
            if !self.keep_files {
                if let Err(e) = bucket.remove() {
                    error!("bucket remove on drop failed: {e}");
                }
            }
        }
    }
}

fn check_budget<T: FixedRecord>(name: &str, bytes: usize) -> Result<(), SortError> {
    if bytes < T::DISK_SIZE {
        return Err(SortError::InvalidConfig(format!(
            "{name} of {bytes} bytes is smaller than one {}-byte record",
            T::DISK_SIZE
        )));
    }
    Ok(())
}

/// Reads a whole bucket file in read-budget chunks and decodes it.
fn load_bucket<T: FixedRecord>(job: &LoadJob, buffer: &mut ByteBuffer) -> Result<Vec<T>, SortError> {
    let io_err = |source| SortError::Io {
        path: job.path.clone(),
        source,
    };
    let mut file = File::open(&job.path).map_err(io_err)?;
    let mut records = Vec::with_capacity(job.num_entries as usize);
    let mut remaining = job.num_entries;
    while remaining > 0 {
        let chunk = remaining.min(buffer.capacity() as u64) as usize;
        file.read_exact(buffer.fill_slots(chunk)).map_err(io_err)?;
        encoding::decode_into(buffer.filled(), &mut records)?;
        remaining -= chunk as u64;
    }
    buffer.reset();
    Ok(records)
}
