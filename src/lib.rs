//! # linkcompact
//!
//! Pipelined external sort and mark-and-compact engine for very large,
//! immutable, position-linked on-disk tables.
//!
//! Each table level is a headerless file of fixed-size records. Records of
//! level `k` refer back to two records of level `k - 1` by position. Walking
//! the levels top-down, records nothing points to are dropped and the
//! survivors are renumbered without gaps, so every back reference stays
//! valid and dense.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linkcompact::{CompactionConfig, LevelCompactor, TableInfo};
//! # use linkcompact::{EncodingError, FixedRecord, LinkedRecord, Remap, Sequenced, SortKey};
//! # #[derive(Clone, Copy)] struct Link { key: u64, pos: u64, off: u64 }
//! # impl FixedRecord for Link {
//! #     const DISK_SIZE: usize = 24;
//! #     fn encode_to(&self, _: &mut [u8]) -> Result<(), EncodingError> { Ok(()) }
//! #     fn decode_from(_: &[u8]) -> Result<Self, EncodingError> { Ok(Link { key: 0, pos: 0, off: 0 }) }
//! # }
//! # impl LinkedRecord for Link { fn back_refs(&self) -> (u64, u64) { (self.pos, self.off) } }
//! # impl Remap<Link> for Link { fn remap(i: &Link, pos: u64, off: u64) -> Self { Link { key: i.key, pos, off } } }
//! # impl Sequenced for Link { fn assign_position(&mut self, p: u64) { self.key = p } }
//! # impl SortKey for Link { fn sort_key(&self) -> u64 { self.key } }
//!
//! let tables: Vec<TableInfo> = vec![/* level 1 first */];
//! let compactor = LevelCompactor::new(CompactionConfig::default(), "/tmp/run/p2", "run_p2_")?;
//! let output = compactor.run::<Link, Link, Link>(&tables)?;
//! for report in &output.reports {
//!     println!("level {}: dropped {} ({:.2} %)", report.level, report.dropped, report.drop_percent);
//! }
//! # Ok::<(), linkcompact::Error>(())
//! ```
//!
//! ## Building blocks
//!
//! - [`pipeline`]: bounded worker-pool stages with per-worker state.
//! - [`sort`]: bucketed external sort.
//! - [`table`]: flat table with parallel block reads.
//! - [`bitfield`]: reachability bits and the rank index.
//! - [`compaction`]: mark-and-compact for one level and for a whole run.

pub mod bitfield;
pub mod buffer;
pub mod compaction;
pub mod encoding;
pub mod pipeline;
pub mod sort;
pub mod table;

use thiserror::Error;

pub use bitfield::{Bitfield, BitfieldError, RankIndex, ReachabilitySlots};
pub use compaction::{
    CompactionError, CompactionOutput, LevelCompactor, LevelOutput, LevelReport, LinkedRecord,
    Remap, Sequenced, Sink, compact_table,
};
pub use encoding::{EncodingError, FixedRecord, SortKey};
pub use pipeline::{PipelineError, StageInput, ThreadPool};
pub use sort::{DiskSort, SortError, SortInfo, WriteCache};
pub use table::{DiskTable, TableError, TableInfo};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning parameters of a compaction run.
///
/// All fields have defaults via [`CompactionConfig::default()`]. The
/// configuration is validated by [`LevelCompactor::new`] and by every
/// [`compact_table`] call.
///
/// # Example
///
/// ```rust
/// use linkcompact::CompactionConfig;
///
/// let config = CompactionConfig {
///     mark_threads: 4,
///     remap_threads: 4,
///     ..CompactionConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionConfig {
    /// Width in bits of the sort key of intermediate outputs.
    ///
    /// Default: 32. Must be in `1..=64`.
    pub key_size: u32,

    /// `log2` of the bucket count of every intermediate sort.
    ///
    /// Default: 7. Must be ≤ `key_size` and ≤ 16.
    pub log_num_buckets: u32,

    /// Read budget in bytes of one bucket load.
    ///
    /// Default: 1 MiB.
    pub read_chunk_size: usize,

    /// Per-bucket batch budget in bytes of one write cache.
    ///
    /// Default: 256 KiB.
    pub write_chunk_size: usize,

    /// Staging buffer in bytes of the terminal table writer.
    ///
    /// Default: 16 MiB.
    pub table_write_cache_size: usize,

    /// Read workers per input table pass.
    ///
    /// Default: 4. Must be in `1..=256`.
    pub table_read_threads: usize,

    /// Records per table read block.
    ///
    /// Default: 2 Mi. Must be ≥ 1024.
    pub table_read_block: usize,

    /// Workers of the mark pass.
    ///
    /// Default: 24.
    pub mark_threads: usize,

    /// Workers of the remap pass.
    ///
    /// Default: 24.
    pub remap_threads: usize,

    /// Write caches feeding an intermediate sort.
    ///
    /// Default: 8.
    pub write_threads: usize,

    /// Sort workers when a level's sort is read back.
    ///
    /// Default: 8.
    pub sort_threads: usize,

    /// Bucket load workers when a level's sort is read back. `None` uses
    /// half of `sort_threads`.
    pub sort_read_threads: Option<usize>,

    /// Bounded queue length in front of every stage.
    ///
    /// Default: 64.
    pub queue_depth: usize,

    /// Keep bucket files after the sorts are closed.
    ///
    /// Default: false.
    pub keep_files: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            key_size: 32,
            log_num_buckets: 7,
            read_chunk_size: sort::DEFAULT_READ_CHUNK_SIZE,
            write_chunk_size: sort::DEFAULT_WRITE_CHUNK_SIZE,
            table_write_cache_size: table::DEFAULT_WRITE_CACHE_SIZE,
            table_read_threads: 4,
            table_read_block: 2 * 1024 * 1024,
            mark_threads: 24,
            remap_threads: 24,
            write_threads: 8,
            sort_threads: 8,
            sort_read_threads: None,
            queue_depth: 64,
            keep_files: false,
        }
    }
}

impl CompactionConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), CompactionError> {
        if self.key_size == 0 || self.key_size > 64 {
            return Err(CompactionError::InvalidConfig(
                "key_size must be in 1..=64".into(),
            ));
        }
        if self.log_num_buckets > self.key_size || self.log_num_buckets > sort::MAX_LOG_NUM_BUCKETS {
            return Err(CompactionError::InvalidConfig(format!(
                "log_num_buckets must be <= min(key_size, {})",
                sort::MAX_LOG_NUM_BUCKETS
            )));
        }
        if self.read_chunk_size == 0 || self.write_chunk_size == 0 || self.table_write_cache_size == 0 {
            return Err(CompactionError::InvalidConfig(
                "buffer sizes must be > 0".into(),
            ));
        }
        if self.table_read_threads == 0 || self.table_read_threads > table::MAX_READ_THREADS {
            return Err(CompactionError::InvalidConfig(format!(
                "table_read_threads must be in 1..={}",
                table::MAX_READ_THREADS
            )));
        }
        if self.table_read_block < table::MIN_READ_BLOCK {
            return Err(CompactionError::InvalidConfig(format!(
                "table_read_block must be >= {}",
                table::MIN_READ_BLOCK
            )));
        }
        if self.mark_threads == 0
            || self.remap_threads == 0
            || self.write_threads == 0
            || self.sort_threads == 0
            || self.sort_read_threads == Some(0)
        {
            return Err(CompactionError::InvalidConfig(
                "thread counts must be >= 1".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(CompactionError::InvalidConfig(
                "queue_depth must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Any error raised by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Encoding(#[from] EncodingError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    Sort(#[from] SortError),

    #[error("{0}")]
    Table(#[from] TableError),

    #[error("{0}")]
    Bitfield(#[from] BitfieldError),

    #[error("{0}")]
    Compaction(#[from] CompactionError),
}
