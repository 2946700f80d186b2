//! # Mark-and-Compact
//!
//! Removes unreachable records from one table level and renumbers the
//! survivors so that back references stay dense.
//!
//! ## Record model
//!
//! Every record of level `k` refers back to two records of level `k - 1`
//! through a position and an offset (`pos`, `pos + off`). A record of level
//! `k` is *reachable* when the level above marked its slot; the top level is
//! reachable as a whole.
//!
//! ## Passes over one level
//!
//! 1. **Mark**: the input table is streamed through `mark_threads`
//!    workers. Every reachable record sets both referenced positions in the
//!    `referenced` bitfield, which describes level `k - 1`.
//! 2. A [`RankIndex`] is built over the now frozen `referenced` bitfield.
//! 3. **Remap**: the same table is streamed again. Unreachable records are
//!    dropped, kept records get their references translated through the
//!    rank index and are converted to the output type.
//!
//! ```text
//!  table/read ──► compact/remap (N) ──► compact/sequence (1) ──► compact/write (1)
//!                                                            └─► compact/add   (W)
//! ```
//!
//! The sequencing stage is the only place output positions are minted.
//! Remap workers finish blocks in any order, so the sequencer holds early
//! blocks back and numbers records in input slot order. The record at
//! output position `k` is therefore the reachable input of slot rank `k`.
//!
//! ## Levels
//!
//! [`LevelCompactor::run`] walks the levels top-down: the top table becomes
//! a terminal flat table, every lower table down to level 2 becomes an
//! external sort for the next phase. Two bitfields allocated at the largest
//! table size are swapped between levels.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use crate::CompactionConfig;
use crate::bitfield::{Bitfield, BitfieldError, RankIndex, ReachabilitySlots};
use crate::encoding::{FixedRecord, SortKey};
use crate::pipeline::{self, PipelineError, ThreadPool};
use crate::sort::{DiskSort, SortError, SortInfo, WriteCache};
use crate::table::{DiskTable, TableError, TableInfo};

// ------------------------------------------------------------------------------------------------
// Record traits
// ------------------------------------------------------------------------------------------------

/// A record that refers to two records of the level below.
pub trait LinkedRecord: FixedRecord {
    /// `(pos, off)`: the records at `pos` and `pos + off` are referenced.
    fn back_refs(&self) -> (u64, u64);
}

/// Output record built from an input record of type `T`.
pub trait Remap<T>: FixedRecord {
    /// Builds the output record with references already translated into
    /// compacted coordinates.
    fn remap(input: &T, pos: u64, off: u64) -> Self;
}

/// A record that carries its own output position.
pub trait Sequenced {
    fn assign_position(&mut self, position: u64);
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by mark-and-compact.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Invalid compaction parameters.
    #[error("invalid compaction config: {0}")]
    InvalidConfig(String),

    /// A back reference points outside the bitfield.
    #[error("back reference {pos} out of range for {len} positions")]
    PositionOutOfRange { pos: u64, len: u64 },

    /// Directory creation for level output failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Sort error: {0}")]
    Sort(#[from] SortError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl From<BitfieldError> for CompactionError {
    fn from(err: BitfieldError) -> Self {
        match err {
            BitfieldError::OutOfRange { pos, len } => CompactionError::PositionOutOfRange { pos, len },
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Sink and report
// ------------------------------------------------------------------------------------------------

/// Destination of the remapped records of one level.
pub enum Sink<'a, S> {
    /// Terminal level: a fresh flat table written by one worker.
    Table(DiskTable<S>),
    /// Intermediate level: an external sort fed by `write_threads` caches.
    Sort(&'a DiskSort<S>),
}

/// Where a compacted level ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelOutput {
    Table(TableInfo),
    Sort(SortInfo),
}

/// Outcome of compacting one level. Diagnostic only.
#[derive(Debug, Clone)]
pub struct LevelReport {
    pub level: usize,
    pub input_entries: u64,
    pub written: u64,
    pub dropped: u64,
    pub drop_percent: f64,
    pub output: LevelOutput,
}

/// Per-worker state of the sink stage.
enum SinkLocal<S> {
    Table(DiskTable<S>),
    Cache(WriteCache<S>),
}

/// State of the sequencing stage.
///
/// Blocks are keyed by their input start offset and released only once
/// every slot before them has been seen.
struct Sequencer<S> {
    next_offset: u64,
    next_position: u64,
    pending: BTreeMap<u64, (Vec<S>, u64)>,
}

impl<S: Sequenced> Sequencer<S> {
    fn new() -> Self {
        Self {
            next_offset: 0,
            next_position: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Accepts the survivors of input slots `offset..offset + len` and
    /// returns the batches that are now next in slot order, numbered.
    fn accept(&mut self, batch: Vec<S>, offset: u64, len: u64) -> Vec<Vec<S>> {
        self.pending.insert(offset, (batch, len));
        let mut ready = Vec::new();
        while let Some((mut batch, len)) = self.pending.remove(&self.next_offset) {
            self.next_offset += len;
            for entry in batch.iter_mut() {
                entry.assign_position(self.next_position);
                self.next_position += 1;
            }
            if !batch.is_empty() {
                ready.push(batch);
            }
        }
        ready
    }
}

// ------------------------------------------------------------------------------------------------
// One level
// ------------------------------------------------------------------------------------------------

/// Compacts the table described by `input` into `sink`.
///
/// `referenced` is cleared, then filled with the positions of the level
/// below that surviving records point to. `reachable` filters the input
/// records by slot; `None` keeps every record.
///
/// # Errors
///
/// - [`CompactionError::InvalidConfig`] if `reachable` is shorter than the
///   input table or a stage parameter is zero.
/// - [`CompactionError::PositionOutOfRange`] if a back reference does not
///   fit in `referenced`.
/// - Any I/O, sort or pipeline failure. The run is not resumable.
pub fn compact_table<T, S>(
    level: usize,
    input: &TableInfo,
    sink: Sink<'_, S>,
    referenced: &Arc<Bitfield>,
    reachable: Option<&Arc<Bitfield>>,
    config: &CompactionConfig,
) -> Result<LevelReport, CompactionError>
where
    T: LinkedRecord,
    S: Remap<T> + Sequenced + SortKey,
{
    config.validate()?;
    if let Some(bits) = reachable.filter(|bits| bits.len() < input.num_entries) {
        return Err(CompactionError::InvalidConfig(format!(
            "reachability bitfield has {} bits, table {} has {} entries",
            bits.len(),
            input.file_name.display(),
            input.num_entries
        )));
    }

    let table = DiskTable::<T>::open(input);

    let begin = Instant::now();
    referenced.clear();
    mark_pass(&table, referenced, reachable, config)?;
    debug!(
        level,
        marked = referenced.count_ones(),
        elapsed_ms = begin.elapsed().as_millis() as u64,
        "mark pass done"
    );

    let begin = Instant::now();
    let index = Arc::new(RankIndex::new(Arc::clone(referenced)));
    let (written, output) = remap_pass(&table, sink, index, reachable, config)?;

    let dropped = input.num_entries - written;
    let drop_percent = if input.num_entries == 0 {
        0.0
    } else {
        100.0 * dropped as f64 / input.num_entries as f64
    };
    info!(
        level,
        input = input.num_entries,
        written,
        dropped,
        drop_percent,
        elapsed_ms = begin.elapsed().as_millis() as u64,
        "level compacted"
    );

    Ok(LevelReport {
        level,
        input_entries: input.num_entries,
        written,
        dropped,
        drop_percent,
        output,
    })
}

fn mark_pass<T: LinkedRecord>(
    table: &DiskTable<T>,
    referenced: &Arc<Bitfield>,
    reachable: Option<&Arc<Bitfield>>,
    config: &CompactionConfig,
) -> Result<(), CompactionError> {
    let marks = Arc::clone(referenced);
    let filter = reachable.cloned();
    let marker = ThreadPool::new(
        "compact/mark",
        vec![(); config.mark_threads],
        config.queue_depth,
        move |(records, offset): (Vec<T>, u64), _: &mut ()| {
            mark_block(&records, offset, &marks, filter.as_deref())?;
            Ok(())
        },
    )?;

    let read = table.read(&marker.input()?, config.table_read_threads, config.table_read_block);
    finish(read, vec![marker.close().map(|_| ())])
}

fn mark_block<T: LinkedRecord>(
    records: &[T],
    offset: u64,
    marks: &Bitfield,
    filter: Option<&Bitfield>,
) -> Result<(), CompactionError> {
    for (i, record) in records.iter().enumerate() {
        if filter.is_some_and(|bits| !bits.get(offset + i as u64)) {
            continue;
        }
        let (pos, off) = record.back_refs();
        let other = pos.checked_add(off).ok_or(CompactionError::PositionOutOfRange {
            pos: u64::MAX,
            len: marks.len(),
        })?;
        marks.set(pos)?;
        marks.set(other)?;
    }
    Ok(())
}

fn remap_block<T: LinkedRecord, S: Remap<T>>(
    records: &[T],
    offset: u64,
    index: &RankIndex,
    filter: Option<&Bitfield>,
) -> Result<Vec<S>, CompactionError> {
    let mut out = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if filter.is_some_and(|bits| !bits.get(offset + i as u64)) {
            continue;
        }
        let (pos, off) = record.back_refs();
        let (new_pos, new_off) = index.lookup(pos, off)?;
        out.push(S::remap(record, new_pos, new_off));
    }
    Ok(out)
}

/// Runs remap, sequencing and sink stages. Returns the number of records
/// written and the finalized output.
fn remap_pass<T, S>(
    table: &DiskTable<T>,
    sink: Sink<'_, S>,
    index: Arc<RankIndex>,
    reachable: Option<&Arc<Bitfield>>,
    config: &CompactionConfig,
) -> Result<(u64, LevelOutput), CompactionError>
where
    T: LinkedRecord,
    S: Remap<T> + Sequenced + SortKey,
{
    let (stage_name, locals, sort_info) = match sink {
        Sink::Table(writer) => ("compact/write", vec![SinkLocal::Table(writer)], None),
        Sink::Sort(sort) => {
            let caches = (0..config.write_threads)
                .map(|_| sort.acquire_write_cache().map(SinkLocal::Cache))
                .collect::<Result<Vec<_>, _>>()?;
            ("compact/add", caches, Some(sort.info()))
        }
    };

    let writer = ThreadPool::new(
        stage_name,
        locals,
        config.queue_depth,
        |batch: Vec<S>, local: &mut SinkLocal<S>| {
            match local {
                SinkLocal::Table(table) => {
                    for entry in &batch {
                        table.write(entry)?;
                    }
                }
                SinkLocal::Cache(cache) => {
                    for entry in &batch {
                        cache.add(entry)?;
                    }
                }
            }
            Ok(())
        },
    )?;

    let writer_input = writer.input()?;
    let sequencer = ThreadPool::single(
        "compact/sequence",
        Sequencer::new(),
        config.queue_depth,
        move |(batch, offset, len): (Vec<S>, u64, u64), state: &mut Sequencer<S>| {
            for ready in state.accept(batch, offset, len) {
                writer_input.take(ready)?;
            }
            Ok(())
        },
    )?;

    let sequencer_input = sequencer.input()?;
    let filter = reachable.cloned();
    let remapper = ThreadPool::new(
        "compact/remap",
        vec![(); config.remap_threads],
        config.queue_depth,
        move |(records, offset): (Vec<T>, u64), _: &mut ()| {
            let out = remap_block::<T, S>(&records, offset, &index, filter.as_deref())?;
            // Empty blocks still advance the sequencer.
            sequencer_input.take((out, offset, records.len() as u64))?;
            Ok(())
        },
    )?;

    let read = table.read(&remapper.input()?, config.table_read_threads, config.table_read_block);

    let remapped = remapper.close().map(|_| ());
    let (sequenced, states) = match sequencer.close() {
        Ok(states) => (Ok(()), states),
        Err(e) => (Err(e), Vec::new()),
    };
    let (flushed, locals) = match writer.close() {
        Ok(locals) => (Ok(()), locals),
        Err(e) => (Err(e), Vec::new()),
    };
    finish(read, vec![remapped, sequenced, flushed])?;

    let mut written = 0;
    for state in states {
        if !state.pending.is_empty() || state.next_offset != table.num_entries() {
            return Err(CompactionError::Pipeline(PipelineError::Internal(format!(
                "sequencer stopped at slot {} of {} with {} blocks held back",
                state.next_offset,
                table.num_entries(),
                state.pending.len()
            ))));
        }
        written += state.next_position;
    }

    let mut output = sort_info.map(LevelOutput::Sort);
    for local in locals {
        match local {
            SinkLocal::Table(mut table) => {
                table.close()?;
                output = Some(LevelOutput::Table(table.info()));
            }
            SinkLocal::Cache(mut cache) => cache.flush()?,
        }
    }
    let output = output.ok_or_else(|| {
        CompactionError::Pipeline(PipelineError::Internal("sink stage returned no output".into()))
    })?;
    Ok((written, output))
}

/// Reduces a table read result plus the close results of its consumer
/// stages to the root-cause error.
fn finish(
    read: Result<(), TableError>,
    mut stages: Vec<Result<(), PipelineError>>,
) -> Result<(), CompactionError> {
    match read {
        Ok(()) => {}
        Err(TableError::Pipeline(err)) => stages.insert(0, Err(err)),
        Err(err) => return Err(err.into()),
    }
    pipeline::settle(stages).map_err(unwrap_task_error)
}

/// Surfaces a compaction error raised inside a stage worker as itself
/// rather than as an opaque pipeline failure.
fn unwrap_task_error(err: PipelineError) -> CompactionError {
    match err {
        PipelineError::Task { stage, source } => match source.downcast::<CompactionError>() {
            Ok(inner) => *inner,
            Err(source) => CompactionError::Pipeline(PipelineError::Task { stage, source }),
        },
        other => CompactionError::Pipeline(other),
    }
}

// ------------------------------------------------------------------------------------------------
// Level driver
// ------------------------------------------------------------------------------------------------

/// Result of compacting every level of a run.
pub struct CompactionOutput<S> {
    /// Level 1 is never rewritten; its table passes through.
    pub table_1: TableInfo,
    /// Compacted top level.
    pub terminal: TableInfo,
    /// `sorts[k]` holds the compacted records of level `k + 2`.
    pub sorts: Vec<DiskSort<S>>,
    /// Reachability of level 1 records.
    pub bitfield_1: Arc<Bitfield>,
    /// One report per compacted level, top level first.
    pub reports: Vec<LevelReport>,
}

impl<S> std::fmt::Debug for CompactionOutput<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionOutput")
            .field("table_1", &self.table_1)
            .field("terminal", &self.terminal)
            .field("sorts", &self.sorts.len())
            .field("reports", &self.reports)
            .finish_non_exhaustive()
    }
}

impl<S: FixedRecord + SortKey> CompactionOutput<S> {
    /// Streams the sorted records of `level` (2..=top-1) to `output` using
    /// the configured sort thread counts.
    pub fn read_level(
        &self,
        level: usize,
        output: &pipeline::StageInput<(Vec<S>, u64)>,
        config: &CompactionConfig,
    ) -> Result<(), CompactionError> {
        let sort = level
            .checked_sub(2)
            .and_then(|k| self.sorts.get(k))
            .ok_or_else(|| CompactionError::InvalidConfig(format!("no sorted output for level {level}")))?;
        sort.read(output, config.sort_threads, config.sort_read_threads)?;
        Ok(())
    }
}

/// Compacts a stack of linked tables, top level down to level 2.
#[derive(Debug, Clone)]
pub struct LevelCompactor {
    config: CompactionConfig,
    dir: PathBuf,
    prefix: String,
}

impl LevelCompactor {
    /// `dir` receives one subdirectory per level; `prefix` starts every
    /// file name.
    pub fn new(
        config: CompactionConfig,
        dir: impl AsRef<Path>,
        prefix: &str,
    ) -> Result<Self, CompactionError> {
        config.validate()?;
        Ok(Self {
            config,
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
        })
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Compacts `tables` (level 1 first).
    ///
    /// The top table of `Top` records is rewritten in place of itself into a
    /// terminal flat table; tables 2..top-1 of `T` records are rewritten as
    /// `S` records into one external sort each. Every consumed input table
    /// file is deleted; table 1 is left untouched.
    pub fn run<Top, T, S>(&self, tables: &[TableInfo]) -> Result<CompactionOutput<S>, CompactionError>
    where
        Top: LinkedRecord + Remap<Top> + Sequenced + SortKey,
        T: LinkedRecord,
        S: Remap<T> + Sequenced + SortKey,
    {
        let num_levels = tables.len();
        if num_levels < 2 {
            return Err(CompactionError::InvalidConfig(format!(
                "need at least 2 tables, got {num_levels}"
            )));
        }
        let total_begin = Instant::now();

        let max_table_size = tables.iter().map(|t| t.num_entries).max().unwrap_or(0);
        info!(levels = num_levels, max_table_size, "compaction started");
        let mut slots = ReachabilitySlots::new(max_table_size);
        let mut reports = Vec::with_capacity(num_levels - 1);

        let top = &tables[num_levels - 1];
        let tag = format!("t{num_levels}f");
        let dir = self.level_dir(&tag)?;
        let writer = DiskTable::<Top>::create(
            dir.join(format!("{}{tag}.tmp", self.prefix)),
            self.config.table_write_cache_size,
        )?;
        let report = compact_table::<Top, Top>(
            num_levels,
            top,
            Sink::Table(writer),
            slots.next(),
            None,
            &self.config,
        )?;
        let terminal = match &report.output {
            LevelOutput::Table(info) => info.clone(),
            LevelOutput::Sort(_) => {
                return Err(CompactionError::Pipeline(PipelineError::Internal(
                    "terminal level produced a sort".into(),
                )));
            }
        };
        reports.push(report);
        top.remove()?;

        let mut sorts = Vec::with_capacity(num_levels.saturating_sub(2));
        for i in (1..num_levels - 1).rev() {
            slots.swap();
            let tag = format!("t{}", i + 1);
            let sort = DiskSort::<S>::open(
                self.config.key_size,
                self.config.log_num_buckets,
                self.dir.join(&tag),
                &format!("{}{tag}_", self.prefix),
                false,
                self.config.keep_files,
            )?
            .with_chunk_sizes(self.config.read_chunk_size, self.config.write_chunk_size);

            let report = compact_table::<T, S>(
                i + 1,
                &tables[i],
                Sink::Sort(&sort),
                slots.next(),
                Some(slots.current()),
                &self.config,
            )?;
            reports.push(report);
            sorts.push(sort);
            tables[i].remove()?;
        }
        sorts.reverse();

        info!(
            elapsed_ms = total_begin.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(CompactionOutput {
            table_1: tables[0].clone(),
            terminal,
            sorts,
            bitfield_1: slots.into_next(),
            reports,
        })
    }

    fn level_dir(&self, tag: &str) -> Result<PathBuf, CompactionError> {
        let dir = self.dir.join(tag);
        fs::create_dir_all(&dir).map_err(|source| CompactionError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }
}
