use std::collections::BTreeSet;
use std::path::Path;

use crate::CompactionConfig;
use crate::compaction::{LinkedRecord, Remap, Sequenced};
use crate::encoding::{EncodingError, FixedRecord, SortKey, get_u32, get_u64, put_u32, put_u64};
use crate::pipeline::ThreadPool;
use crate::table::{DiskTable, TableInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Unsorted input record (16 bytes): back references plus a stable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parent {
    pub pos: u64,
    pub off: u32,
    pub id: u32,
}

impl FixedRecord for Parent {
    const DISK_SIZE: usize = 16;

    fn encode_to(&self, buf: &mut [u8]) -> Result<(), EncodingError> {
        put_u64(buf, 0, self.pos)?;
        put_u32(buf, 8, self.off)?;
        put_u32(buf, 12, self.id)
    }

    fn decode_from(buf: &[u8]) -> Result<Self, EncodingError> {
        Ok(Self {
            pos: get_u64(buf, 0)?,
            off: get_u32(buf, 8)?,
            id: get_u32(buf, 12)?,
        })
    }
}

impl LinkedRecord for Parent {
    fn back_refs(&self) -> (u64, u64) {
        (self.pos, u64::from(self.off))
    }
}

/// Compacted output record (24 bytes) keyed by its output position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linked {
    pub key: u64,
    pub pos: u64,
    pub off: u32,
    pub id: u32,
}

impl FixedRecord for Linked {
    const DISK_SIZE: usize = 24;

    fn encode_to(&self, buf: &mut [u8]) -> Result<(), EncodingError> {
        put_u64(buf, 0, self.key)?;
        put_u64(buf, 8, self.pos)?;
        put_u32(buf, 16, self.off)?;
        put_u32(buf, 20, self.id)
    }

    fn decode_from(buf: &[u8]) -> Result<Self, EncodingError> {
        Ok(Self {
            key: get_u64(buf, 0)?,
            pos: get_u64(buf, 8)?,
            off: get_u32(buf, 16)?,
            id: get_u32(buf, 20)?,
        })
    }
}

impl LinkedRecord for Linked {
    fn back_refs(&self) -> (u64, u64) {
        (self.pos, u64::from(self.off))
    }
}

impl SortKey for Linked {
    fn sort_key(&self) -> u64 {
        self.key
    }
}

impl Sequenced for Linked {
    fn assign_position(&mut self, position: u64) {
        self.key = position;
    }
}

impl Remap<Parent> for Linked {
    fn remap(input: &Parent, pos: u64, off: u64) -> Self {
        Self {
            key: 0,
            pos,
            off: off as u32,
            id: input.id,
        }
    }
}

impl Remap<Linked> for Linked {
    fn remap(input: &Linked, pos: u64, off: u64) -> Self {
        Self {
            key: 0,
            pos,
            off: off as u32,
            id: input.id,
        }
    }
}

/// Small budgets and thread counts so tests exercise many blocks and
/// batches.
pub fn small_config() -> CompactionConfig {
    CompactionConfig {
        log_num_buckets: 3,
        read_chunk_size: 4 * 1024,
        write_chunk_size: 512,
        table_write_cache_size: 4 * 1024,
        table_read_threads: 2,
        table_read_block: 1024,
        mark_threads: 3,
        remap_threads: 3,
        write_threads: 2,
        sort_threads: 2,
        queue_depth: 4,
        ..CompactionConfig::default()
    }
}

/// `n` records referencing positions below `below`, with offsets < 16.
pub fn random_parents(n: usize, below: u64, seed: u64) -> Vec<Parent> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let off = rng.random_range(0..16u32.min(below as u32));
            let pos = rng.random_range(0..below - u64::from(off));
            Parent { pos, off, id: i as u32 }
        })
        .collect()
}

pub fn write_table<R: FixedRecord>(path: &Path, records: &[R]) -> TableInfo {
    let mut table = DiskTable::<R>::create(path, 4096).unwrap();
    for r in records {
        table.write(r).unwrap();
    }
    table.close().unwrap();
    table.info()
}

/// Reads a table back in file order.
pub fn read_table<R: FixedRecord>(info: &TableInfo) -> Vec<R> {
    let collector = ThreadPool::single(
        "test/collect",
        Vec::new(),
        4,
        |block: (Vec<R>, u64), out: &mut Vec<(Vec<R>, u64)>| {
            out.push(block);
            Ok(())
        },
    )
    .unwrap();
    DiskTable::<R>::open(info)
        .read(&collector.input().unwrap(), 2, 1024)
        .unwrap();
    let mut blocks = collector.close().unwrap().pop().unwrap();
    blocks.sort_by_key(|(_, start)| *start);
    blocks.into_iter().flat_map(|(records, _)| records).collect()
}

/// Positions referenced by `records` whose slot passes `keep`.
pub fn referenced_by<R: LinkedRecord>(records: &[R], keep: impl Fn(usize) -> bool) -> BTreeSet<u64> {
    let mut set = BTreeSet::new();
    for (i, r) in records.iter().enumerate() {
        if keep(i) {
            let (pos, off) = r.back_refs();
            set.insert(pos);
            set.insert(pos + off);
        }
    }
    set
}

/// Number of members of `set` below `pos`.
pub fn rank_in(set: &BTreeSet<u64>, pos: u64) -> u64 {
    set.range(..pos).count() as u64
}
