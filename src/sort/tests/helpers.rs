use crate::encoding::{EncodingError, FixedRecord, SortKey, get_u64, put_u64};
use crate::pipeline::ThreadPool;
use crate::sort::DiskSort;
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

/// 16-byte test record: a sort key and a payload used to detect loss or
/// duplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entry {
    pub key: u64,
    pub payload: u64,
}

impl FixedRecord for Entry {
    const DISK_SIZE: usize = 16;

    fn encode_to(&self, buf: &mut [u8]) -> Result<(), EncodingError> {
        put_u64(buf, 0, self.key)?;
        put_u64(buf, 8, self.payload)
    }

    fn decode_from(buf: &[u8]) -> Result<Self, EncodingError> {
        Ok(Self {
            key: get_u64(buf, 0)?,
            payload: get_u64(buf, 8)?,
        })
    }
}

impl SortKey for Entry {
    fn sort_key(&self) -> u64 {
        self.key
    }
}

/// `n` entries with keys uniformly distributed over `key_bits` bits.
pub fn random_entries(n: usize, key_bits: u32, seed: u64) -> Vec<Entry> {
    let mut rng = StdRng::seed_from_u64(seed);
    let max = if key_bits >= 64 { u64::MAX } else { (1u64 << key_bits) - 1 };
    (0..n)
        .map(|i| Entry {
            key: rng.random_range(0..=max),
            payload: i as u64,
        })
        .collect()
}

/// Writes `entries` through a single write cache and flushes it.
pub fn write_all(sort: &DiskSort<Entry>, entries: &[Entry]) {
    let mut cache = sort.acquire_write_cache().unwrap();
    for e in entries {
        cache.add(e).unwrap();
    }
    cache.flush().unwrap();
}

/// Reads the sort back, returning the batches ordered by start offset.
pub fn read_batches(sort: &DiskSort<Entry>, threads: usize) -> Vec<(Vec<Entry>, u64)> {
    let collector = ThreadPool::single(
        "test/collect",
        Vec::new(),
        4,
        |batch: (Vec<Entry>, u64), out: &mut Vec<(Vec<Entry>, u64)>| {
            out.push(batch);
            Ok(())
        },
    )
    .unwrap();
    sort.read(&collector.input().unwrap(), threads, None).unwrap();
    let mut batches = collector.close().unwrap().pop().unwrap();
    batches.sort_by_key(|(_, offset)| *offset);
    batches
}

/// Reads the sort back as one flat sequence.
pub fn read_all(sort: &DiskSort<Entry>, threads: usize) -> Vec<Entry> {
    read_batches(sort, threads)
        .into_iter()
        .flat_map(|(records, _)| records)
        .collect()
}
