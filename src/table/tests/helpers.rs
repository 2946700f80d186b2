use crate::encoding::{EncodingError, FixedRecord, get_u32, get_u64, put_u32, put_u64};
use crate::pipeline::ThreadPool;
use crate::table::DiskTable;

/// 12-byte test row: its own index plus a derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub index: u64,
    pub value: u32,
}

impl Row {
    pub fn at(index: u64) -> Self {
        Self {
            index,
            value: (index as u32).wrapping_mul(2_654_435_761),
        }
    }
}

impl FixedRecord for Row {
    const DISK_SIZE: usize = 12;

    fn encode_to(&self, buf: &mut [u8]) -> Result<(), EncodingError> {
        put_u64(buf, 0, self.index)?;
        put_u32(buf, 8, self.value)
    }

    fn decode_from(buf: &[u8]) -> Result<Self, EncodingError> {
        Ok(Self {
            index: get_u64(buf, 0)?,
            value: get_u32(buf, 8)?,
        })
    }
}

/// Writes rows `0..n` and closes the table.
pub fn write_rows(table: &mut DiskTable<Row>, n: u64) {
    for i in 0..n {
        table.write(&Row::at(i)).unwrap();
    }
    table.close().unwrap();
}

/// Reads every block, returning them ordered by start offset.
pub fn collect_blocks(
    table: &DiskTable<Row>,
    threads: usize,
    block_size: usize,
) -> Vec<(Vec<Row>, u64)> {
    let collector = ThreadPool::single(
        "test/collect",
        Vec::new(),
        4,
        |block: (Vec<Row>, u64), out: &mut Vec<(Vec<Row>, u64)>| {
            out.push(block);
            Ok(())
        },
    )
    .unwrap();
    table
        .read(&collector.input().unwrap(), threads, block_size)
        .unwrap();
    let mut blocks = collector.close().unwrap().pop().unwrap();
    blocks.sort_by_key(|(_, start)| *start);
    blocks
}
