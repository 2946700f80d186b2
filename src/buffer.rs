//! Fixed-capacity staging buffer of encoded records.
//!
//! A [`ByteBuffer`] is sized from a **byte budget**, not a record count:
//! `capacity = budget / record_size`. Every consumer therefore reasons
//! about its memory footprint in bytes, independent of the record type.
//!
//! The buffer never grows. Callers check [`ByteBuffer::is_full`] and drain
//! (write out or decode) before pushing more records.

use crate::encoding::{EncodingError, FixedRecord};

/// A flat byte array holding up to `capacity` encoded records.
#[derive(Debug)]
pub struct ByteBuffer {
    data: Vec<u8>,
    entry_size: usize,
    capacity: usize,
    count: usize,
}

impl ByteBuffer {
    /// Creates a buffer for records of `entry_size` bytes within `byte_budget`.
    ///
    /// The capacity is clamped to at least one record so a budget smaller
    /// than a record never yields an unusable buffer.
    pub fn with_budget(byte_budget: usize, entry_size: usize) -> Self {
        let entry_size = entry_size.max(1);
        let capacity = (byte_budget / entry_size).max(1);
        Self {
            data: vec![0u8; capacity * entry_size],
            entry_size,
            capacity,
            count: 0,
        }
    }

    /// Creates a buffer sized for records of type `T`.
    pub fn for_record<T: FixedRecord>(byte_budget: usize) -> Self {
        Self::with_budget(byte_budget, T::DISK_SIZE)
    }

    /// Maximum number of records the buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records currently staged.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    /// Byte offset of record `i`.
    #[inline]
    pub fn entry_at(&self, i: usize) -> usize {
        i * self.entry_size
    }

    /// Encodes `record` into the next free slot.
    ///
    /// Returns [`EncodingError::Custom`] if the buffer is already full;
    /// callers are expected to drain first.
    pub fn push<T: FixedRecord>(&mut self, record: &T) -> Result<(), EncodingError> {
        if self.is_full() {
            return Err(EncodingError::Custom(format!(
                "byte buffer full ({} records)",
                self.capacity
            )));
        }
        if T::DISK_SIZE != self.entry_size {
            return Err(EncodingError::SizeMismatch {
                expected: self.entry_size,
                actual: T::DISK_SIZE,
            });
        }
        let start = self.entry_at(self.count);
        record.encode_to(&mut self.data[start..start + self.entry_size])?;
        self.count += 1;
        Ok(())
    }

    /// The bytes of all staged records.
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.entry_at(self.count)]
    }

    /// Exposes the first `n` record slots for a bulk read, marking them as staged.
    ///
    /// `n` is clamped to the capacity.
    pub fn fill_slots(&mut self, n: usize) -> &mut [u8] {
        self.count = n.min(self.capacity);
        let end = self.entry_at(self.count);
        &mut self.data[..end]
    }

    /// Forgets all staged records.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
