//! # Reachability Bitfield and Rank Index
//!
//! A [`Bitfield`] holds one bit per record position of a level. The mark
//! pass sets bits from many workers at once, so storage is a vector of
//! `AtomicU64` words and [`Bitfield::set`] is an idempotent `fetch_or`.
//!
//! Once marking is done the bitfield is frozen and a [`RankIndex`] is built
//! over it. The index turns an absolute position into its compacted,
//! gap-free position: the number of set bits strictly below it.
//!
//! ## Rank layout
//!
//! ```text
//! bits:    |<---- 1024 ---->|<---- 1024 ---->|<---- 1024 ---->| ...
//! blocks:  [0]              [c0]             [c0+c1]          ...
//! ```
//!
//! `blocks[k]` is the number of set bits before bit `k * 1024`. A rank query
//! reads one block entry and then popcounts at most 16 words.
//!
//! ## Reuse
//!
//! Bitfields are allocated once at the largest table size of the run and
//! passed between levels through [`ReachabilitySlots`], whose `swap()` turns
//! the marks of one level into the filter of the next.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Bits between two cumulative counts in a [`RankIndex`].
pub const RANK_INTERVAL: u64 = 1024;

const WORD_BITS: u64 = 64;
const WORDS_PER_INTERVAL: usize = (RANK_INTERVAL / WORD_BITS) as usize;

/// Errors returned by bitfield and rank operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    /// A position is outside `[0, len)` (or `[0, len]` for ranks).
    #[error("position {pos} out of range for bitfield of {len} bits")]
    OutOfRange { pos: u64, len: u64 },
}

// ------------------------------------------------------------------------------------------------
// Bitfield
// ------------------------------------------------------------------------------------------------

/// Fixed-size, concurrently writable bit vector.
#[derive(Debug)]
pub struct Bitfield {
    words: Vec<AtomicU64>,
    len: u64,
}

impl Bitfield {
    /// Allocates `len` unset bits.
    pub fn new(len: u64) -> Self {
        let words = (0..len.div_ceil(WORD_BITS)).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    /// Number of positions.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the bitfield has no positions at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks `pos`. Setting an already set bit is a no-op.
    pub fn set(&self, pos: u64) -> Result<(), BitfieldError> {
        self.check(pos)?;
        self.words[(pos / WORD_BITS) as usize].fetch_or(1 << (pos % WORD_BITS), Ordering::Relaxed);
        Ok(())
    }

    /// Whether `pos` is set. Positions past the end read as unset.
    pub fn get(&self, pos: u64) -> bool {
        if pos >= self.len {
            return false;
        }
        let word = self.words[(pos / WORD_BITS) as usize].load(Ordering::Relaxed);
        word & (1 << (pos % WORD_BITS)) != 0
    }

    /// Unsets every bit.
    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Total number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Relaxed).count_ones()))
            .sum()
    }

    fn check(&self, pos: u64) -> Result<(), BitfieldError> {
        if pos >= self.len {
            return Err(BitfieldError::OutOfRange { pos, len: self.len });
        }
        Ok(())
    }

    #[inline]
    fn word(&self, i: usize) -> u64 {
        self.words[i].load(Ordering::Relaxed)
    }
}

// ------------------------------------------------------------------------------------------------
// RankIndex
// ------------------------------------------------------------------------------------------------

/// Read-only rank structure over a frozen [`Bitfield`].
///
/// Valid only while the bitfield is not mutated; the compaction pass drops
/// the index before the bitfield is swapped or cleared.
#[derive(Debug)]
pub struct RankIndex {
    bits: Arc<Bitfield>,
    blocks: Vec<u64>,
}

impl RankIndex {
    /// Builds cumulative counts over `bits`.
    pub fn new(bits: Arc<Bitfield>) -> Self {
        let num_blocks = bits.len.div_ceil(RANK_INTERVAL) as usize;
        let mut blocks = Vec::with_capacity(num_blocks + 1);
        let mut total = 0u64;
        blocks.push(0);
        for chunk in bits.words.chunks(WORDS_PER_INTERVAL) {
            total += chunk
                .iter()
                .map(|w| u64::from(w.load(Ordering::Relaxed).count_ones()))
                .sum::<u64>();
            blocks.push(total);
        }
        Self { bits, blocks }
    }

    /// Number of set bits at positions `< pos`, for `pos` in `[0, len]`.
    pub fn rank(&self, pos: u64) -> Result<u64, BitfieldError> {
        if pos > self.bits.len {
            return Err(BitfieldError::OutOfRange { pos, len: self.bits.len });
        }
        let block = (pos / RANK_INTERVAL) as usize;
        let first_word = block * WORDS_PER_INTERVAL;
        let last_word = (pos / WORD_BITS) as usize;

        let mut count = self.blocks[block];
        for i in first_word..last_word {
            count += u64::from(self.bits.word(i).count_ones());
        }
        let tail = pos % WORD_BITS;
        if tail != 0 {
            let mask = (1u64 << tail) - 1;
            count += u64::from((self.bits.word(last_word) & mask).count_ones());
        }
        Ok(count)
    }

    /// Translates a back reference `(pos, pos + off)` into compacted
    /// coordinates `(rank(pos), rank(pos + off) - rank(pos))`.
    ///
    /// Only meaningful when both positions are set.
    pub fn lookup(&self, pos: u64, off: u64) -> Result<(u64, u64), BitfieldError> {
        let other = pos.checked_add(off).ok_or(BitfieldError::OutOfRange {
            pos: u64::MAX,
            len: self.bits.len,
        })?;
        let new_pos = self.rank(pos)?;
        let new_other = self.rank(other)?;
        Ok((new_pos, new_other - new_pos))
    }

    /// Total number of set bits in the indexed bitfield.
    pub fn total(&self) -> u64 {
        self.blocks.last().copied().unwrap_or(0)
    }
}

// ------------------------------------------------------------------------------------------------
// ReachabilitySlots
// ------------------------------------------------------------------------------------------------

/// Two bitfields reused across levels.
///
/// `next` receives the marks of the level being compacted; `current` holds
/// the marks produced by the level above, which filter this level's
/// records. [`swap`](Self::swap) moves to the next level down.
#[derive(Debug)]
pub struct ReachabilitySlots {
    current: Arc<Bitfield>,
    next: Arc<Bitfield>,
}

impl ReachabilitySlots {
    /// Allocates both slots at `len` bits.
    pub fn new(len: u64) -> Self {
        Self {
            current: Arc::new(Bitfield::new(len)),
            next: Arc::new(Bitfield::new(len)),
        }
    }

    /// Exchanges the slots: this level's marks become the next level's
    /// filter.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
    }

    /// Filter produced by the previous level.
    pub fn current(&self) -> &Arc<Bitfield> {
        &self.current
    }

    /// Mark target of the level in progress.
    pub fn next(&self) -> &Arc<Bitfield> {
        &self.next
    }

    /// Consumes the slots, returning the `next` bitfield.
    pub fn into_next(self) -> Arc<Bitfield> {
        self.next
    }
}
