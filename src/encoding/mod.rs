//! Fixed-size record contract for headerless on-disk files.
//!
//! Every file produced by this crate (bucket files of the external sort and
//! flat tables) is a plain concatenation of fixed-size encoded records. A
//! record type describes itself through the [`FixedRecord`] trait: its exact
//! byte size and how to encode into / decode from a slice of that size.
//!
//! # Wire format
//!
//! The layout of a record is owned by its implementor. The helpers in this
//! module read and write fixed-width **little-endian** integers at explicit
//! offsets, so implementations stay byte-stable regardless of compiler
//! layout:
//!
//! | Rust type | Helper pair                 | Width    |
//! |-----------|-----------------------------|----------|
//! | `u8`      | [`put_u8`] / [`get_u8`]     | 1 byte   |
//! | `u16`     | [`put_u16`] / [`get_u16`]   | 2 bytes  |
//! | `u32`     | [`put_u32`] / [`get_u32`]   | 4 bytes  |
//! | `u64`     | [`put_u64`] / [`get_u64`]   | 8 bytes  |
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()`, `expect()`, or unchecked
//! indexing. Out-of-range accesses are reported as
//! [`EncodingError::UnexpectedEof`].
//!
//! # Contract
//!
//! The encoding used to write a file must be identical to the one used to
//! read it back. A mismatch is not detectable at this layer: records are
//! headerless, so a wrong decoder silently produces garbage values.


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during record encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before the field could be accessed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to access the field.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A buffer handed to a codec did not match the record size.
    #[error("record size mismatch (expected {expected} bytes, got {actual})")]
    SizeMismatch {
        /// [`FixedRecord::DISK_SIZE`] of the record type.
        expected: usize,
        /// Length of the buffer actually supplied.
        actual: usize,
    },

    /// Application-level codec error.
    #[error("{0}")]
    Custom(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// A record with a fixed on-disk size.
///
/// Implementations **must** be deterministic: the same logical value always
/// yields the same `DISK_SIZE` bytes.
pub trait FixedRecord: Sized + Send + 'static {
    /// Exact number of bytes one encoded record occupies.
    const DISK_SIZE: usize;

    /// Encode `self` into `buf`, which is exactly [`Self::DISK_SIZE`] bytes long.
    fn encode_to(&self, buf: &mut [u8]) -> Result<(), EncodingError>;

    /// Decode one record from `buf`, which is exactly [`Self::DISK_SIZE`] bytes long.
    fn decode_from(buf: &[u8]) -> Result<Self, EncodingError>;
}

/// A record that can be routed and ordered by an unsigned integer key.
///
/// Only the low `key_size` bits (as configured on the external sort) take
/// part in bucket routing; the in-bucket sort compares the full value.
pub trait SortKey {
    /// The record's sort key.
    fn sort_key(&self) -> u64;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode `records` back-to-back into `out`, which must hold exactly
/// `records.len() * T::DISK_SIZE` bytes.
pub fn encode_slice<T: FixedRecord>(records: &[T], out: &mut [u8]) -> Result<(), EncodingError> {
    let needed = records.len() * T::DISK_SIZE;
    if T::DISK_SIZE == 0 || out.len() != needed {
        return Err(EncodingError::SizeMismatch {
            expected: needed,
            actual: out.len(),
        });
    }
    for (record, chunk) in records.iter().zip(out.chunks_exact_mut(T::DISK_SIZE)) {
        record.encode_to(chunk)?;
    }
    Ok(())
}

/// Decode every record contained in `bytes`, appending them to `out`.
///
/// `bytes.len()` must be a multiple of `T::DISK_SIZE`.
pub fn decode_into<T: FixedRecord>(bytes: &[u8], out: &mut Vec<T>) -> Result<(), EncodingError> {
    if T::DISK_SIZE == 0 || bytes.len() % T::DISK_SIZE != 0 {
        return Err(EncodingError::SizeMismatch {
            expected: T::DISK_SIZE,
            actual: bytes.len(),
        });
    }
    out.reserve(bytes.len() / T::DISK_SIZE);
    for chunk in bytes.chunks_exact(T::DISK_SIZE) {
        out.push(T::decode_from(chunk)?);
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Borrow `N` bytes of `buf` starting at `at`.
#[inline]
fn field<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], EncodingError> {
    let end = at.saturating_add(N);
    match buf.get(at..end) {
        Some(slice) => {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(slice);
            Ok(bytes)
        }
        None => Err(EncodingError::UnexpectedEof {
            needed: end,
            available: buf.len(),
        }),
    }
}

/// Mutably borrow `len` bytes of `buf` starting at `at`.
#[inline]
fn field_mut(buf: &mut [u8], at: usize, len: usize) -> Result<&mut [u8], EncodingError> {
    let available = buf.len();
    let end = at.saturating_add(len);
    buf.get_mut(at..end).ok_or(EncodingError::UnexpectedEof {
        needed: end,
        available,
    })
}

// ------------------------------------------------------------------------------------------------
// Fixed-width field helpers
// ------------------------------------------------------------------------------------------------

/// Write one byte at `at`.
#[inline]
pub fn put_u8(buf: &mut [u8], at: usize, value: u8) -> Result<(), EncodingError> {
    field_mut(buf, at, 1)?.copy_from_slice(&[value]);
    Ok(())
}

/// Read one byte at `at`.
#[inline]
pub fn get_u8(buf: &[u8], at: usize) -> Result<u8, EncodingError> {
    Ok(field::<1>(buf, at)?[0])
}

/// Write a little-endian `u16` at `at`.
#[inline]
pub fn put_u16(buf: &mut [u8], at: usize, value: u16) -> Result<(), EncodingError> {
    field_mut(buf, at, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Read a little-endian `u16` at `at`.
#[inline]
pub fn get_u16(buf: &[u8], at: usize) -> Result<u16, EncodingError> {
    Ok(u16::from_le_bytes(field(buf, at)?))
}

/// Write a little-endian `u32` at `at`.
#[inline]
pub fn put_u32(buf: &mut [u8], at: usize, value: u32) -> Result<(), EncodingError> {
    field_mut(buf, at, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Read a little-endian `u32` at `at`.
#[inline]
pub fn get_u32(buf: &[u8], at: usize) -> Result<u32, EncodingError> {
    Ok(u32::from_le_bytes(field(buf, at)?))
}

/// Write a little-endian `u64` at `at`.
#[inline]
pub fn put_u64(buf: &mut [u8], at: usize, value: u64) -> Result<(), EncodingError> {
    field_mut(buf, at, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Read a little-endian `u64` at `at`.
#[inline]
pub fn get_u64(buf: &[u8], at: usize) -> Result<u64, EncodingError> {
    Ok(u64::from_le_bytes(field(buf, at)?))
}
