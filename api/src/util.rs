//! Byte-level utilities: little-endian integer helpers over fixed buffers,
//! and a binary search variant that resolves duplicate runs to their first or
//! last element.
//!
//! Every multi-byte integer the store writes to disk goes through these
//! helpers, so the on-disk encoding is little-endian on every platform.

use crate::error::{APIError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

/// Read a little-endian `u32` from `buf` at byte offset `off`.
pub fn read_u32(buf: &[u8], off: usize) -> Result<u32> {
    check(buf.len(), off, 4)?;
    Ok(LittleEndian::read_u32(&buf[off..off + 4]))
}

/// Write `v` as a little-endian `u32` into `buf` at byte offset `off`.
pub fn write_u32(buf: &mut [u8], off: usize, v: u32) -> Result<()> {
    check(buf.len(), off, 4)?;
    LittleEndian::write_u32(&mut buf[off..off + 4], v);
    Ok(())
}

/// Read a little-endian `i32` from `buf` at byte offset `off`.
pub fn read_i32(buf: &[u8], off: usize) -> Result<i32> {
    check(buf.len(), off, 4)?;
    Ok(LittleEndian::read_i32(&buf[off..off + 4]))
}

/// Read a little-endian `i64` from `buf` at byte offset `off`.
pub fn read_i64(buf: &[u8], off: usize) -> Result<i64> {
    check(buf.len(), off, 8)?;
    Ok(LittleEndian::read_i64(&buf[off..off + 8]))
}

/// Write `v` as a little-endian `i64` into `buf` at byte offset `off`.
pub fn write_i64(buf: &mut [u8], off: usize, v: i64) -> Result<()> {
    check(buf.len(), off, 8)?;
    LittleEndian::write_i64(&mut buf[off..off + 8], v);
    Ok(())
}

/// Append `v` as a little-endian `u32` to `out`.
pub fn push_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

/// Append `v` as a little-endian `i32` to `out`.
pub fn push_i32(out: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    LittleEndian::write_i32(&mut b, v);
    out.extend_from_slice(&b);
}

/// Encode `v` as its 4 little-endian bytes.
pub fn u32_bytes(v: u32) -> [u8; 4] {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    b
}

fn check(len: usize, off: usize, n: usize) -> Result<()> {
    if off + n > len {
        return Err(APIError::BufferInput(
            "integer access beyond the end of the buffer",
        ));
    }
    Ok(())
}

/// Which element of a run of equal elements a biased binary search resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Resolve to the first (leftmost) equal element
    First,
    /// Resolve to the last (rightmost) equal element
    Last,
}

/// Binary search over a sorted slice that disambiguates duplicates.
///
/// `cmp` compares an element against the probe, like `slice::binary_search_by`.
/// On a hit, returns `Ok` with the index of the first or last equal element
/// depending on `bias`; on a miss, returns `Err` with the insertion index that
/// keeps the slice sorted.
pub fn binary_search_bias<T, F>(slice: &[T], cmp: F, bias: Bias) -> std::result::Result<usize, usize>
where
    F: Fn(&T) -> Ordering,
{
    let mut lo = 0;
    let mut hi = slice.len();
    match bias {
        Bias::First => {
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match cmp(&slice[mid]) {
                    Ordering::Less => lo = mid + 1,
                    _ => hi = mid,
                }
            }
            // lo is the first index whose element is >= the probe
            if lo < slice.len() && cmp(&slice[lo]) == Ordering::Equal {
                Ok(lo)
            } else {
                Err(lo)
            }
        }
        Bias::Last => {
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match cmp(&slice[mid]) {
                    Ordering::Greater => hi = mid,
                    _ => lo = mid + 1,
                }
            }
            // lo is the first index whose element is > the probe
            if lo > 0 && cmp(&slice[lo - 1]) == Ordering::Equal {
                Ok(lo - 1)
            } else {
                Err(lo)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_roundtrip() {
        let mut buf = [0u8; 16];
        write_u32(&mut buf, 0, 0xDEAD_BEEF).unwrap();
        write_i64(&mut buf, 8, -42).unwrap();
        assert_eq!(read_u32(&buf, 0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_i64(&buf, 8).unwrap(), -42);
        // Little-endian byte order on disk
        assert_eq!(buf[0], 0xEF);
        assert_eq!(buf[3], 0xDE);

        assert!(read_u32(&buf, 13).is_err());
        assert!(write_i64(&mut buf, 9, 0).is_err());
    }

    #[test]
    fn push_helpers() {
        let mut out = Vec::new();
        push_u32(&mut out, 1);
        push_i32(&mut out, -1);
        assert_eq!(out, vec![1, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(u32_bytes(0x0102_0304), [4, 3, 2, 1]);
    }

    #[test]
    fn biased_search_duplicates() {
        let v = [1, 3, 3, 3, 5];
        let by = |probe: i32| move |x: &i32| x.cmp(&probe);
        assert_eq!(binary_search_bias(&v, by(3), Bias::First), Ok(1));
        assert_eq!(binary_search_bias(&v, by(3), Bias::Last), Ok(3));
        assert_eq!(binary_search_bias(&v, by(1), Bias::First), Ok(0));
        assert_eq!(binary_search_bias(&v, by(5), Bias::Last), Ok(4));
        // Misses report the insertion index
        assert_eq!(binary_search_bias(&v, by(0), Bias::First), Err(0));
        assert_eq!(binary_search_bias(&v, by(4), Bias::First), Err(4));
        assert_eq!(binary_search_bias(&v, by(4), Bias::Last), Err(4));
        assert_eq!(binary_search_bias(&v, by(9), Bias::Last), Err(5));
        let empty: [i32; 0] = [];
        assert_eq!(binary_search_bias(&empty, by(1), Bias::First), Err(0));
    }
}
