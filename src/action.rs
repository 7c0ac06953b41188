//! Redo/undo action taxonomy (spec §3 "Durable action kinds") and the
//! per-thread action-object pool (spec §4.5).
//!
//! Rust's enums don't need a manual allocator the way the original's tagged
//! `struct ad_act` does (`ad_tx.c`'s `tls_act_get`/`tls_act_put`); the part of
//! that design worth keeping is reuse of the `COPY` payload buffer, which is
//! the one allocation hot enough to matter. [`ActionPool`] recycles those
//! buffers the way the teacher's `BufferPool`/`PooledBuffer`
//! (`codegraph-core::buffer_pool`) recycles byte buffers, generalized to a
//! thread-local free list instead of a shared `Arc<Mutex<..>>` since actions
//! never cross threads (spec §5: the current transaction is thread-local).

use crate::error::{AdError, Result};
use crate::region::Region;

/// Small-copy payloads up to this size are served from the pooled free list;
/// larger payloads always go to the system allocator (spec §4.5).
pub const SMALL_COPY_MAX: usize = 512;
const SMALL_COPY_POOL_CAP: usize = 256;

/// One redo or undo log entry. The same representation serves both lists:
/// undo entries describe the pre-image, redo entries the post-image, and
/// `apply` always means "make the region reflect this entry".
#[derive(Debug, Clone)]
pub enum Action {
    Noop,
    /// Overwrite `size` bytes at `addr` with `payload` (`payload.len() == size`).
    Copy { addr: u64, payload: Vec<u8> },
    /// Overwrite a 1/2/4-byte integer field at `addr` with `value`.
    Assign { addr: u64, size: u8, value: u32 },
    /// Copy `size` bytes from `src` to `dst` within the same region.
    Move { dst: u64, src: u64, size: usize },
    /// Fill `size` bytes at `addr` with `byte`.
    Set { addr: u64, size: usize, byte: u8 },
    /// Set `bit_count` bits starting at `bit_pos` within the word-array at `addr`.
    SetBits { addr: u64, bit_pos: usize, bit_count: usize },
    /// Clear `bit_count` bits starting at `bit_pos` within the word-array at `addr`.
    ClrBits { addr: u64, bit_pos: usize, bit_count: usize },
    /// Reserved, never produced (spec §3).
    Csum,
}

impl Action {
    /// Apply this entry to `region`, producing the post-image it describes.
    /// Used identically for redo replay (WAL apply) and undo replay (abort).
    pub fn apply_redo(&self, region: &mut Region) -> Result<()> {
        match self {
            Action::Noop | Action::Csum => Ok(()),
            Action::Copy { addr, payload } => region.write_at(*addr, payload),
            Action::Assign { addr, size, value } => {
                let bytes = value.to_le_bytes();
                let n = *size as usize;
                region.write_at(*addr, &bytes[..n])
            }
            Action::Move { dst, src, size } => {
                let data = region.read_at(*src, *size)?.to_vec();
                region.write_at(*dst, &data)
            }
            Action::Set { addr, size, byte } => {
                let data = vec![*byte; *size];
                region.write_at(*addr, &data)
            }
            Action::SetBits { addr, bit_pos, bit_count } => apply_bits(region, *addr, *bit_pos, *bit_count, true),
            Action::ClrBits { addr, bit_pos, bit_count } => apply_bits(region, *addr, *bit_pos, *bit_count, false),
        }
    }
}

fn apply_bits(region: &mut Region, addr: u64, bit_pos: usize, bit_count: usize, set: bool) -> Result<()> {
    let first_word = bit_pos / 64;
    let last_word = (bit_pos + bit_count.max(1) - 1) / 64;
    let nwords = last_word - first_word + 1;
    let byte_off = addr + (first_word as u64) * 8;
    let raw = region.read_at(byte_off, nwords * 8)?.to_vec();
    let mut words = vec![0u64; nwords];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u64::from_le_bytes(raw[i * 8..i * 8 + 8].try_into().unwrap());
    }
    let local_at = bit_pos - first_word * 64;
    if set {
        crate::bitmap::set_range(&mut words, local_at, bit_count);
    } else {
        crate::bitmap::clr_range(&mut words, local_at, bit_count);
    }
    let mut out = vec![0u8; nwords * 8];
    for (i, w) in words.iter().enumerate() {
        out[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
    }
    region.write_at(byte_off, &out)
}

/// Validates that `size` is one of the integer widths `ad_tx_assign` accepts.
pub fn assign_size(size: usize) -> Result<u8> {
    match size {
        1 | 2 | 4 => Ok(size as u8),
        _ => Err(AdError::Invalid(format!("assign size must be 1, 2 or 4, got {size}"))),
    }
}

/// Generic (no-payload) actions are small enough that pooling them buys
/// nothing in Rust; the one allocation worth reusing is the `COPY` payload
/// buffer. `ActionPool` grounds that reuse on the teacher's
/// `codegraph-zerocopy::buffer::BufferPool` (`SegQueue` free list + hit/miss
/// counters), generalized to two size tiers matching the original's
/// "generic ≤64B" / "small-copy ≤512B" pool split (spec §4.5).
const GENERIC_MAX: usize = 64;
const GENERIC_POOL_CAP: usize = 512;

pub struct ActionPool {
    generic: crossbeam_queue::SegQueue<Vec<u8>>,
    small_copy: crossbeam_queue::SegQueue<Vec<u8>>,
    hits: crossbeam_utils::CachePadded<std::sync::atomic::AtomicUsize>,
    misses: crossbeam_utils::CachePadded<std::sync::atomic::AtomicUsize>,
}

impl Default for ActionPool {
    fn default() -> Self {
        ActionPool {
            generic: crossbeam_queue::SegQueue::new(),
            small_copy: crossbeam_queue::SegQueue::new(),
            hits: crossbeam_utils::CachePadded::new(std::sync::atomic::AtomicUsize::new(0)),
            misses: crossbeam_utils::CachePadded::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

impl ActionPool {
    fn tier(len: usize) -> Option<&'static str> {
        if len <= GENERIC_MAX {
            Some("generic")
        } else if len <= SMALL_COPY_MAX {
            Some("small_copy")
        } else {
            None
        }
    }

    /// Get a zeroed buffer of at least `len` bytes, reused from the matching
    /// tier's free list when one is available.
    #[tracing::instrument(skip(self))]
    pub fn get_copy_buf(&self, len: usize) -> Vec<u8> {
        let queue = match Self::tier(len) {
            Some("generic") => Some(&self.generic),
            Some("small_copy") => Some(&self.small_copy),
            _ => None,
        };
        if let Some(queue) = queue {
            if let Some(mut buf) = queue.pop() {
                buf.clear();
                buf.resize(len, 0);
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::trace!(len, "action pool hit");
                return buf;
            }
        }
        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::trace!(len, "action pool miss");
        vec![0u8; len]
    }

    /// Return a buffer to its tier's free list once its action has been
    /// applied or discarded. Buffers outside both tiers, or once a tier is
    /// at capacity, are simply dropped.
    #[tracing::instrument(skip(self, buf))]
    pub fn put_copy_buf(&self, mut buf: Vec<u8>) {
        let (queue, cap) = match Self::tier(buf.capacity()) {
            Some("generic") => (&self.generic, GENERIC_POOL_CAP),
            Some("small_copy") => (&self.small_copy, SMALL_COPY_POOL_CAP),
            _ => return,
        };
        if queue.len() >= cap {
            return;
        }
        buf.clear();
        queue.push(buf);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_action_overwrites_region() {
        let mut region = Region::create_dummy(64);
        let action = Action::Copy { addr: 0, payload: vec![0x5a; 16] };
        action.apply_redo(&mut region).unwrap();
        assert_eq!(region.read_at(0, 16).unwrap(), &[0x5a; 16][..]);
    }

    #[test]
    fn setbits_and_clrbits_roundtrip() {
        let mut region = Region::create_dummy(64);
        Action::SetBits { addr: 0, bit_pos: 3, bit_count: 5 }.apply_redo(&mut region).unwrap();
        let word = u64::from_le_bytes(region.read_at(0, 8).unwrap().try_into().unwrap());
        assert_eq!(word, 0b1111100);
        Action::ClrBits { addr: 0, bit_pos: 4, bit_count: 2 }.apply_redo(&mut region).unwrap();
        let word = u64::from_le_bytes(region.read_at(0, 8).unwrap().try_into().unwrap());
        assert_eq!(word, 0b1000100);
    }

    #[test]
    fn action_pool_reuses_buffers() {
        let pool = ActionPool::default();
        let buf = pool.get_copy_buf(64);
        let cap = buf.capacity();
        pool.put_copy_buf(buf);
        let buf2 = pool.get_copy_buf(64);
        assert!(buf2.capacity() >= cap.min(64));
        assert_eq!(pool.hits(), 1);
        assert_eq!(pool.misses(), 1);
    }
}
