//! Transaction engine: scoped redo/undo accumulation, reserve/publish/cancel,
//! and `tx_end`'s commit/abort handling (spec §4.5).
//!
//! The original keeps the current transaction in a `__thread` pointer so
//! every `ad_tx_*` call can find it implicitly. This port instead threads an
//! explicit `&mut Transaction` through every API (spec §9 Design Notes calls
//! both translations acceptable); nested transactions are modeled by calling
//! [`Transaction::begin_nested`] on the same instance rather than by a
//! thread-local re-entrancy check. See `DESIGN.md` for the rationale.

use std::sync::{Arc, OnceLock};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{instrument, trace, warn};

use crate::action::{assign_size, Action};
use crate::dram::blob::Blob;
use crate::error::{AdError, Result};
use crate::store::{RedoLog, TxId};

/// Pool cap for the `tx header` tier of the action-object cache (spec §4.5).
const TX_HEADER_POOL_CAP: usize = 16;

/// The two Vecs a transaction churns on every commit. Recycling their
/// backing allocations across transactions is the Rust-idiomatic reading of
/// the original's per-thread `tx header` free list (`ad_tx.c`'s
/// `tls_act_get`/`tls_act_put`, generalized the same way
/// [`crate::action::ActionPool`] generalizes the COPY-payload tiers).
struct TxScratch {
    redo_list: Vec<Action>,
    undo_list: Vec<Action>,
}

fn tx_scratch_pool() -> &'static SegQueue<TxScratch> {
    static POOL: OnceLock<SegQueue<TxScratch>> = OnceLock::new();
    POOL.get_or_init(SegQueue::new)
}

fn take_tx_scratch() -> TxScratch {
    tx_scratch_pool().pop().unwrap_or_else(|| TxScratch { redo_list: Vec::new(), undo_list: Vec::new() })
}

fn return_tx_scratch(mut scratch: TxScratch) {
    let pool = tx_scratch_pool();
    if pool.len() < TX_HEADER_POOL_CAP {
        scratch.redo_list.clear();
        scratch.undo_list.clear();
        pool.push(scratch);
    }
}

bitflags::bitflags! {
    /// Mirrors `AD_TX_REDO`/`AD_TX_UNDO`/`AD_TX_LOG_ONLY` (spec §4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxFlags: u8 {
        const REDO = 0b001;
        const UNDO = 0b010;
        const LOG_ONLY = 0b100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    None,
    Work,
    OnCommit,
    OnAbort,
}

/// Invoked on every stage transition (`None` → `Work` → `OnCommit`/`OnAbort`
/// → `None`) when a transaction is started via
/// [`Transaction::begin_with_stage_cb`].
pub type StageCallback = Box<dyn FnMut(Stage) + Send>;

/// Result of [`Transaction::end`]: a nested `tx_end` only bumps `layer` down
/// and hands the transaction back so the caller's enclosing scope can keep
/// issuing calls against it; the outermost `tx_end` runs `tx_complete` and
/// consumes the transaction.
pub enum EndOutcome {
    StillOpen(Transaction),
    Completed(Result<()>),
}

impl EndOutcome {
    /// Convenience for the common case: panics if the transaction is still
    /// nested (layer > 0) when a caller expected it to be the outermost end.
    pub fn completed(self) -> Result<()> {
        match self {
            EndOutcome::Completed(r) => r,
            EndOutcome::StillOpen(_) => {
                panic!("tx_end: transaction still has open nested layers")
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RangeEntry {
    offset: u64,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingArenaPublish {
    arena_id: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingGroupPublish {
    arena_id: u32,
    group_idx: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingFree {
    arena_id: u32,
    group_idx: usize,
    bit: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingAlloc {
    arena_id: u32,
    group_idx: usize,
}

/// A redo/undo-accumulating transaction scope over one [`Blob`].
pub struct Transaction {
    blob: Arc<Mutex<Blob>>,
    tx_id: TxId,
    redo_list: Vec<Action>,
    undo_list: Vec<Action>,
    ranges: Vec<RangeEntry>,
    pending_arena_publish: Vec<PendingArenaPublish>,
    pending_group_publish: Vec<PendingGroupPublish>,
    pending_frees: Vec<PendingFree>,
    /// Retained per spec §9 ("Open questions") but never populated: group
    /// reset is dead code in the original (`if (1) return 0;`).
    #[allow(dead_code)]
    pending_group_resets: Vec<()>,
    pending_allocs: Vec<PendingAlloc>,
    stage: Stage,
    layer: u32,
    last_errno: Option<AdError>,
    stage_cb: Option<StageCallback>,
}

impl Transaction {
    /// `tx_begin`: allocate a WAL id (the only yield point besides `end`'s
    /// submit) and enter `Work` stage at `layer = 1`.
    #[instrument(skip(blob))]
    pub async fn begin(blob: Arc<Mutex<Blob>>) -> Result<Self> {
        let store = blob.lock().store.clone();
        let tx_id = store.wal_reserv().await?;
        let scratch = take_tx_scratch();
        Ok(Transaction {
            blob,
            tx_id,
            redo_list: scratch.redo_list,
            undo_list: scratch.undo_list,
            ranges: Vec::new(),
            pending_arena_publish: Vec::new(),
            pending_group_publish: Vec::new(),
            pending_frees: Vec::new(),
            pending_group_resets: Vec::new(),
            pending_allocs: Vec::new(),
            stage: Stage::Work,
            layer: 1,
            last_errno: None,
            stage_cb: None,
        })
    }

    /// `ad_tx_begin` with an optional `(stage, arg)` callback: fires once
    /// immediately for the initial `Work` stage, then again on every later
    /// transition this transaction makes.
    pub async fn begin_with_stage_cb(blob: Arc<Mutex<Blob>>, cb: StageCallback) -> Result<Self> {
        let mut tx = Self::begin(blob).await?;
        tx.stage_cb = Some(cb);
        tx.fire_stage();
        Ok(tx)
    }

    fn fire_stage(&mut self) {
        if let Some(cb) = self.stage_cb.as_mut() {
            cb(self.stage);
        }
    }

    /// A nested `tx_begin` on an already-open transaction only bumps `layer`.
    pub fn begin_nested(&mut self) {
        self.layer += 1;
    }

    pub fn layer(&self) -> u32 {
        self.layer
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Keep the first error only (`ad_tx_abort` is idempotent per spec §7 —
    /// a later abort never masks the original cause).
    fn set_sticky_error(&mut self, err: AdError) {
        if self.last_errno.is_none() {
            self.last_errno = Some(err);
        }
    }

    // ---- typed actions (spec §4.5) ----

    /// `ad_tx_set`: fill `size` bytes at `addr` with `byte`.
    pub fn tx_set(&mut self, addr: u64, byte: u8, size: usize, flags: TxFlags) -> Result<()> {
        if flags.contains(TxFlags::UNDO) {
            let before = self.blob.lock().region.lock().read_at(addr, size)?.to_vec();
            self.undo_list.push(Action::Copy { addr, payload: before });
        }
        if !flags.contains(TxFlags::LOG_ONLY) {
            self.blob.lock().region.lock().write_at(addr, &vec![byte; size])?;
        }
        if flags.contains(TxFlags::REDO) {
            self.redo_list.push(Action::Set { addr, size, byte });
        }
        Ok(())
    }

    /// `ad_tx_assign`: overwrite a 1/2/4-byte field at `addr`.
    pub fn tx_assign(&mut self, addr: u64, size: usize, value: u32, flags: TxFlags) -> Result<()> {
        let size_u8 = assign_size(size)?;
        if flags.contains(TxFlags::UNDO) {
            let before = self.blob.lock().region.lock().read_at(addr, size)?.to_vec();
            self.undo_list.push(Action::Copy { addr, payload: before });
        }
        if !flags.contains(TxFlags::LOG_ONLY) {
            let bytes = value.to_le_bytes();
            self.blob.lock().region.lock().write_at(addr, &bytes[..size])?;
        }
        if flags.contains(TxFlags::REDO) {
            self.redo_list.push(Action::Assign { addr, size: size_u8, value });
        }
        Ok(())
    }

    /// `ad_tx_copy`: overwrite `payload.len()` bytes at `addr`.
    pub fn tx_copy(&mut self, addr: u64, payload: &[u8], flags: TxFlags) -> Result<()> {
        if flags.contains(TxFlags::UNDO) {
            let before = self.blob.lock().region.lock().read_at(addr, payload.len())?.to_vec();
            self.undo_list.push(Action::Copy { addr, payload: before });
        }
        if !flags.contains(TxFlags::LOG_ONLY) {
            self.blob.lock().region.lock().write_at(addr, payload)?;
        }
        if flags.contains(TxFlags::REDO) {
            self.redo_list.push(Action::Copy { addr, payload: payload.to_vec() });
        }
        Ok(())
    }

    /// `ad_tx_move`: copy `size` bytes from `src` to `dst`.
    pub fn tx_move(&mut self, dst: u64, src: u64, size: usize, flags: TxFlags) -> Result<()> {
        if flags.contains(TxFlags::UNDO) {
            let before = self.blob.lock().region.lock().read_at(dst, size)?.to_vec();
            self.undo_list.push(Action::Copy { addr: dst, payload: before });
        }
        if !flags.contains(TxFlags::LOG_ONLY) {
            let data = self.blob.lock().region.lock().read_at(src, size)?.to_vec();
            self.blob.lock().region.lock().write_at(dst, &data)?;
        }
        if flags.contains(TxFlags::REDO) {
            self.redo_list.push(Action::Move { dst, src, size });
        }
        Ok(())
    }

    /// `ad_tx_setbits`. Errors with `Invalid` if any targeted bit is already set.
    pub fn tx_setbits(&mut self, addr: u64, bit_pos: usize, bit_count: usize, flags: TxFlags) -> Result<()> {
        self.check_and_apply_bits(addr, bit_pos, bit_count, true, flags)
    }

    /// `ad_tx_clrbits`. Errors with `Invalid` if any targeted bit is already clear.
    pub fn tx_clrbits(&mut self, addr: u64, bit_pos: usize, bit_count: usize, flags: TxFlags) -> Result<()> {
        self.check_and_apply_bits(addr, bit_pos, bit_count, false, flags)
    }

    fn check_and_apply_bits(
        &mut self,
        addr: u64,
        bit_pos: usize,
        bit_count: usize,
        set: bool,
        flags: TxFlags,
    ) -> Result<()> {
        let first_word = bit_pos / 64;
        let last_word = (bit_pos + bit_count.max(1) - 1) / 64;
        let nwords = last_word - first_word + 1;
        let byte_off = addr + (first_word as u64) * 8;
        let raw = self.blob.lock().region.lock().read_at(byte_off, nwords * 8)?.to_vec();
        let mut words = vec![0u64; nwords];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u64::from_le_bytes(raw[i * 8..i * 8 + 8].try_into().unwrap());
        }
        let local_at = bit_pos - first_word * 64;
        for b in local_at..local_at + bit_count {
            let is_set = (words[b / 64] >> (b % 64)) & 1 != 0;
            if is_set == set {
                let verb = if set { "set" } else { "clear" };
                return Err(AdError::Invalid(format!("bit {b} already {verb}")));
            }
        }

        if flags.contains(TxFlags::UNDO) {
            let mut raw_copy = vec![0u8; raw.len()];
            raw_copy.copy_from_slice(&raw);
            self.undo_list.push(Action::Copy { addr: byte_off, payload: raw_copy });
        }
        if !flags.contains(TxFlags::LOG_ONLY) {
            if set {
                crate::bitmap::set_range(&mut words, local_at, bit_count);
            } else {
                crate::bitmap::clr_range(&mut words, local_at, bit_count);
            }
            let mut out = vec![0u8; nwords * 8];
            for (i, w) in words.iter().enumerate() {
                out[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
            }
            self.blob.lock().region.lock().write_at(byte_off, &out)?;
        }
        if flags.contains(TxFlags::REDO) {
            let action = if set {
                Action::SetBits { addr, bit_pos, bit_count }
            } else {
                Action::ClrBits { addr, bit_pos, bit_count }
            };
            self.redo_list.push(action);
        }
        Ok(())
    }

    /// `ad_tx_add`: register `[offset, offset+size)` as a range to be redo-
    /// logged as one merged `COPY` at commit (spec §4.5).
    pub fn tx_add(&mut self, offset: u64, size: usize) {
        for r in self.ranges.iter_mut() {
            let r_end = r.offset + r.size as u64;
            let new_end = offset + size as u64;
            if offset <= r_end && r.offset <= new_end {
                let start = r.offset.min(offset);
                let end = r_end.max(new_end);
                r.offset = start;
                r.size = (end - start) as usize;
                return;
            }
        }
        self.ranges.push(RangeEntry { offset, size });
    }

    /// `ad_tx_snap`: immediately snapshot `[addr, addr+size)` into an undo
    /// `COPY`; if `flags` also requests redo, the range is tracked via
    /// [`Transaction::tx_add`] so later mutations are captured at commit.
    pub fn tx_snap(&mut self, addr: u64, size: usize, flags: TxFlags) -> Result<()> {
        if flags.contains(TxFlags::UNDO) {
            let before = self.blob.lock().region.lock().read_at(addr, size)?.to_vec();
            self.undo_list.push(Action::Copy { addr, payload: before });
        }
        if flags.contains(TxFlags::REDO) {
            self.tx_add(addr, size);
        }
        Ok(())
    }

    // ---- reserve / publish / free (spec §4.2, §4.4) ----

    /// Reserve `size` bytes of `type` (spec §4.4 selector fallthrough).
    /// Reserve-time errors are returned directly; no tx state to roll back.
    pub fn reserve(&mut self, r#type: u32, size: u64) -> Result<(u32, usize, usize, u64)> {
        self.blob.lock().reserve_space(r#type, size)
    }

    /// Cancel a reservation made by [`Transaction::reserve`] without
    /// publishing it (`ad_cancel`): clears the reserved bit and drops the pin.
    pub fn cancel(&mut self, arena_id: u32, group_idx: usize, bit: usize) -> Result<()> {
        let blob = self.blob.lock();
        let arena = blob.arena_handle(arena_id)?;
        let mut arena = arena.lock();
        crate::dram::group::cancel_reservation(&mut arena.group_dram[group_idx], bit);
        Ok(())
    }

    /// Publish a reservation durably within this transaction
    /// (`group_tx_publish`): marks the unit used and decrements `unit_free`.
    pub fn publish(&mut self, arena_id: u32, group_idx: usize, bit: usize) -> Result<()> {
        let (record, needs_write_through, slice_range) = {
            let blob = self.blob.lock();
            let arena = blob.arena_handle(arena_id)?;
            let arena = arena.lock();
            (
                arena.header.groups[group_idx],
                arena.is_group_unpublished(group_idx),
                arena.group_slice_range(group_idx),
            )
        };

        if needs_write_through {
            // First publish of a group reserved by `reserve_new_group`: its
            // record (addr/unit/unit_count/...) and the arena's claim on its
            // slice run only exist in DRAM so far. Write both through now,
            // or the group vanishes (`is_free_slot`) and the slice run looks
            // free again on the next `Blob::open`.
            let record_addr = self.group_record_addr(arena_id, group_idx)?;
            let mut header_bytes = [0u8; 48];
            header_bytes[0..8].copy_from_slice(&record.addr.to_le_bytes());
            header_bytes[8..16].copy_from_slice(&record.addr_real.to_le_bytes());
            header_bytes[16..24].copy_from_slice(&record.back_ptr.to_le_bytes());
            header_bytes[24..32].copy_from_slice(&record.incarnation.to_le_bytes());
            header_bytes[32..36].copy_from_slice(&record.unit.to_le_bytes());
            header_bytes[36..40].copy_from_slice(&record.unit_count.to_le_bytes());
            header_bytes[40..44].copy_from_slice(&record.unit_free.to_le_bytes());
            header_bytes[44..48].copy_from_slice(&record.flags.to_le_bytes());
            self.tx_copy(record_addr, &header_bytes, TxFlags::REDO)?;

            let (at, bits) = slice_range;
            let group_bitmap_addr = self.arena_group_bitmap_addr(arena_id)?;
            self.tx_setbits(group_bitmap_addr, at, bits, TxFlags::REDO)?;
        }

        let bitmap_addr = self.group_unit_bitmap_addr(arena_id, group_idx)?;
        self.tx_setbits(bitmap_addr, bit, 1, TxFlags::REDO)?;

        let unit_free_addr = self.group_unit_free_addr(arena_id, group_idx)?;
        self.tx_assign(unit_free_addr, 4, (record.unit_free - 1) as u32, TxFlags::REDO | TxFlags::LOG_ONLY)?;

        {
            let blob = self.blob.lock();
            let arena = blob.arena_handle(arena_id)?;
            let mut arena = arena.lock();
            arena.header.groups[group_idx].unit_free -= 1;
            // Keep the DRAM mirror of the durable bitmap in sync with what
            // was just written to the region: `reserve_addr` reads this copy
            // to pick the next free unit, and a stale-clear bit here would
            // hand the same address out twice.
            crate::bitmap::set_range(&mut arena.header.groups[group_idx].unit_bitmap, bit, 1);
            crate::dram::group::cancel_reservation(&mut arena.group_dram[group_idx], bit);
        }
        self.pending_group_publish.push(PendingGroupPublish { arena_id, group_idx });
        self.pending_allocs.push(PendingAlloc { arena_id, group_idx });
        Ok(())
    }

    /// `group_tx_free_addr`: free one unit, keeping its bit reserved until
    /// commit. A no-op once the transaction already carries a sticky error
    /// (`OnAbort`-bound): cleanup code run during an aborting scope should
    /// not itself raise a second error or touch already-unwinding state.
    pub fn free_addr(&mut self, arena_id: u32, addr: u64) -> Result<()> {
        if self.last_errno.is_some() {
            return Ok(());
        }
        let (group_idx, bit, record) = {
            let blob = self.blob.lock();
            let arena = blob.arena_handle(arena_id)?;
            let arena = arena.lock();
            let idx = arena.find_group_by_addr(addr)?;
            let record = arena.header.groups[idx];
            (idx, crate::dram::group::addr_to_bit(&record, addr), record)
        };

        let bitmap_addr = self.group_unit_bitmap_addr(arena_id, group_idx)?;
        self.tx_clrbits(bitmap_addr, bit, 1, TxFlags::REDO | TxFlags::UNDO)?;
        let unit_free_addr = self.group_unit_free_addr(arena_id, group_idx)?;
        self.tx_assign(
            unit_free_addr,
            4,
            (record.unit_free + 1) as u32,
            TxFlags::REDO | TxFlags::UNDO | TxFlags::LOG_ONLY,
        )?;

        {
            let blob = self.blob.lock();
            let arena = blob.arena_handle(arena_id)?;
            let mut arena = arena.lock();
            arena.header.groups[group_idx].unit_free += 1;
            crate::bitmap::clr_range(&mut arena.header.groups[group_idx].unit_bitmap, bit, 1);
            crate::bitmap::set_range(&mut arena.group_dram[group_idx].reserved_bitmap, bit, 1);
            arena.group_dram[group_idx].reserved_count += 1;
        }
        self.pending_frees.push(PendingFree { arena_id, group_idx, bit });
        Ok(())
    }

    /// Publish a reserved arena (`arena_tx_publish`).
    pub fn publish_arena(&mut self, arena_id: u32) -> Result<()> {
        self.pending_arena_publish.push(PendingArenaPublish { arena_id });
        Ok(())
    }

    fn group_unit_bitmap_addr(&self, arena_id: u32, group_idx: usize) -> Result<u64> {
        let arena_base = arena_id as u64 * self.blob.lock().arena_size();
        let group_off = crate::layout::ArenaHeader::GROUPS_OFF + group_idx * crate::layout::GroupRecord::SIZE;
        Ok(arena_base + group_off as u64 + 64) // unit_bitmap starts at byte 64 of a GroupRecord
    }

    fn group_unit_free_addr(&self, arena_id: u32, group_idx: usize) -> Result<u64> {
        let arena_base = arena_id as u64 * self.blob.lock().arena_size();
        let group_off = crate::layout::ArenaHeader::GROUPS_OFF + group_idx * crate::layout::GroupRecord::SIZE;
        Ok(arena_base + group_off as u64 + 40) // unit_free is at byte 40 of a GroupRecord
    }

    fn group_record_addr(&self, arena_id: u32, group_idx: usize) -> Result<u64> {
        let arena_base = arena_id as u64 * self.blob.lock().arena_size();
        let group_off = crate::layout::ArenaHeader::GROUPS_OFF + group_idx * crate::layout::GroupRecord::SIZE;
        Ok(arena_base + group_off as u64)
    }

    fn arena_group_bitmap_addr(&self, arena_id: u32) -> Result<u64> {
        let arena_base = arena_id as u64 * self.blob.lock().arena_size();
        Ok(arena_base + crate::layout::ArenaHeader::GROUP_BITMAP_OFF as u64)
    }

    /// Record `err` from a caller that wants this transaction (and every
    /// enclosing layer) to abort (`ad_tx_abort` / sticky error, spec §7).
    pub fn abort_with(&mut self, err: AdError) {
        self.set_sticky_error(err);
    }

    /// `tx_end(err)`: decrement `layer`; on reaching zero, run `tx_complete`.
    #[instrument(skip(self))]
    pub async fn end(mut self, err: Option<AdError>) -> EndOutcome {
        if let Some(e) = err {
            self.set_sticky_error(e);
        }
        self.layer -= 1;
        if self.layer > 0 {
            // A lower layer keeps the transaction open; the caller gets it
            // back and must call `end` again once its own scope closes.
            return EndOutcome::StillOpen(self);
        }
        EndOutcome::Completed(self.complete().await)
    }

    #[instrument(skip(self))]
    async fn complete(mut self) -> Result<()> {
        self.stage = if self.last_errno.is_some() { Stage::OnAbort } else { Stage::OnCommit };
        self.fire_stage();
        let committed = self.last_errno.is_none();

        if committed {
            self.flush_ranges();
            if !self.redo_list.is_empty() {
                let store = self.blob.lock().store.clone();
                let redo = RedoLog { tx_id: self.tx_id, actions: self.redo_list.clone() };
                if let Err(e) = store.wal_submit(redo).await {
                    warn!(error = %e, "wal_submit failed, forcing abort");
                    self.set_sticky_error(e);
                }
            }
        }
        let committed = self.last_errno.is_none();

        let mut touched_arenas = std::collections::HashSet::new();

        for p in &self.pending_arena_publish {
            let mut blob = self.blob.lock();
            if committed {
                blob.publish_arena_sync(p.arena_id).ok();
            }
            touched_arenas.insert(p.arena_id);
        }

        for p in &self.pending_group_publish {
            let blob = self.blob.lock();
            if let Ok(arena) = blob.arena_handle(p.arena_id) {
                let mut arena = arena.lock();
                if committed {
                    arena.mark_group_published(p.group_idx);
                }
                touched_arenas.insert(p.arena_id);
            }
        }

        for p in &self.pending_allocs {
            let blob = self.blob.lock();
            if let Ok(arena) = blob.arena_handle(p.arena_id) {
                let mut arena = arena.lock();
                if !committed {
                    // Reverse the reservation entirely: the publish's redo
                    // writes never reached durable storage.
                    arena.header.groups[p.group_idx].unit_free += 1;
                }
                arena.refresh_weight(p.group_idx);
                touched_arenas.insert(p.arena_id);
            }
        }

        for p in &self.pending_frees {
            let blob = self.blob.lock();
            if let Ok(arena) = blob.arena_handle(p.arena_id) {
                let mut arena = arena.lock();
                crate::dram::group::cancel_reservation(&mut arena.group_dram[p.group_idx], p.bit);
                if !committed {
                    arena.header.groups[p.group_idx].unit_free -= 1;
                }
                arena.refresh_weight(p.group_idx);
                touched_arenas.insert(p.arena_id);
            }
        }

        if !committed {
            trace!(actions = self.undo_list.len(), "replaying undo list");
            let mut blob = self.blob.lock();
            for action in self.undo_list.iter().rev() {
                action.apply_redo(&mut blob.region.lock())?;
            }
        }

        {
            let mut blob = self.blob.lock();
            for id in &touched_arenas {
                if let Ok(arena) = blob.arena_handle(*id) {
                    let w = arena.lock().weight();
                    blob.heap.upsert(*id, w);
                }
            }
        }

        self.stage = Stage::None;
        self.fire_stage();
        let last_errno = self.last_errno.take();
        return_tx_scratch(TxScratch {
            redo_list: std::mem::take(&mut self.redo_list),
            undo_list: std::mem::take(&mut self.undo_list),
        });
        if let Some(err) = last_errno {
            return Err(err);
        }
        Ok(())
    }

    fn flush_ranges(&mut self) {
        if self.ranges.is_empty() {
            return;
        }
        let blob = self.blob.lock();
        let region = blob.region.lock();
        for r in self.ranges.drain(..) {
            if let Ok(bytes) = region.read_at(r.offset, r.size) {
                self.redo_list.push(Action::Copy { addr: r.offset, payload: bytes.to_vec() });
            }
        }
    }
}
