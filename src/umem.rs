//! Public allocator surface: transaction lifecycle plus the `alloc`/`free`
//! convenience calls applications use instead of hand-assembling a
//! reserve/publish transaction themselves (spec §4.6's `umem_*` vtable).
//!
//! [`Umem`] owns one [`Blob`] and is the crate's equivalent of the teacher's
//! top-level service handle (`src/lib.rs`'s `CodeGraph`): a single `Arc<Mutex<_>>`
//! that every call locks for the DRAM-only steps and hands to [`Transaction`]
//! for the durable ones.

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::instrument;

use crate::dram::blob::Blob;
use crate::error::{AdError, Result};
use crate::transaction::{Stage, StageCallback, Transaction, TxFlags};

bitflags! {
    /// Flags accepted by [`Umem::alloc`] (`UMEM_FLAG_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Zero the allocation before returning its address.
        const ZERO = 0b01;
        /// Rejected. The original's "skip the flush" mode has no meaning
        /// here: every publish commits through the WAL at `tx_end`, so
        /// there is nothing to opt out of (spec §4.6 Non-goals).
        const NO_FLUSH = 0b10;
    }
}

bitflags! {
    /// Flags accepted by [`Umem::tx_xadd`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XaddFlags: u8 {
        /// Skip the undo snapshot; track the range for redo only.
        const NO_SNAPSHOT = 0b01;
    }
}

/// A reservation made by [`Umem::reserve`], not yet published or canceled.
/// DRAM-only; never persisted, and invalid once the owning [`Transaction`]
/// that publishes or the [`Umem::cancel`] call that drops it has run.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub arena_id: u32,
    pub group_idx: usize,
    pub bit: usize,
    /// Absolute offset of the reserved unit within the blob.
    pub addr: u64,
    pub size: u64,
}

/// Owns one [`Blob`] and exposes the allocation/transaction API an embedding
/// application calls.
pub struct Umem {
    blob: Arc<Mutex<Blob>>,
}

impl Umem {
    pub fn new(blob: Blob) -> Self {
        Umem { blob: Arc::new(Mutex::new(blob)) }
    }

    /// Access the underlying blob handle, e.g. for [`Blob::root`].
    pub fn blob(&self) -> Arc<Mutex<Blob>> {
        self.blob.clone()
    }

    /// `umem_tx_begin`.
    #[instrument(skip(self))]
    pub async fn tx_begin(&self) -> Result<Transaction> {
        Transaction::begin(self.blob.clone()).await
    }

    /// `umem_tx_begin` with a `(stage, arg)` callback fired on every stage
    /// transition, starting with the initial entry into `Work`.
    pub async fn tx_begin_with_stage_cb(&self, cb: StageCallback) -> Result<Transaction> {
        Transaction::begin_with_stage_cb(self.blob.clone(), cb).await
    }

    /// `umem_tx_stage`.
    pub fn tx_stage(&self, tx: &Transaction) -> Stage {
        tx.stage()
    }

    /// `umem_tx_commit`: end with no error. Panics if `tx` is still nested
    /// (layer > 0) — only the owner of the outermost `tx_begin` may commit.
    pub async fn tx_commit(&self, tx: Transaction) -> Result<()> {
        tx.end(None).await.completed()
    }

    /// `umem_tx_abort`: end with `err`, replaying the undo list.
    pub async fn tx_abort(&self, tx: Transaction, err: AdError) -> Result<()> {
        tx.end(Some(err)).await.completed()
    }

    /// `umem_tx_add`: track `[offset, offset+size)` for redo at commit,
    /// merging with any overlapping range already tracked. No undo
    /// snapshot is taken.
    pub fn tx_add(&self, tx: &mut Transaction, offset: u64, size: usize) {
        tx.tx_add(offset, size);
    }

    /// `umem_tx_xadd`: like [`Umem::tx_add`], but also takes an undo
    /// snapshot first unless `flags` requests [`XaddFlags::NO_SNAPSHOT`].
    pub fn tx_xadd(&self, tx: &mut Transaction, offset: u64, size: usize, flags: XaddFlags) -> Result<()> {
        if flags.contains(XaddFlags::NO_SNAPSHOT) {
            tx.tx_add(offset, size);
            Ok(())
        } else {
            tx.tx_snap(offset, size, TxFlags::UNDO | TxFlags::REDO)
        }
    }

    /// `umem_tx_add_ptr`: register `data` as the redo payload for `offset`.
    /// The original defers the copy until commit via a raw pointer the
    /// caller promises stays valid until then; that can't be expressed
    /// safely across an `.await` commit boundary here, so this copies
    /// `data` into the transaction's redo list immediately instead — same
    /// durable effect, one extra copy (see DESIGN.md).
    pub fn tx_add_ptr(&self, tx: &mut Transaction, offset: u64, data: &[u8]) -> Result<()> {
        tx.tx_copy(offset, data, TxFlags::REDO)
    }

    /// Reserve `size` bytes of `type`, without making them durable
    /// (`umem_reserve`). The caller must `tx_publish` (inside a transaction)
    /// or `cancel` it; dropping the handle without either leaks the
    /// reservation's DRAM-only claim until the arena is reloaded.
    #[instrument(skip(self))]
    pub fn reserve(&self, r#type: u32, size: u64) -> Result<Reservation> {
        let (arena_id, group_idx, bit, addr) = self.blob.lock().reserve_space(r#type, size)?;
        Ok(Reservation { arena_id, group_idx, bit, addr, size })
    }

    /// `umem_cancel`: drop reservations made by [`Umem::reserve`] without
    /// publishing them, in any order.
    pub fn cancel(&self, acts: &[Reservation]) -> Result<()> {
        let blob = self.blob.lock();
        for a in acts {
            let arena = blob.arena_handle(a.arena_id)?;
            let mut arena = arena.lock();
            crate::dram::group::cancel_reservation(&mut arena.group_dram[a.group_idx], a.bit);
        }
        Ok(())
    }

    /// `umem_tx_publish`: publish reservations durably within `tx`.
    pub fn tx_publish(&self, tx: &mut Transaction, acts: &[Reservation]) -> Result<()> {
        for a in acts {
            tx.publish(a.arena_id, a.group_idx, a.bit)?;
        }
        Ok(())
    }

    /// `umem_alloc`: reserve and publish `size` bytes of the size's
    /// auto-selected arena type in one transaction, optionally zeroing them
    /// first. Returns the allocation's address.
    #[instrument(skip(self))]
    pub async fn alloc(&self, size: u64, flags: AllocFlags) -> Result<u64> {
        if flags.contains(AllocFlags::NO_FLUSH) {
            return Err(AdError::Invalid(
                "UMEM_FLAG_NO_FLUSH is unsupported: every publish commits through the WAL at tx_end".into(),
            ));
        }
        let r#type = Blob::arena_type_for_size(size);
        let reservation = self.reserve(r#type, size)?;
        let mut tx = self.tx_begin().await?;
        let result = (|| -> Result<()> {
            if flags.contains(AllocFlags::ZERO) {
                tx.tx_set(reservation.addr, 0, reservation.size as usize, TxFlags::REDO)?;
            }
            tx.publish(reservation.arena_id, reservation.group_idx, reservation.bit)
        })();
        match result {
            Ok(()) => {
                tx.end(None).await.completed()?;
                Ok(reservation.addr)
            }
            Err(e) => {
                self.cancel(&[reservation]).ok();
                Err(tx.end(Some(e)).await.completed().unwrap_err())
            }
        }
    }

    /// `umem_free`: locate the owning arena for `offset` and free it in one
    /// transaction. Tolerates `offset == 0` as a no-op (a null-pointer free).
    #[instrument(skip(self))]
    pub async fn free(&self, offset: u64) -> Result<()> {
        if offset == 0 {
            return Ok(());
        }
        let arena_id = self.blob.lock().find_arena_for_addr(offset)?;
        let mut tx = self.tx_begin().await?;
        match tx.free_addr(arena_id, offset) {
            Ok(()) => tx.end(None).await.completed(),
            Err(e) => Err(tx.end(Some(e)).await.completed().unwrap_err()),
        }
    }

    /// `umem_atomic_copy`: copy `data` into `[dest, dest+data.len())` inside
    /// its own transaction (undo + redo), committing immediately.
    #[instrument(skip(self, data))]
    pub async fn atomic_copy(&self, dest: u64, data: &[u8]) -> Result<()> {
        let mut tx = self.tx_begin().await?;
        match tx.tx_copy(dest, data, TxFlags::UNDO | TxFlags::REDO) {
            Ok(()) => tx.end(None).await.completed(),
            Err(e) => Err(tx.end(Some(e)).await.completed().unwrap_err()),
        }
    }

    /// `umem_atomic_alloc`: [`Umem::alloc`] already commits atomically;
    /// this alias exists for parity with the original's naming.
    pub async fn atomic_alloc(&self, size: u64, flags: AllocFlags) -> Result<u64> {
        self.alloc(size, flags).await
    }

    /// `umem_atomic_free`: see [`Umem::atomic_alloc`].
    pub async fn atomic_free(&self, offset: u64) -> Result<()> {
        self.free(offset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlobConfig;
    use crate::region::{Region, SharedRegion};
    use crate::store::MemStore;
    use std::sync::Arc;

    fn new_umem(size: u64) -> Umem {
        let region: SharedRegion = Arc::new(parking_lot::Mutex::new(Region::create_dummy(size)));
        let store = Arc::new(MemStore::new(region.clone()));
        let blob = Blob::create(region, store, &BlobConfig::dummy(size)).unwrap();
        Umem::new(blob)
    }

    #[tokio::test]
    async fn alloc_then_free_roundtrips() {
        let umem = new_umem(16 * 1024 * 1024);
        let addr = umem.alloc(64, AllocFlags::empty()).await.unwrap();
        assert!(addr > 0);
        umem.free(addr).await.unwrap();
    }

    #[tokio::test]
    async fn alloc_zero_flag_zeroes_the_region() {
        let umem = new_umem(16 * 1024 * 1024);
        let addr = umem.alloc(64, AllocFlags::ZERO).await.unwrap();
        let blob = umem.blob();
        let bytes = blob.lock().region.lock().read_at(addr, 64).unwrap().to_vec();
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn alloc_rejects_no_flush() {
        let umem = new_umem(16 * 1024 * 1024);
        let err = umem.alloc(64, AllocFlags::NO_FLUSH).await.unwrap_err();
        assert!(matches!(err, AdError::Invalid(_)));
    }

    #[tokio::test]
    async fn free_tolerates_null_offset() {
        let umem = new_umem(16 * 1024 * 1024);
        umem.free(0).await.unwrap();
    }

    #[tokio::test]
    async fn atomic_copy_then_free_by_address() {
        let umem = new_umem(16 * 1024 * 1024);
        let addr = umem.alloc(64, AllocFlags::empty()).await.unwrap();
        umem.atomic_copy(addr, &[7u8; 64]).await.unwrap();
        let blob = umem.blob();
        let bytes = blob.lock().region.lock().read_at(addr, 64).unwrap().to_vec();
        assert_eq!(bytes, vec![7u8; 64]);
        umem.free(addr).await.unwrap();
    }

    #[tokio::test]
    async fn reserve_and_cancel_leaves_no_trace() {
        let umem = new_umem(16 * 1024 * 1024);
        let r = umem.reserve(crate::constants::ARENA_TYPE_DEF, 64).unwrap();
        umem.cancel(&[r]).unwrap();
        let r2 = umem.reserve(crate::constants::ARENA_TYPE_DEF, 64).unwrap();
        assert_eq!(r.addr, r2.addr);
    }

    #[tokio::test]
    async fn stage_callback_observes_work_then_commit_then_none() {
        let umem = new_umem(16 * 1024 * 1024);
        let stages = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorded = stages.clone();
        let tx = umem
            .tx_begin_with_stage_cb(Box::new(move |s| recorded.lock().push(s)))
            .await
            .unwrap();
        umem.tx_commit(tx).await.unwrap();
        let seen = stages.lock().clone();
        assert_eq!(seen, vec![Stage::Work, Stage::OnCommit, Stage::None]);
    }
}
