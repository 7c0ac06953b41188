//! Blob: backing region owner, arena-type registry, free-space heap, and
//! arena DRAM cache (spec §4.4).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::BlobConfig;
use crate::constants::{
    ARENA_ANY, ARENA_HDR_SIZE, ARENA_LRU_MAX, ARENA_SPEC_MAX,
    ARENA_TYPE_DEF, ARENA_TYPE_LARGE, BLOB_HDR_SIZE, GRP_SPECS_DEF, GRP_SPECS_LARGE, GroupSpec,
    LARGE_ALLOC_THRESHOLD, ROOT_OBJ_OFF, ROOT_OBJ_SIZE,
};
use crate::dram::arena::Arena;
use crate::error::{AdError, Result};
use crate::heap::FreeSpaceHeap;
use crate::layout::{ArenaHeader, ArenaTypeSpec, BlobHeader, GroupSpecEntry};
use crate::lru::Lru;
use crate::region::SharedRegion;
use crate::store::Store;

fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

pub struct Blob {
    /// DRAM-only identity for tracing spans; never persisted.
    pub id: Uuid,
    pub region: SharedRegion,
    pub store: Arc<dyn Store>,
    pub header: BlobHeader,
    pub incarnation: u64,
    /// Bytes covered by one arena. Fixed at [`crate::constants::ARENA_SIZE`]
    /// in production; [`BlobConfig::arena_size`] may shrink it for tests
    /// that want to exercise cross-arena behaviour cheaply.
    arena_size: u64,
    arenas: HashMap<u32, Arc<Mutex<Arena>>>,
    pub heap: FreeSpaceHeap,
    lru: Lru<Mutex<Arena>>,
    /// DRAM-only: arenas currently reserved (unpublished), keyed by id.
    reserved_arenas: std::collections::HashSet<u32>,
    last_used: [u32; ARENA_SPEC_MAX],
}

impl Blob {
    fn arena_bitmap_words(size: u64, arena_size: u64) -> usize {
        let arena_count = (size + arena_size - 1) / arena_size;
        ((arena_count + 63) / 64).max(1) as usize
    }

    pub fn arena_size(&self) -> u64 {
        self.arena_size
    }

    /// Format a brand-new blob over `region` per `config` (spec §4.4 "Initialisation").
    #[instrument(skip(region, store, config))]
    pub fn create(region: SharedRegion, store: Arc<dyn Store>, config: &BlobConfig) -> Result<Self> {
        let arena_size = config.arena_size;
        let arena_size_mask = arena_size - 1;
        let size = (config.size + arena_size_mask) & !arena_size_mask;
        let bitmap_words = Self::arena_bitmap_words(size, arena_size);
        let incarnation = now_micros();
        let header = BlobHeader::new(size, arena_size, incarnation, bitmap_words);

        let mut blob = Blob {
            id: Uuid::new_v4(),
            region,
            store,
            header,
            incarnation,
            arena_size,
            arenas: HashMap::new(),
            heap: FreeSpaceHeap::new(),
            lru: Lru::new(ARENA_LRU_MAX),
            reserved_arenas: std::collections::HashSet::new(),
            last_used: [ARENA_ANY; ARENA_SPEC_MAX],
        };

        blob.register_arena_type(ARENA_TYPE_DEF, GRP_SPECS_DEF)?;
        blob.register_arena_type(ARENA_TYPE_LARGE, GRP_SPECS_LARGE)?;

        // Arena 0 is written straight to the image, no WAL (spec §4.4).
        let arena0_header = blob.new_arena_header(0, ARENA_TYPE_DEF)?;
        let arena_obj = Arena::from_header(arena0_header);

        crate::bitmap::set_range(&mut blob.header.arena_bitmap, 0, 1);
        {
            let mut region = blob.region.lock();
            let mut buf = vec![0u8; ArenaHeader::encoded_len()];
            arena_obj.header.write(&mut buf);
            region.write_at(0, &buf)?;

            let mut hdr_buf = vec![0u8; BlobHeader::encoded_len(bitmap_words)];
            blob.header.write(&mut hdr_buf);
            region.write_at(ARENA_HDR_SIZE, &hdr_buf)?;
            region.flush()?;
        }
        blob.last_used[ARENA_TYPE_DEF as usize] = 0;
        blob.heap.upsert(0, arena_obj.weight());
        blob.arenas.insert(0, Arc::new(Mutex::new(arena_obj)));

        debug!(blob_id = %blob.id, "blob created");
        Ok(blob)
    }

    /// Open an existing blob (spec §4.4 "Open").
    #[instrument(skip(region, store))]
    pub fn open(region: SharedRegion, store: Arc<dyn Store>) -> Result<Self> {
        let size;
        let arena_size;
        let header;
        {
            let region_guard = region.lock();
            let probe = BlobHeader::read(region_guard.as_bytes(), 1);
            if probe.magic != crate::constants::BLOB_MAGIC || probe.version == 0 {
                return Err(AdError::Protocol(format!(
                    "bad blob magic {:#x} version {}",
                    probe.magic, probe.version
                )));
            }
            size = probe.size;
            arena_size = probe.arena_size;
            let bitmap_words = Self::arena_bitmap_words(size, arena_size);
            header = BlobHeader::read(region_guard.as_bytes(), bitmap_words);
        }

        let incarnation = now_micros();
        let mut blob = Blob {
            id: Uuid::new_v4(),
            region,
            store,
            header,
            incarnation,
            arena_size,
            arenas: HashMap::new(),
            heap: FreeSpaceHeap::new(),
            lru: Lru::new(ARENA_LRU_MAX),
            reserved_arenas: std::collections::HashSet::new(),
            last_used: [ARENA_ANY; ARENA_SPEC_MAX],
        };

        for t in 0..ARENA_SPEC_MAX {
            blob.last_used[t] = blob.header.arena_specs[t].last_used;
        }

        let arena_count = blob.header.arena_bitmap.len() * 64;
        for id in 0..arena_count as u32 {
            if !crate::bitmap::is_set(&blob.header.arena_bitmap, id as usize) {
                continue;
            }
            let arena = blob.load_arena_from_region(id)?;
            if arena.header.magic != crate::constants::ARENA_MAGIC {
                warn!(id, "bad arena magic on open");
                return Err(AdError::Protocol(format!("bad arena magic for arena {id}")));
            }
            let w = arena.weight();
            blob.heap.upsert(id, w);
            blob.arenas.insert(id, Arc::new(Mutex::new(arena)));
        }

        debug!(blob_id = %blob.id, arenas = blob.arenas.len(), "blob opened");
        Ok(blob)
    }

    fn load_arena_from_region(&self, id: u32) -> Result<Arena> {
        let region = self.region.lock();
        let off = id as u64 * self.arena_size;
        let buf = region.read_at(off, ArenaHeader::encoded_len())?;
        let mut header = ArenaHeader::read(buf);
        if header.incarnation != self.incarnation {
            header.incarnation = self.incarnation;
            header.back_ptr = 0;
        }
        Ok(Arena::from_header(header))
    }

    pub fn register_arena_type(&mut self, r#type: u32, specs: &[GroupSpec]) -> Result<()> {
        if r#type as usize >= ARENA_SPEC_MAX {
            return Err(AdError::Invalid(format!("arena type {type} out of range")));
        }
        if !self.header.arena_specs[r#type as usize].specs.is_empty() {
            return Err(AdError::Exists(format!("arena type {type} already registered")));
        }
        self.header.arena_specs[r#type as usize] = ArenaTypeSpec {
            specs: specs.iter().map(|s| GroupSpecEntry { unit_size: s.unit_size, unit_count: s.unit_count }).collect(),
            last_used: ARENA_ANY,
        };
        Ok(())
    }

    fn new_arena_header(&mut self, id: u32, r#type: u32) -> Result<ArenaHeader> {
        let addr = id as u64 * self.arena_size;
        let mut header = ArenaHeader::new(id, r#type as u16, self.arena_size as u32, ARENA_UNIT_SIZE_I32, addr, self.incarnation);
        if id == 0 {
            // Arena 0's first 128 KiB (superblock + root object) is
            // pre-reserved and never handed out (spec §3, §4.4).
            crate::bitmap::set_range(&mut header.group_bitmap, 0, crate::constants::ARENA0_RESERVED_SLICES as usize);
        }
        Ok(header)
    }

    /// Reserve a brand-new arena of `type` (spec §4.4's `NEW` selector).
    pub fn reserve_arena(&mut self, r#type: u32) -> Result<u32> {
        if self.header.arena_specs[r#type as usize].specs.is_empty() {
            return Err(AdError::NonExistent(format!("arena type {type} not registered")));
        }
        // `arena_bitmap`'s word count is rounded up to a multiple of 64 bits;
        // bound the search by the blob's real arena count instead, or an id
        // past `header.size` could be handed out and fail at the region
        // bounds check instead of returning `NoSpace`.
        let arena_count = (self.header.size / self.arena_size) as u32;
        let id = (0..arena_count)
            .find(|&i| {
                !crate::bitmap::is_set(&self.header.arena_bitmap, i as usize) && !self.reserved_arenas.contains(&i)
            })
            .ok_or_else(|| AdError::NoSpace("blob arena table is full".into()))?;

        self.reserved_arenas.insert(id);
        let header = self.new_arena_header(id, r#type)?;
        let arena = Arena::from_header(header);
        self.last_used[r#type as usize] = id;
        self.arenas.insert(id, Arc::new(Mutex::new(arena)));
        Ok(id)
    }

    /// Publish a reserved arena directly to the region (used only by
    /// `Blob::create` for arena 0, which is written synchronously with no
    /// WAL per spec §4.4; ordinary arena reservations are published through
    /// the transaction engine instead).
    pub fn publish_arena_sync(&mut self, id: u32) -> Result<()> {
        let arena = self.arena_handle(id)?;
        let arena = arena.lock();
        let mut buf = vec![0u8; ArenaHeader::encoded_len()];
        arena.header.write(&mut buf);
        drop(arena);
        let mut region = self.region.lock();
        region.write_at(id as u64 * self.arena_size, &buf)?;
        crate::bitmap::set_range(&mut self.header.arena_bitmap, id as usize, 1);
        self.reserved_arenas.remove(&id);
        Ok(())
    }

    pub fn arena_handle(&self, id: u32) -> Result<Arc<Mutex<Arena>>> {
        self.arenas.get(&id).cloned().ok_or_else(|| AdError::NonExistent(format!("arena {id} not loaded")))
    }

    fn group_spec_for(&self, r#type: u32, size: u64) -> Result<GroupSpec> {
        let table = &self.header.arena_specs[r#type as usize].specs;
        let entry = table
            .iter()
            .filter(|e| e.unit_size as u64 >= size)
            .min_by_key(|e| e.unit_size)
            .ok_or_else(|| AdError::Invalid(format!("no group spec fits size {size} for type {type}")))?;
        Ok(GroupSpec { unit_size: entry.unit_size, unit_count: entry.unit_count })
    }

    /// Default arena type for an allocation of `size` bytes (spec §4.6).
    pub fn arena_type_for_size(size: u64) -> u32 {
        if size > LARGE_ALLOC_THRESHOLD {
            ARENA_TYPE_LARGE
        } else {
            ARENA_TYPE_DEF
        }
    }

    /// Try reserving `size` bytes, attempting `LAST_USED` → `REUSE` → `NEW`
    /// in order (spec §4.4).
    pub fn reserve_space(&mut self, r#type: u32, size: u64) -> Result<(u32, usize, usize, u64)> {
        let spec = self.group_spec_for(r#type, size)?;

        let candidates = [self.last_used[r#type as usize], self.heap_root_candidate()].into_iter();
        for id in candidates {
            if id == ARENA_ANY {
                continue;
            }
            if let Ok(result) = self.try_reserve_in_arena(id, spec) {
                return Ok(result);
            }
        }

        let id = self.reserve_arena(r#type)?;
        self.try_reserve_in_arena(id, spec)
    }

    fn heap_root_candidate(&mut self) -> u32 {
        self.heap.peek_root().unwrap_or(ARENA_ANY)
    }

    fn try_reserve_in_arena(&mut self, id: u32, spec: GroupSpec) -> Result<(u32, usize, usize, u64)> {
        let handle = self.arena_handle(id)?;
        let mut arena = handle.lock();
        let group_idx = match arena.find_group_with_space(spec) {
            Some(idx) => idx,
            None => {
                let idx = arena.reserve_new_group(spec, arena.header.addr)?;
                idx
            }
        };
        let record = arena.header.groups[group_idx];
        let (bit, addr) = crate::dram::group::reserve_addr(&record, &mut arena.group_dram[group_idx])
            .ok_or_else(|| AdError::NoSpace(format!("group {group_idx} in arena {id} is full")))?;
        drop(arena);
        self.last_used[Self::arena_type_for_size(spec.unit_size as u64) as usize] = id;
        Ok((id, group_idx, bit, addr))
    }

    pub fn arena_count_bits(&self) -> usize {
        self.header.arena_bitmap.len() * 64
    }

    /// Locate the published arena that owns `addr` (used by `umem::free`,
    /// which only carries an offset — spec §4.6).
    pub fn find_arena_for_addr(&self, addr: u64) -> Result<u32> {
        let id = (addr / self.arena_size) as u32;
        if !crate::bitmap::is_set(&self.header.arena_bitmap, id as usize) {
            return Err(AdError::NonExistent(format!("no published arena owns addr {addr:#x}")));
        }
        Ok(id)
    }

    /// The 32 KiB application root object at `arena0 + ROOT_OBJ_OFF` (spec
    /// §3, §6). `len` must not exceed [`ROOT_OBJ_SIZE`]; the caller supplies
    /// it as the size check spec §6 calls for.
    pub fn root(&self, len: usize) -> Result<Vec<u8>> {
        if len as u64 > ROOT_OBJ_SIZE {
            return Err(AdError::Invalid(format!("root object read of {len} exceeds {ROOT_OBJ_SIZE}")));
        }
        let region = self.region.lock();
        Ok(region.read_at(ROOT_OBJ_OFF, len)?.to_vec())
    }

    pub fn root_addr(&self) -> u64 {
        ROOT_OBJ_OFF
    }

    /// `addr2ptr`/`ptr2addr`: the original bridges a DRAM pointer and an
    /// on-medium offset through `back_ptr`; this port addresses the backing
    /// region directly as a flat byte offset everywhere, so both directions
    /// collapse to the identity function. Kept named for parity with the
    /// round-trip invariant `ptr2addr(addr2ptr(x)) == x`.
    pub fn addr2ptr(&self, addr: u64) -> u64 {
        addr
    }

    pub fn ptr2addr(&self, ptr: u64) -> u64 {
        ptr
    }
}

const ARENA_UNIT_SIZE_I32: i32 = crate::constants::ARENA_UNIT_SIZE as i32;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use std::sync::Arc;

    fn new_dummy_blob(size: u64) -> Blob {
        let region: SharedRegion = Arc::new(Mutex::new(Region::create_dummy(size)));
        let store = Arc::new(crate::store::MemStore::new(region.clone()));
        Blob::create(region, store, &BlobConfig::dummy(size)).unwrap()
    }

    #[test]
    fn create_reserves_arena_zero() {
        let blob = new_dummy_blob(384 * 1024 * 1024);
        assert!(crate::bitmap::is_set(&blob.header.arena_bitmap, 0));
        assert!(blob.arenas.contains_key(&0));
    }

    #[test]
    fn reserve_space_returns_address_within_arena_zero() {
        let mut blob = new_dummy_blob(384 * 1024 * 1024);
        let (arena_id, _grp, _bit, addr) = blob.reserve_space(ARENA_TYPE_DEF, 64).unwrap();
        assert_eq!(arena_id, 0);
        assert!(addr >= ARENA_HDR_SIZE + BLOB_HDR_SIZE + crate::constants::ROOT_OBJ_SIZE);
    }
}
