//! Arena DRAM cache: sorters, reservation bitmaps, group lookup (spec §4.3).

use crate::constants::{
    ARENA_GRP_MAX, ARENA_UNIT_SIZE, GRP_SIZE_SHIFT, GRP_UNIT_BMSZ, GroupSpec,
};
use crate::dram::group::{self, GroupDram, GroupState};
use crate::error::{AdError, Result};
use crate::layout::{ArenaHeader, GroupRecord};

/// Number of 32 KiB slices a group of `unit_size * unit_count` bytes needs.
pub fn group_u2b(unit_size: u32, unit_count: u32) -> usize {
    let bytes = unit_size as u64 * unit_count as u64;
    ((bytes + (ARENA_UNIT_SIZE - 1)) >> GRP_SIZE_SHIFT) as usize
}

/// An arena's DRAM cache: the parsed durable header plus DRAM-only group
/// state, two sorted index arrays over published groups, and the
/// weight/space bookkeeping the blob-level heap reads.
pub struct Arena {
    pub header: ArenaHeader,
    pub group_dram: Vec<GroupDram>,
    /// Indices into `header.groups`/`group_dram`, published groups only,
    /// ordered by `(unit_size asc, weight asc, addr asc)`.
    pub size_sorter: Vec<usize>,
    /// Same index space, ordered by `addr asc`.
    pub addr_sorter: Vec<usize>,
    /// DRAM-only reservation bitmap over `header.group_bitmap`'s slices,
    /// marking slices claimed by an in-flight (unpublished) group.
    pub space_reserved: [u64; GRP_UNIT_BMSZ],
    /// DRAM-only bitmap over `groups[]` slot indices claimed by an
    /// in-flight group record allocation.
    pub slot_reserved: [bool; ARENA_GRP_MAX],
    pub ref_count: u32,
    pub inactive: bool,
    pub free_size: i64,
    pub frag_size: i64,
    pub unpublished: bool,
}

impl Arena {
    pub fn from_header(header: ArenaHeader) -> Self {
        let group_dram: Vec<GroupDram> = header
            .groups
            .iter()
            .map(|g| if g.is_free_slot() { GroupDram::new_unpublished() } else { GroupDram::new_published() })
            .collect();

        let mut arena = Arena {
            header,
            group_dram,
            size_sorter: Vec::new(),
            addr_sorter: Vec::new(),
            space_reserved: [0u64; GRP_UNIT_BMSZ],
            slot_reserved: [false; ARENA_GRP_MAX],
            ref_count: 0,
            inactive: false,
            free_size: 0,
            frag_size: 0,
            unpublished: false,
        };
        arena.rebuild_sorters();
        arena.recompute_space();
        arena
    }

    fn rebuild_sorters(&mut self) {
        let published: Vec<usize> = (0..self.header.groups.len())
            .filter(|&i| !self.header.groups[i].is_free_slot())
            .collect();
        self.size_sorter = published.clone();
        self.addr_sorter = published;
        self.size_sorter.sort_by(|&a, &b| self.size_sort_key(a).cmp(&self.size_sort_key(b)));
        self.addr_sorter.sort_by_key(|&i| self.header.groups[i].addr);
    }

    fn size_sort_key(&self, idx: usize) -> (u32, i64, u64) {
        let rec = &self.header.groups[idx];
        let w = group::weight(rec, &self.group_dram[idx]);
        (rec.unit as u32, w, rec.addr)
    }

    fn recompute_space(&mut self) {
        let mut free = 0i64;
        let mut frag = 0i64;
        for idx in &self.size_sorter {
            let rec = &self.header.groups[*idx];
            let dram = &self.group_dram[*idx];
            free += group::unit_avail(rec, dram).max(0) * rec.unit as i64;
            let used_slices = group_u2b(rec.unit as u32, rec.unit_count as u32) as i64 * ARENA_UNIT_SIZE as i64;
            let payload = rec.unit as i64 * rec.unit_count as i64;
            frag += (used_slices - payload).max(0);
        }
        self.free_size = free;
        self.frag_size = frag;
    }

    pub fn weight(&self) -> i64 {
        // Arena-level weight proxy (spec §3): shifted free-minus-frag bytes.
        ((self.free_size - self.frag_size).max(0) + crate::constants::WEIGHT_MASK as i64)
            >> crate::constants::WEIGHT_SHIFT
    }

    /// Locate a published group whose `unit_size` matches the spec's and
    /// which has spare capacity, scanning the size-sorter starting from the
    /// first group at that unit size (spec §4.3 step 2).
    pub fn find_group_with_space(&self, spec: GroupSpec) -> Option<usize> {
        let start = self.size_sorter.partition_point(|&idx| (self.header.groups[idx].unit as u32) < spec.unit_size);
        for &idx in &self.size_sorter[start..] {
            let rec = &self.header.groups[idx];
            if rec.unit as u32 != spec.unit_size {
                break;
            }
            if group::weight(rec, &self.group_dram[idx]) > 0 {
                return Some(idx);
            }
        }
        None
    }

    /// Binary search the address-sorter for the group containing `addr`.
    pub fn find_group_by_addr(&self, addr: u64) -> Result<usize> {
        let pos = self
            .addr_sorter
            .partition_point(|&idx| self.header.groups[idx].addr <= addr);
        if pos == 0 {
            return Err(AdError::NonExistent(format!("no group contains addr {addr:#x}")));
        }
        let idx = self.addr_sorter[pos - 1];
        let rec = &self.header.groups[idx];
        let span = rec.unit as u64 * rec.unit_count as u64;
        if addr >= rec.addr && addr < rec.addr + span {
            Ok(idx)
        } else {
            Err(AdError::NonExistent(format!("no group contains addr {addr:#x}")))
        }
    }

    /// Reserve a fresh group record for `spec`: claims slices in
    /// `group_bitmap`/`space_reserved` and a free slot in `groups[]`, fills
    /// in the durable fields (not yet written through to the region — the
    /// caller publishes via the transaction), and inserts it into both
    /// sorters as `Unpublished`.
    pub fn reserve_new_group(&mut self, spec: GroupSpec, blob_addr_base: u64) -> Result<usize> {
        let bits_wanted = group_u2b(spec.unit_size, spec.unit_count);
        let bits_min = bits_wanted.min(((2 * spec.unit_size as u64) >> GRP_SIZE_SHIFT) as usize).max(1);
        let (at, found) = crate::bitmap::find_bits(
            &self.header.group_bitmap,
            Some(&self.space_reserved),
            bits_min,
            bits_wanted,
        )
        .ok_or_else(|| AdError::NoSpace("no contiguous slice run for new group".into()))?;

        let slot = (0..self.header.groups.len())
            .find(|&i| self.header.groups[i].is_free_slot() && !self.slot_reserved[i])
            .ok_or_else(|| AdError::NoSpace("arena group table is full".into()))?;

        crate::bitmap::set_range(&mut self.space_reserved, at, found);
        self.slot_reserved[slot] = true;

        let unit_count = ((found as u64 * ARENA_UNIT_SIZE) / spec.unit_size as u64).min(spec.unit_count as u64) as i32;
        self.header.groups[slot] = GroupRecord {
            addr: blob_addr_base + at as u64 * ARENA_UNIT_SIZE,
            addr_real: blob_addr_base + at as u64 * ARENA_UNIT_SIZE,
            unit: spec.unit_size as i32,
            unit_count,
            unit_free: unit_count,
            ..Default::default()
        };
        self.group_dram[slot] = GroupDram::new_unpublished();

        self.insert_into_sorters(slot);
        Ok(slot)
    }

    fn insert_into_sorters(&mut self, idx: usize) {
        let key = self.size_sort_key(idx);
        let pos = self.size_sorter.partition_point(|&i| self.size_sort_key(i) < key);
        self.size_sorter.insert(pos, idx);
        let addr = self.header.groups[idx].addr;
        let pos = self.addr_sorter.partition_point(|&i| self.header.groups[i].addr < addr);
        self.addr_sorter.insert(pos, idx);
    }

    fn remove_from_sorters(&mut self, idx: usize) {
        self.size_sorter.retain(|&i| i != idx);
        self.addr_sorter.retain(|&i| i != idx);
    }

    /// Byte offset (in bits, within `group_bitmap`) and length of the slice
    /// run group `idx` occupies. Shared by `mark_group_published` and the
    /// transaction engine's durable write-through on publish.
    pub fn group_slice_range(&self, idx: usize) -> (usize, usize) {
        let bits = group_u2b(self.header.groups[idx].unit as u32, self.header.groups[idx].unit_count as u32);
        let at = ((self.header.groups[idx].addr - self.header.addr) >> GRP_SIZE_SHIFT) as usize;
        (at, bits)
    }

    pub fn is_group_unpublished(&self, idx: usize) -> bool {
        self.group_dram[idx].state == GroupState::Unpublished
    }

    /// Mark a reserved group record published: clears its slot/space
    /// reservation and leaves it permanently in the sorters as `Published`.
    pub fn mark_group_published(&mut self, idx: usize) {
        self.group_dram[idx].state = GroupState::Published;
        self.slot_reserved[idx] = false;
        let (at, bits) = self.group_slice_range(idx);
        crate::bitmap::clr_range(&mut self.space_reserved, at, bits);
        crate::bitmap::set_range(&mut self.header.group_bitmap, at, bits);
    }

    /// Re-seat `idx` in the size-sorter after its weight changed, by local
    /// shift only (spec §4.3's key invariant — never a full re-sort).
    pub fn reposition_in_size_sorter(&mut self, idx: usize) {
        let pos = match self.size_sorter.iter().position(|&i| i == idx) {
            Some(p) => p,
            None => return,
        };
        let key = self.size_sort_key(idx);
        // Shift left while the left neighbour now sorts after us.
        let mut p = pos;
        while p > 0 && self.size_sort_key(self.size_sorter[p - 1]) > key {
            self.size_sorter.swap(p, p - 1);
            p -= 1;
        }
        // Shift right while the right neighbour now sorts before us.
        while p + 1 < self.size_sorter.len() && self.size_sort_key(self.size_sorter[p + 1]) < key {
            self.size_sorter.swap(p, p + 1);
            p += 1;
        }
    }

    pub fn refresh_weight(&mut self, idx: usize) {
        self.reposition_in_size_sorter(idx);
        self.recompute_space();
    }

    /// Remove an emptied published group and return its slices/slot to the
    /// free pool (the `pending_group_resets` path, spec §9 — retained but
    /// never invoked by the transaction engine today; see DESIGN.md).
    #[allow(dead_code)]
    pub fn reset_group(&mut self, idx: usize) {
        self.remove_from_sorters(idx);
        let bits = group_u2b(self.header.groups[idx].unit as u32, self.header.groups[idx].unit_count as u32);
        let at = ((self.header.groups[idx].addr - self.header.addr) >> GRP_SIZE_SHIFT) as usize;
        crate::bitmap::clr_range(&mut self.header.group_bitmap, at, bits);
        self.header.groups[idx] = GroupRecord::default();
        self.group_dram[idx] = GroupDram::new_unpublished();
    }

    /// ¼-arena-size hysteresis reactivation threshold (spec §4.3).
    pub fn maybe_reactivate(&mut self, arena_size: u64) {
        if self.inactive && self.free_size as u64 > arena_size / 4 {
            self.inactive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ARENA_TYPE_DEF;

    fn fresh_arena(id: u32) -> Arena {
        let header = ArenaHeader::new(id, ARENA_TYPE_DEF as u16, crate::constants::ARENA_SIZE as u32, ARENA_UNIT_SIZE as i32, id as u64 * crate::constants::ARENA_SIZE, 1);
        Arena::from_header(header)
    }

    #[test]
    fn reserve_new_group_then_find_with_space() {
        let mut arena = fresh_arena(0);
        let spec = GroupSpec { unit_size: 64, unit_count: 4096 };
        let idx = arena.reserve_new_group(spec, arena.header.addr).unwrap();
        arena.mark_group_published(idx);
        assert!(arena.find_group_with_space(spec).is_some());
    }

    #[test]
    fn addr_sorter_locates_containing_group() {
        let mut arena = fresh_arena(0);
        let spec = GroupSpec { unit_size: 64, unit_count: 4096 };
        let idx = arena.reserve_new_group(spec, arena.header.addr).unwrap();
        arena.mark_group_published(idx);
        let addr = arena.header.groups[idx].addr + 10 * 64;
        assert_eq!(arena.find_group_by_addr(addr).unwrap(), idx);
    }

    #[test]
    fn group_u2b_rounds_up_to_slices() {
        assert_eq!(group_u2b(64, 4096), 8); // 256 KiB / 32 KiB
        assert_eq!(group_u2b(1, 1), 1);
    }
}
