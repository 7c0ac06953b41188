//! Per-group DRAM-only state and weight computation (spec §4.2).
//!
//! A group's durable record ([`crate::layout::GroupRecord`]) lives inside its
//! owning [`crate::dram::arena::Arena`]'s cached [`crate::layout::ArenaHeader`].
//! `GroupDram` is the DRAM-only half spec §3 calls out: the reservation
//! bitmap, reservation count, reference count and lifecycle state. The two
//! halves are always accessed together through `Arena` methods, which is
//! this crate's safe-Rust stand-in for the original's single aliased
//! `ad_group`/`ad_group_df` pair (see `DESIGN.md`).

use crate::constants::GRP_UNIT_BMSZ;
use crate::layout::GroupRecord;

/// Lifecycle state of a group (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Unpublished,
    Published,
    Resetting,
}

/// DRAM-only fields mirroring spec §3's "DRAM shadow (arena / group)".
#[derive(Debug, Clone)]
pub struct GroupDram {
    pub reserved_bitmap: [u64; GRP_UNIT_BMSZ],
    pub reserved_count: u32,
    pub ref_count: u32,
    pub state: GroupState,
}

impl GroupDram {
    pub fn new_published() -> Self {
        GroupDram {
            reserved_bitmap: [0u64; GRP_UNIT_BMSZ],
            reserved_count: 0,
            ref_count: 0,
            state: GroupState::Published,
        }
    }

    pub fn new_unpublished() -> Self {
        GroupDram { state: GroupState::Unpublished, ..Self::new_published() }
    }
}

/// Units available for new reservations: `unit_free - reserved_count`
/// (`group_unit_avail` in the original).
pub fn unit_avail(record: &GroupRecord, dram: &GroupDram) -> i64 {
    record.unit_free as i64 - dram.reserved_count as i64
}

/// Quantised weight, damping heap/sorter churn for busy groups (`group_weight`).
pub fn weight(record: &GroupRecord, dram: &GroupDram) -> i64 {
    let units = unit_avail(record, dram).max(0);
    let bits: u32 = if record.unit_count >= 128 {
        5
    } else if record.unit_count >= 32 {
        3
    } else if record.unit_count >= 8 {
        1
    } else {
        0
    };
    if bits == 0 {
        units
    } else {
        (units + (1 << bits) - 1) >> bits
    }
}

/// Reserve one free unit in `record`/`dram` (spec §4.2 `reserve_addr`).
/// Returns the reserved bit index and the unit's absolute address; does not
/// touch the durable `unit_bitmap` (that only happens on publish).
pub fn reserve_addr(record: &GroupRecord, dram: &mut GroupDram) -> Option<(usize, u64)> {
    let (bit, _len) = crate::bitmap::find_bits(
        &record.unit_bitmap,
        Some(&dram.reserved_bitmap),
        1,
        1,
    )?;
    crate::bitmap::set_range(&mut dram.reserved_bitmap, bit, 1);
    dram.reserved_count += 1;
    dram.ref_count += 1;
    let addr = record.addr + bit as u64 * record.unit as u64;
    Some((bit, addr))
}

/// Undo a reservation made by [`reserve_addr`] without publishing it.
pub fn cancel_reservation(dram: &mut GroupDram, bit: usize) {
    crate::bitmap::clr_range(&mut dram.reserved_bitmap, bit, 1);
    dram.reserved_count = dram.reserved_count.saturating_sub(1);
    dram.ref_count = dram.ref_count.saturating_sub(1);
}

/// Convert address to the bit within this group (callers must have already
/// located the owning group; see `Arena::find_group_by_addr`).
pub fn addr_to_bit(record: &GroupRecord, addr: u64) -> usize {
    ((addr - record.addr) / record.unit as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(unit: i32, unit_count: i32, unit_free: i32) -> GroupRecord {
        GroupRecord { addr: 0x1000, unit, unit_count, unit_free, ..Default::default() }
    }

    #[test]
    fn weight_shift_thresholds() {
        let dram = GroupDram::new_published();
        assert_eq!(weight(&rec(64, 4, 4), &dram), 4); // < 8 units: no shift
        assert_eq!(weight(&rec(64, 16, 16), &dram), 8); // 8..32: >>1, ceil(16/2)
        assert_eq!(weight(&rec(64, 64, 64), &dram), 8); // 32..128: >>3, ceil(64/8)
        assert_eq!(weight(&rec(64, 256, 256), &dram), 8); // >=128: >>5, ceil(256/32)
    }

    #[test]
    fn reserve_then_cancel_is_deterministic() {
        let record = rec(64, 16, 16);
        let mut dram = GroupDram::new_published();
        let (bit1, addr1) = reserve_addr(&record, &mut dram).unwrap();
        cancel_reservation(&mut dram, bit1);
        let (bit2, addr2) = reserve_addr(&record, &mut dram).unwrap();
        assert_eq!(bit1, bit2);
        assert_eq!(addr1, addr2);
    }
}
