//! Bit-exact, little-endian on-medium structs (spec §6).
//!
//! These are plain Rust structs with explicit `read_from`/`write_to` byte
//! accessors rather than `#[repr(C)]` pointer overlays: the backing region is
//! a raw byte slice of a memory map whose alignment we cannot guarantee for
//! every field, so encoding/decoding through `from_le_bytes`/`to_le_bytes`
//! keeps every access safe.

use crate::constants::{
    ARENA_GRP_MAX, ARENA_GRP_SPEC_MAX, ARENA_SPEC_MAX, GRP_UNIT_BMSZ, GROUP_RECORD_SIZE,
};

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}
fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}
fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn get_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}
fn put_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}
fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
fn get_bitmap(buf: &[u8], off: usize, words: &mut [u64]) {
    for (i, w) in words.iter_mut().enumerate() {
        *w = get_u64(buf, off + i * 8);
    }
}
fn put_bitmap(buf: &mut [u8], off: usize, words: &[u64]) {
    for (i, &w) in words.iter().enumerate() {
        put_u64(buf, off + i * 8, w);
    }
}

/// One `{unit_size, unit_count}` entry within an [`ArenaTypeSpec`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupSpecEntry {
    pub unit_size: u32,
    pub unit_count: u32,
}

impl GroupSpecEntry {
    const SIZE: usize = 8;

    fn read(buf: &[u8], off: usize) -> Self {
        GroupSpecEntry { unit_size: get_u32(buf, off), unit_count: get_u32(buf, off + 4) }
    }
    fn write(&self, buf: &mut [u8], off: usize) {
        put_u32(buf, off, self.unit_size);
        put_u32(buf, off + 4, self.unit_count);
    }
}

/// One registered arena type: its group-spec table plus the last-used arena id.
#[derive(Debug, Clone)]
pub struct ArenaTypeSpec {
    pub specs: Vec<GroupSpecEntry>,
    pub last_used: u32,
}

impl ArenaTypeSpec {
    const SIZE: usize = ARENA_GRP_SPEC_MAX * GroupSpecEntry::SIZE + 8 /* specs_nr */ + 4 /* last_used */;

    fn empty() -> Self {
        ArenaTypeSpec { specs: Vec::new(), last_used: crate::constants::ARENA_ANY }
    }

    fn read(buf: &[u8], off: usize) -> Self {
        let specs_nr = get_u64(buf, off) as usize;
        let mut specs = Vec::with_capacity(specs_nr.min(ARENA_GRP_SPEC_MAX));
        for i in 0..specs_nr.min(ARENA_GRP_SPEC_MAX) {
            specs.push(GroupSpecEntry::read(buf, off + 8 + i * GroupSpecEntry::SIZE));
        }
        let last_used = get_u32(buf, off + 8 + ARENA_GRP_SPEC_MAX * GroupSpecEntry::SIZE);
        ArenaTypeSpec { specs, last_used }
    }

    fn write(&self, buf: &mut [u8], off: usize) {
        put_u64(buf, off, self.specs.len() as u64);
        for (i, spec) in self.specs.iter().enumerate() {
            spec.write(buf, off + 8 + i * GroupSpecEntry::SIZE);
        }
        put_u32(buf, off + 8 + ARENA_GRP_SPEC_MAX * GroupSpecEntry::SIZE, self.last_used);
    }
}

/// Blob superblock (spec §3, §6). Lives at `arena0 + ARENA_HDR_SIZE`.
#[derive(Debug, Clone)]
pub struct BlobHeader {
    pub magic: u32,
    pub version: u32,
    pub incarnation: u64,
    pub back_ptr: u64,
    pub size: u64,
    pub arena_size: u64,
    pub arena_specs: Vec<ArenaTypeSpec>,
    pub arena_bitmap: Vec<u64>,
}

impl BlobHeader {
    const FIXED_SIZE: usize = 4 + 4 + 8 + 8 + 8 + 8;
    const SPECS_OFF: usize = Self::FIXED_SIZE;
    const SPECS_SIZE: usize = ARENA_SPEC_MAX * ArenaTypeSpec::SIZE;
    const RESERVED_SIZE: usize = 4 * 8;

    fn bitmap_off(arena_bitmap_words: usize) -> usize {
        let _ = arena_bitmap_words;
        Self::SPECS_OFF + Self::SPECS_SIZE + Self::RESERVED_SIZE
    }

    pub fn new(size: u64, arena_size: u64, incarnation: u64, arena_bitmap_words: usize) -> Self {
        BlobHeader {
            magic: crate::constants::BLOB_MAGIC,
            version: crate::constants::AD_MEM_VERSION,
            incarnation,
            back_ptr: 0,
            size,
            arena_size,
            arena_specs: (0..ARENA_SPEC_MAX).map(|_| ArenaTypeSpec::empty()).collect(),
            arena_bitmap: vec![0u64; arena_bitmap_words],
        }
    }

    pub fn read(buf: &[u8], arena_bitmap_words: usize) -> Self {
        let magic = get_u32(buf, 0);
        let version = get_u32(buf, 4);
        let incarnation = get_u64(buf, 8);
        let back_ptr = get_u64(buf, 16);
        let size = get_u64(buf, 24);
        let arena_size = get_u64(buf, 32);
        let mut arena_specs = Vec::with_capacity(ARENA_SPEC_MAX);
        for i in 0..ARENA_SPEC_MAX {
            arena_specs.push(ArenaTypeSpec::read(buf, Self::SPECS_OFF + i * ArenaTypeSpec::SIZE));
        }
        let mut arena_bitmap = vec![0u64; arena_bitmap_words];
        get_bitmap(buf, Self::bitmap_off(arena_bitmap_words), &mut arena_bitmap);
        BlobHeader { magic, version, incarnation, back_ptr, size, arena_size, arena_specs, arena_bitmap }
    }

    pub fn write(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.magic);
        put_u32(buf, 4, self.version);
        put_u64(buf, 8, self.incarnation);
        put_u64(buf, 16, self.back_ptr);
        put_u64(buf, 24, self.size);
        put_u64(buf, 32, self.arena_size);
        for (i, spec) in self.arena_specs.iter().enumerate() {
            spec.write(buf, Self::SPECS_OFF + i * ArenaTypeSpec::SIZE);
        }
        put_bitmap(buf, Self::bitmap_off(self.arena_bitmap.len()), &self.arena_bitmap);
    }

    pub fn encoded_len(arena_bitmap_words: usize) -> usize {
        Self::bitmap_off(arena_bitmap_words) + arena_bitmap_words * 8
    }
}

/// Durable group record, exactly 128 bytes (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct GroupRecord {
    pub addr: u64,
    pub addr_real: u64,
    pub back_ptr: u64,
    pub incarnation: u64,
    pub unit: i32,
    pub unit_count: i32,
    pub unit_free: i32,
    pub flags: u32,
    pub unit_bitmap: [u64; GRP_UNIT_BMSZ],
}

impl Default for GroupRecord {
    fn default() -> Self {
        GroupRecord {
            addr: 0,
            addr_real: 0,
            back_ptr: 0,
            incarnation: 0,
            unit: 0,
            unit_count: 0,
            unit_free: 0,
            flags: 0,
            unit_bitmap: [0; GRP_UNIT_BMSZ],
        }
    }
}

impl GroupRecord {
    pub const SIZE: usize = GROUP_RECORD_SIZE;

    pub fn read(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= Self::SIZE);
        let mut unit_bitmap = [0u64; GRP_UNIT_BMSZ];
        get_bitmap(buf, 64, &mut unit_bitmap);
        GroupRecord {
            addr: get_u64(buf, 0),
            addr_real: get_u64(buf, 8),
            back_ptr: get_u64(buf, 16),
            incarnation: get_u64(buf, 24),
            unit: get_i32(buf, 32),
            unit_count: get_i32(buf, 36),
            unit_free: get_i32(buf, 40),
            flags: get_u32(buf, 44),
            unit_bitmap,
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= Self::SIZE);
        put_u64(buf, 0, self.addr);
        put_u64(buf, 8, self.addr_real);
        put_u64(buf, 16, self.back_ptr);
        put_u64(buf, 24, self.incarnation);
        put_i32(buf, 32, self.unit);
        put_i32(buf, 36, self.unit_count);
        put_i32(buf, 40, self.unit_free);
        put_u32(buf, 44, self.flags);
        // bytes 48..64 are the two reserved u64 fields, left zeroed.
        put_u64(buf, 48, 0);
        put_u64(buf, 56, 0);
        put_bitmap(buf, 64, &self.unit_bitmap);
    }

    pub fn is_free_slot(&self) -> bool {
        self.addr == 0
    }
}

const _: () = assert!(GroupRecord::SIZE == 128);

/// Durable arena header, 64 KiB total including the embedded group records
/// (spec §6). `group_records_off` is the first byte past the fixed header
/// fields; the remainder up to `ARENA_HDR_SIZE` holds `ARENA_GRP_MAX` dense
/// [`GroupRecord`]s followed by unused padding.
#[derive(Debug, Clone)]
pub struct ArenaHeader {
    pub magic: u16,
    pub r#type: u16,
    pub id: u32,
    pub size: u32,
    pub unit: i32,
    pub incarnation: u64,
    pub blob_id: u64,
    pub addr: u64,
    pub group_bitmap: [u64; GRP_UNIT_BMSZ],
    pub back_ptr: u64,
    pub groups: Vec<GroupRecord>,
}

impl ArenaHeader {
    // magic(2) type(2) id(4) size(4) unit(4) pad(8) incarnation(8) blob_id(8)
    // addr(8) reserved(16) group_bitmap(64) back_ptr(8)
    pub const FIXED_SIZE: usize = 2 + 2 + 4 + 4 + 4 + 8 + 8 + 8 + 8 + 16 + 64 + 8;
    pub const GROUPS_OFF: usize = Self::FIXED_SIZE;
    pub const GROUP_BITMAP_OFF: usize = 64;

    pub fn new(id: u32, r#type: u16, size: u32, unit: i32, addr: u64, incarnation: u64) -> Self {
        let mut group_bitmap = [0u64; GRP_UNIT_BMSZ];
        // Pre-mark slices beyond this arena's actual extent as permanently
        // used. A no-op at the production arena size (512 slices exactly
        // fill 16 MiB); it keeps `find_bits` from handing out space past a
        // `BlobConfig::arena_size` override shrunk for tests.
        let usable_slices = (size as u64 / crate::constants::ARENA_UNIT_SIZE) as usize;
        let total_slices = GRP_UNIT_BMSZ * 64;
        if usable_slices < total_slices {
            crate::bitmap::set_range(&mut group_bitmap, usable_slices, total_slices - usable_slices);
        }
        ArenaHeader {
            magic: crate::constants::ARENA_MAGIC,
            r#type,
            id,
            size,
            unit,
            incarnation,
            blob_id: 0,
            addr,
            group_bitmap,
            back_ptr: 0,
            groups: vec![GroupRecord::default(); ARENA_GRP_MAX],
        }
    }

    pub fn read(buf: &[u8]) -> Self {
        let magic = get_u16(buf, 0);
        let r#type = get_u16(buf, 2);
        let id = get_u32(buf, 4);
        let size = get_u32(buf, 8);
        let unit = get_i32(buf, 12);
        let incarnation = get_u64(buf, 24);
        let blob_id = get_u64(buf, 32);
        let addr = get_u64(buf, 40);
        let mut group_bitmap = [0u64; GRP_UNIT_BMSZ];
        get_bitmap(buf, 64, &mut group_bitmap);
        let back_ptr = get_u64(buf, 128);
        let mut groups = Vec::with_capacity(ARENA_GRP_MAX);
        for i in 0..ARENA_GRP_MAX {
            let off = Self::GROUPS_OFF + i * GroupRecord::SIZE;
            groups.push(GroupRecord::read(&buf[off..off + GroupRecord::SIZE]));
        }
        ArenaHeader { magic, r#type, id, size, unit, incarnation, blob_id, addr, group_bitmap, back_ptr, groups }
    }

    pub fn write(&self, buf: &mut [u8]) {
        put_u16(buf, 0, self.magic);
        put_u16(buf, 2, self.r#type);
        put_u32(buf, 4, self.id);
        put_u32(buf, 8, self.size);
        put_i32(buf, 12, self.unit);
        put_u64(buf, 16, 0); // _pad
        put_u64(buf, 24, self.incarnation);
        put_u64(buf, 32, self.blob_id);
        put_u64(buf, 40, self.addr);
        put_u64(buf, 48, 0);
        put_u64(buf, 56, 0);
        put_bitmap(buf, 64, &self.group_bitmap);
        put_u64(buf, 128, self.back_ptr);
        for (i, group) in self.groups.iter().enumerate() {
            let off = Self::GROUPS_OFF + i * GroupRecord::SIZE;
            group.write(&mut buf[off..off + GroupRecord::SIZE]);
        }
    }

    pub fn encoded_len() -> usize {
        Self::GROUPS_OFF + ARENA_GRP_MAX * GroupRecord::SIZE
    }
}

const _: () = assert!(ArenaHeader::encoded_len() as u64 <= crate::constants::ARENA_HDR_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_record_roundtrips() {
        let mut rec = GroupRecord { addr: 12345, unit: 64, unit_count: 10, unit_free: 9, ..Default::default() };
        rec.unit_bitmap[0] = 0b1;
        let mut buf = [0u8; GroupRecord::SIZE];
        rec.write(&mut buf);
        let back = GroupRecord::read(&buf);
        assert_eq!(back.addr, 12345);
        assert_eq!(back.unit, 64);
        assert_eq!(back.unit_bitmap[0], 1);
    }

    #[test]
    fn arena_header_roundtrips() {
        let mut ah = ArenaHeader::new(3, crate::constants::ARENA_TYPE_DEF as u16, 0, 32768, 0x1000, 42);
        ah.groups[0].addr = 999;
        let mut buf = vec![0u8; ArenaHeader::encoded_len()];
        ah.write(&mut buf);
        let back = ArenaHeader::read(&buf);
        assert_eq!(back.id, 3);
        assert_eq!(back.incarnation, 42);
        assert_eq!(back.groups[0].addr, 999);
    }

    #[test]
    fn blob_header_roundtrips() {
        let bh = BlobHeader::new(1 << 30, crate::constants::ARENA_SIZE, 7, 4);
        let mut buf = vec![0u8; BlobHeader::encoded_len(4)];
        bh.write(&mut buf);
        let back = BlobHeader::read(&buf, 4);
        assert_eq!(back.magic, crate::constants::BLOB_MAGIC);
        assert_eq!(back.incarnation, 7);
        assert_eq!(back.arena_specs.len(), ARENA_SPEC_MAX);
    }
}
