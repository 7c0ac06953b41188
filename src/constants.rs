//! Normative constants from spec §3 and §6. All sizes are in bytes unless
//! noted. Kept as a single module so every size relationship (e.g.
//! `ARENA_UNIT_SIZE == BLOB_HDR_SIZE`) is checked once, here, at compile time.

/// Size of one arena: 16 MiB.
pub const ARENA_SIZE_BITS: u32 = 24;
pub const ARENA_SIZE: u64 = 1 << ARENA_SIZE_BITS;
pub const ARENA_SIZE_MASK: u64 = ARENA_SIZE - 1;

/// Header reserved at the start of every arena.
pub const ARENA_HDR_SIZE: u64 = 64 * 1024;
/// Minimum group size / arena bookkeeping granularity.
pub const ARENA_UNIT_SIZE: u64 = 32 * 1024;
/// Blob superblock size, stored right after arena 0's header.
pub const BLOB_HDR_SIZE: u64 = 32 * 1024;
/// Root object exported to the application via `root()`.
pub const ROOT_OBJ_SIZE: u64 = 32 * 1024;
pub const ROOT_OBJ_OFF: u64 = ARENA_HDR_SIZE + BLOB_HDR_SIZE;

const _: () = assert!(ARENA_UNIT_SIZE == BLOB_HDR_SIZE);

/// Minimum group size is `1 << GRP_SIZE_SHIFT` = 32 KiB.
pub const GRP_SIZE_SHIFT: u32 = 15;
/// Words (u64) in a group's unit bitmap: 512 bits.
pub const GRP_UNIT_BMSZ: usize = 8;
pub const GRP_UNIT_SZ_MAX: u64 = 1 << 20;
pub const GRP_UNIT_NR_MAX: u32 = 1 << 20;

/// Group records per arena (bounds metadata overhead to ~0.4% of arena size).
pub const ARENA_GRP_MAX: usize = 480;
/// Typical/average number of groups loaded per arena on reload.
pub const ARENA_GRP_AVG: usize = 256;
/// Registered arena types per blob.
pub const ARENA_SPEC_MAX: usize = 32;
/// Group specs per arena type.
pub const ARENA_GRP_SPEC_MAX: usize = 24;

pub const ARENA_MAGIC: u16 = 0xcafe;
pub const BLOB_MAGIC: u32 = 0xbabecafe;
pub const AD_MEM_VERSION: u32 = 1;

pub const ARENA_LRU_MAX: usize = 65_536;
pub const GROUP_LRU_MAX: usize = 524_288;

pub const WEIGHT_SHIFT: u32 = 14;
pub const WEIGHT_MASK: u64 = (1 << WEIGHT_SHIFT) - 1;

/// Arena bits reserved for arena 0's header/superblock/root object.
pub const ARENA0_RESERVED_SLICES: u32 = 4;

/// Predefined arena types (spec §3).
pub const ARENA_TYPE_DEF: u32 = 0;
pub const ARENA_TYPE_LARGE: u32 = 1;

/// Sentinel meaning "any arena id" / "no arena id yet".
pub const ARENA_ANY: u32 = u32::MAX;

/// One `{unit_size, unit_count}` entry in an arena type's spec table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpec {
    pub unit_size: u32,
    pub unit_count: u32,
}

/// Default arena type: small units, 64 B .. 4 KiB.
pub const GRP_SPECS_DEF: &[GroupSpec] = &[
    GroupSpec { unit_size: 64, unit_count: 4096 },
    GroupSpec { unit_size: 128, unit_count: 2048 },
    GroupSpec { unit_size: 256, unit_count: 1024 },
    GroupSpec { unit_size: 512, unit_count: 512 },
    GroupSpec { unit_size: 1024, unit_count: 256 },
    GroupSpec { unit_size: 2048, unit_count: 128 },
    GroupSpec { unit_size: 4096, unit_count: 64 },
];

/// `LARGE` arena type: 8 KiB .. 1 MiB.
pub const GRP_SPECS_LARGE: &[GroupSpec] = &[
    GroupSpec { unit_size: 8192, unit_count: 32 },
    GroupSpec { unit_size: 16384, unit_count: 16 },
    GroupSpec { unit_size: 32768, unit_count: 8 },
    GroupSpec { unit_size: 65536, unit_count: 4 },
    GroupSpec { unit_size: 131072, unit_count: 4 },
    GroupSpec { unit_size: 262144, unit_count: 2 },
    GroupSpec { unit_size: 524288, unit_count: 2 },
    GroupSpec { unit_size: 1048576, unit_count: 1 },
];

/// Threshold above which `alloc()` picks `ARENA_TYPE_LARGE` over the default type.
pub const LARGE_ALLOC_THRESHOLD: u64 = 4096;

const _: () = assert!(GRP_SPECS_DEF.len() <= ARENA_GRP_SPEC_MAX);
const _: () = assert!(GRP_SPECS_LARGE.len() <= ARENA_GRP_SPEC_MAX);

/// Group record size on the medium, exactly 128 bytes (spec §6).
pub const GROUP_RECORD_SIZE: usize = 128;
