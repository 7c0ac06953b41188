//! Writable, persistent backing region for a blob.
//!
//! Grounded on the teacher's `MmapWriter`/`ThreadSafeMmap` (mmap a file,
//! `flush`, `resize` by re-mmapping after `set_len`) generalized to also
//! support an in-memory "dummy blob" (spec §3 Design Notes, DAOS's
//! `DUMMY_BLOB` special-cased path) used by this crate's own tests.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::instrument;

use crate::error::{AdError, Result};

/// A [`Region`] shared between the [`crate::dram::blob::Blob`]'s live image
/// and its [`crate::store::Store`] (which, in a real deployment, is two
/// views of the same backing file).
pub type SharedRegion = std::sync::Arc<parking_lot::Mutex<Region>>;

/// A contiguous, resizable byte region backing one blob.
pub enum Region {
    /// A real file, memory-mapped read/write.
    File { path: PathBuf, file: File, mmap: MmapMut },
    /// An in-memory region with no durability, for tests (DAOS's dummy blob).
    Dummy { bytes: Vec<u8> },
}

impl Region {
    /// Create a new file-backed region of exactly `size` bytes.
    #[instrument(skip(path))]
    pub fn create_file(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(size)?;
        file.sync_all()?;
        // Safety: `file` outlives `mmap` because both are owned by the same
        // `Region` and dropped together; the file is exclusively ours.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Region::File { path: path.to_path_buf(), file, mmap })
    }

    /// Open an existing file-backed region, sizing from the file's current length.
    #[instrument(skip(path))]
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Region::File { path: path.to_path_buf(), file, mmap })
    }

    /// Create an in-memory dummy region of `size` bytes, zero-filled.
    pub fn create_dummy(size: u64) -> Self {
        Region::Dummy { bytes: vec![0u8; size as usize] }
    }

    pub fn len(&self) -> u64 {
        match self {
            Region::File { mmap, .. } => mmap.len() as u64,
            Region::Dummy { bytes } => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Region::File { mmap, .. } => &mmap[..],
            Region::Dummy { bytes } => &bytes[..],
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Region::File { mmap, .. } => &mut mmap[..],
            Region::Dummy { bytes } => &mut bytes[..],
        }
    }

    pub fn read_at(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let addr = addr as usize;
        self.as_bytes()
            .get(addr..addr + len)
            .ok_or_else(|| AdError::Invalid(format!("read out of bounds at {addr}, len {len}")))
    }

    pub fn write_at(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let addr = addr as usize;
        let len = data.len();
        let dst = self
            .as_bytes_mut()
            .get_mut(addr..addr + len)
            .ok_or_else(|| AdError::Invalid(format!("write out of bounds at {addr}, len {len}")))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Flush dirty pages to the backing file. No-op for the dummy region.
    #[instrument(skip(self))]
    pub fn flush(&self) -> Result<()> {
        if let Region::File { mmap, .. } = self {
            mmap.flush()?;
        }
        Ok(())
    }

    /// Advise the kernel that the whole region will be accessed randomly,
    /// matching the original's mmap hints for metadata regions.
    #[cfg(unix)]
    pub fn advise_random(&self) -> Result<()> {
        if let Region::File { mmap, .. } = self {
            mmap.advise(memmap2::Advice::Random)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn advise_random(&self) -> Result<()> {
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Region::File { path, .. } => Some(path.as_path()),
            Region::Dummy { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn dummy_region_read_write_roundtrip() {
        let mut region = Region::create_dummy(4096);
        region.write_at(10, b"hello").unwrap();
        assert_eq!(region.read_at(10, 5).unwrap(), b"hello");
    }

    #[test]
    fn file_region_persists_across_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        {
            let mut region = Region::create_file(&path, 65536).unwrap();
            region.write_at(100, b"persisted").unwrap();
            region.flush().unwrap();
        }
        let region = Region::open_file(&path).unwrap();
        assert_eq!(region.read_at(100, 9).unwrap(), b"persisted");
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let region = Region::create_dummy(16);
        assert!(region.read_at(10, 100).is_err());
    }
}
