//! Fixed-size page buffers backing cached blocks.
//!
//! Every buffer exposes exactly [`BLOCK_SIZE`] bytes starting at a
//! [`BLOCK_SIZE`]-aligned address, which keeps the buffers usable for
//! direct I/O. Alignment is achieved without `unsafe` by over-allocating
//! and exposing an aligned subslice of the backing storage.

use mfs_types::BLOCK_SIZE;
use std::fmt;

/// Owned, aligned buffer of exactly one block.
pub struct PageBuf {
    storage: Box<[u8]>,
    start: usize,
}

impl PageBuf {
    /// Allocate a zero-filled page.
    #[must_use]
    pub fn zeroed() -> Self {
        let storage = vec![0_u8; BLOCK_SIZE + BLOCK_SIZE - 1].into_boxed_slice();
        let base = storage.as_ptr() as usize;
        let misalignment = base & (BLOCK_SIZE - 1);
        let start = if misalignment == 0 {
            0
        } else {
            BLOCK_SIZE - misalignment
        };
        debug_assert!(start + BLOCK_SIZE <= storage.len());
        Self { storage, start }
    }

    /// Allocate a page holding a copy of `bytes`.
    ///
    /// `bytes` may be shorter than a block; the remainder stays zero.
    /// Longer inputs are a caller bug.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        assert!(
            bytes.len() <= BLOCK_SIZE,
            "page payload of {} bytes exceeds block size",
            bytes.len()
        );
        let mut page = Self::zeroed();
        page.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        page
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + BLOCK_SIZE]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.storage[start..start + BLOCK_SIZE]
    }

    /// Reset the page contents to zero.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Clone for PageBuf {
    fn clone(&self) -> Self {
        Self::from_slice(self.as_slice())
    }
}

impl PartialEq for PageBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PageBuf {}

impl fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.as_slice()[..8];
        f.debug_struct("PageBuf")
            .field("len", &BLOCK_SIZE)
            .field("head", &head)
            .finish()
    }
}
