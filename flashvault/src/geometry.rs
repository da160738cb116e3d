use crate::error::{Error, Result};

/// Physical layout of the managed flash region.
///
/// All addressing below the filesystem is derived from this: `base` is the
/// absolute byte address of the region inside the device, blocks are the
/// erase granule and pages the program granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    base: u32,
    block_size: usize,
    page_size: usize,
    block_count: usize,
}

impl Geometry {
    pub fn new(base: u32, block_size: usize, page_size: usize, block_count: usize) -> Result<Self> {
        if page_size == 0 || page_size % 4 != 0 {
            return Err(Error::InvalidInput("page size must be a word multiple"));
        }
        if block_size == 0 || block_size % page_size != 0 {
            return Err(Error::InvalidInput("block size must be a page multiple"));
        }
        if base as usize % block_size != 0 {
            return Err(Error::InvalidInput("region base must be block aligned"));
        }
        if block_count == 0 {
            return Err(Error::InvalidInput("region has no blocks"));
        }
        let len = block_size
            .checked_mul(block_count)
            .filter(|len| (base as usize).checked_add(*len).is_some())
            .ok_or(Error::InvalidInput("region exceeds the address space"))?;
        // The exclusive end of the last block is itself a device address
        // (it bounds the erase of that block), so it must fit in a word.
        if base as u64 + len as u64 > u32::MAX as u64 {
            return Err(Error::InvalidInput("region exceeds the address space"));
        }
        Ok(Geometry {
            base,
            block_size,
            page_size,
            block_count,
        })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Total region length in bytes.
    pub fn len(&self) -> usize {
        self.block_size * self.block_count
    }

    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }

    /// Absolute device address of `offset` within `block`.
    pub(crate) fn address(&self, block: u32, offset: usize) -> u32 {
        self.base + block * self.block_size as u32 + offset as u32
    }
}
