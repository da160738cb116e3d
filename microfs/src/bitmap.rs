//! Data area allocation bitmap.
//!
//! Bit `i` of the bitmap region tracks data block `data_start + i`. The
//! bitmap lives on flash and is accessed through the block cache like
//! everything else.

use crate::cache::CacheManager;
use crate::error::{FsError, FsResult};

pub(crate) struct Bitmap {
    start_block: u32,
    region_blocks: u32,
    bits: u32,
}

fn find_clear_bit(data: &[u8], limit: usize) -> Option<usize> {
    for bit in 0..limit {
        if data[bit / 8] & (1 << (bit % 8)) == 0 {
            return Some(bit);
        }
    }
    None
}

impl Bitmap {
    pub fn new(start_block: u32, region_blocks: u32, bits: u32) -> Self {
        Bitmap {
            start_block,
            region_blocks,
            bits,
        }
    }

    fn bits_in_region_block(&self, index: u32, bits_per_block: usize) -> usize {
        let base = index as usize * bits_per_block;
        let total = self.bits as usize;
        total.saturating_sub(base).min(bits_per_block)
    }

    /// Claim the first clear bit. Callers serialize allocation themselves.
    pub fn alloc(&self, cache: &CacheManager) -> FsResult<Option<u32>> {
        let bits_per_block = cache.block_size() * 8;
        for index in 0..self.region_blocks {
            let limit = self.bits_in_region_block(index, bits_per_block);
            if limit == 0 {
                break;
            }
            let block = self.start_block + index;
            let found = cache.with_block(block, |data| find_clear_bit(data, limit))?;
            if let Some(bit) = found {
                cache.with_block_mut(block, |data| data[bit / 8] |= 1 << (bit % 8))?;
                return Ok(Some(index * bits_per_block as u32 + bit as u32));
            }
        }
        Ok(None)
    }

    /// Clear `bit`, reporting whether it was actually set.
    pub fn dealloc(&self, cache: &CacheManager, bit: u32) -> FsResult<bool> {
        if bit >= self.bits {
            return Err(FsError::Corrupt);
        }
        let bits_per_block = cache.block_size() * 8;
        let block = self.start_block + bit / bits_per_block as u32;
        let inner = bit as usize % bits_per_block;
        let mask = 1u8 << (inner % 8);
        let was_set = cache.with_block(block, |data| data[inner / 8] & mask != 0)?;
        if was_set {
            cache.with_block_mut(block, |data| data[inner / 8] &= !mask)?;
        }
        Ok(was_set)
    }

    /// Visit every set bit in ascending order.
    pub fn for_each_set(&self, cache: &CacheManager, mut f: impl FnMut(u32)) -> FsResult<()> {
        let bits_per_block = cache.block_size() * 8;
        for index in 0..self.region_blocks {
            let limit = self.bits_in_region_block(index, bits_per_block);
            if limit == 0 {
                break;
            }
            cache.with_block(self.start_block + index, |data| {
                for bit in 0..limit {
                    if data[bit / 8] & (1 << (bit % 8)) != 0 {
                        f(index * bits_per_block as u32 + bit as u32);
                    }
                }
            })?;
        }
        Ok(())
    }

    pub fn count_set(&self, cache: &CacheManager) -> FsResult<u32> {
        let mut count = 0;
        self.for_each_set(cache, |_| count += 1)?;
        Ok(count)
    }
}
