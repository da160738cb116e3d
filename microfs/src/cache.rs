//! Write-back cache of whole erase blocks.
//!
//! Every read and write the filesystem performs goes through a cached copy
//! of the block. Dirty buffers are written back as an erase of the block
//! followed by a single full-block program, which keeps the device's
//! erase-before-write rule satisfied without the callers knowing about it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::block_dev::{BlockDevice, DeviceResult};

/// Resident block buffers per filesystem instance.
const CACHE_CAPACITY: usize = 16;

/// One cached erase block.
///
/// The storage is a `u32` vector so the device always sees a word-aligned
/// destination pointer on loads.
struct BlockBuf {
    words: Vec<u32>,
    len: usize,
    block: u32,
    dirty: bool,
}

impl BlockBuf {
    fn load(device: &dyn BlockDevice, block: u32) -> DeviceResult<Self> {
        let len = device.block_size();
        let mut buf = BlockBuf {
            words: alloc::vec![0u32; len / 4],
            len,
            block,
            dirty: false,
        };
        device.read(block, 0, buf.bytes_raw_mut())?;
        Ok(buf)
    }

    fn bytes(&self) -> &[u8] {
        // The vector owns `len` initialized bytes and is word aligned.
        unsafe { core::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    fn bytes_raw_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        self.bytes_raw_mut()
    }

    fn flush(&mut self, device: &dyn BlockDevice) -> DeviceResult<()> {
        if !self.dirty {
            return Ok(());
        }
        device.erase(self.block)?;
        device.program(self.block, 0, self.bytes())?;
        self.dirty = false;
        Ok(())
    }
}

/// Shared cache over one device.
pub(crate) struct CacheManager {
    device: Arc<dyn BlockDevice>,
    entries: Mutex<VecDeque<(u32, Arc<Mutex<BlockBuf>>)>>,
}

impl CacheManager {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        CacheManager {
            device,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.device.block_size()
    }

    fn get(&self, block: u32) -> DeviceResult<Arc<Mutex<BlockBuf>>> {
        let mut entries = self.entries.lock();
        if let Some((_, buf)) = entries.iter().find(|(id, _)| *id == block) {
            return Ok(buf.clone());
        }
        if entries.len() >= CACHE_CAPACITY {
            // Evict the oldest buffer nobody is holding. If every buffer is
            // pinned the cache grows past capacity until one is released.
            if let Some(pos) = entries
                .iter()
                .position(|(_, buf)| Arc::strong_count(buf) == 1)
            {
                if let Some((_, victim)) = entries.remove(pos) {
                    victim.lock().flush(self.device.as_ref())?;
                }
            }
        }
        let buf = Arc::new(Mutex::new(BlockBuf::load(self.device.as_ref(), block)?));
        entries.push_back((block, buf.clone()));
        Ok(buf)
    }

    /// Run `f` over the cached contents of `block`.
    pub fn with_block<R>(&self, block: u32, f: impl FnOnce(&[u8]) -> R) -> DeviceResult<R> {
        let buf = self.get(block)?;
        let guard = buf.lock();
        Ok(f(guard.bytes()))
    }

    /// Run `f` over the cached contents of `block`, marking it dirty.
    pub fn with_block_mut<R>(&self, block: u32, f: impl FnOnce(&mut [u8]) -> R) -> DeviceResult<R> {
        let buf = self.get(block)?;
        let mut guard = buf.lock();
        Ok(f(guard.bytes_mut()))
    }

    /// Forget any cached copy of `block` without writing it back. Used when
    /// the block is deallocated and its contents no longer matter.
    pub fn discard(&self, block: u32) {
        self.entries.lock().retain(|(id, _)| *id != block);
    }

    /// Write every dirty buffer back to the device.
    pub fn sync_all(&self) -> DeviceResult<()> {
        let entries = self.entries.lock();
        for (_, buf) in entries.iter() {
            buf.lock().flush(self.device.as_ref())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    /// Byte-addressed RAM device that counts erases and rejects programs
    /// into non-erased bytes.
    struct CountingRam {
        blocks: Mutex<Vec<Vec<u8>>>,
        erases: AtomicU32,
    }

    impl CountingRam {
        fn new(count: usize) -> Self {
            CountingRam {
                blocks: Mutex::new(alloc::vec![alloc::vec![0xff; 64]; count]),
                erases: AtomicU32::new(0),
            }
        }
    }

    impl BlockDevice for CountingRam {
        fn block_size(&self) -> usize {
            64
        }

        fn block_count(&self) -> usize {
            self.blocks.lock().len()
        }

        fn read(&self, block: u32, offset: usize, buf: &mut [u8]) -> DeviceResult<()> {
            let blocks = self.blocks.lock();
            buf.copy_from_slice(&blocks[block as usize][offset..offset + buf.len()]);
            Ok(())
        }

        fn program(&self, block: u32, offset: usize, data: &[u8]) -> DeviceResult<()> {
            let mut blocks = self.blocks.lock();
            let target = &mut blocks[block as usize][offset..offset + data.len()];
            for (dst, src) in target.iter_mut().zip(data) {
                if *dst != 0xff && *dst != *src {
                    return Err(crate::DeviceError::Corrupt);
                }
                *dst = *src;
            }
            Ok(())
        }

        fn erase(&self, block: u32) -> DeviceResult<()> {
            self.erases.fetch_add(1, Ordering::Relaxed);
            self.blocks.lock()[block as usize].fill(0xff);
            Ok(())
        }

        fn sync(&self) -> DeviceResult<()> {
            Ok(())
        }
    }

    #[test]
    fn writeback_erases_then_programs() {
        let dev = Arc::new(CountingRam::new(4));
        let cache = CacheManager::new(dev.clone());
        cache
            .with_block_mut(1, |data| data[..4].copy_from_slice(b"abcd"))
            .unwrap();
        assert_eq!(dev.erases.load(Ordering::Relaxed), 0);
        cache.sync_all().unwrap();
        assert_eq!(dev.erases.load(Ordering::Relaxed), 1);
        let mut back = [0u8; 4];
        dev.read(1, 0, &mut back).unwrap();
        assert_eq!(&back, b"abcd");
    }

    #[test]
    fn clean_blocks_are_not_rewritten() {
        let dev = Arc::new(CountingRam::new(4));
        let cache = CacheManager::new(dev.clone());
        cache.with_block(2, |data| assert_eq!(data[0], 0xff)).unwrap();
        cache.sync_all().unwrap();
        assert_eq!(dev.erases.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn eviction_flushes_dirty_victims() {
        let dev = Arc::new(CountingRam::new(CACHE_CAPACITY + 2));
        let cache = CacheManager::new(dev.clone());
        cache.with_block_mut(0, |data| data[0] = 7).unwrap();
        for block in 1..=CACHE_CAPACITY as u32 {
            cache.with_block(block, |_| ()).unwrap();
        }
        // Block 0 was evicted to make room and must have hit the device.
        let mut back = [0u8; 4];
        dev.read(0, 0, &mut back).unwrap();
        assert_eq!(back[0], 7);
    }

    #[test]
    fn discard_drops_dirty_data() {
        let dev = Arc::new(CountingRam::new(4));
        let cache = CacheManager::new(dev.clone());
        cache.with_block_mut(3, |data| data[0] = 1).unwrap();
        cache.discard(3);
        cache.sync_all().unwrap();
        assert_eq!(dev.erases.load(Ordering::Relaxed), 0);
    }
}
