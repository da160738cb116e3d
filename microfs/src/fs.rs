//! Volume layout management: format, mount, and allocation of inodes and
//! data blocks.

use alloc::sync::Arc;
use core::fmt;

use log::{debug, info};
use spin::Mutex;

use crate::bitmap::Bitmap;
use crate::block_dev::BlockDevice;
use crate::cache::CacheManager;
use crate::error::{FsError, FsResult};
use crate::layout::{
    DiskInode, InodeKind, SuperBlock, FS_MAGIC, FS_VERSION, INODE_SIZE, ROOT_INO,
};
use crate::vfs::Inode;

/// Usage summary reported by [`FileSystem::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: usize,
    pub total_blocks: usize,
    /// Superblock, bitmap and inode table blocks.
    pub metadata_blocks: usize,
    pub data_blocks: usize,
    pub used_data_blocks: usize,
}

/// A mounted volume.
pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    cache: CacheManager,
    sb: SuperBlock,
    bitmap: Bitmap,
    /// Serializes the check-then-claim window in inode and block allocation.
    alloc_guard: Mutex<()>,
}

impl FileSystem {
    /// Write a fresh filesystem onto `device` and mount it.
    ///
    /// The superblock goes out last so a volume only ever carries a valid
    /// magic once all other structures are in place.
    pub fn format(device: Arc<dyn BlockDevice>, inode_count: u32) -> FsResult<Arc<FileSystem>> {
        let block_size = device.block_size();
        let block_count = device.block_count();
        if block_size < 512 || block_size % 4 != 0 || inode_count == 0 {
            return Err(FsError::BadGeometry);
        }

        let bitmap_blocks = block_count.div_ceil(block_size * 8) as u32;
        let table_blocks = (inode_count as usize * INODE_SIZE).div_ceil(block_size) as u32;
        let data_start = 1 + bitmap_blocks + table_blocks;
        if data_start as usize >= block_count {
            return Err(FsError::BadGeometry);
        }
        let sb = SuperBlock {
            magic: FS_MAGIC,
            version: FS_VERSION,
            block_size: block_size as u32,
            block_count: block_count as u32,
            inode_count,
            bitmap_blocks,
            inode_table_blocks: table_blocks,
            data_start,
        };
        info!(
            "formatting: {} blocks of {} bytes, {} inodes, data starts at block {}",
            block_count, block_size, inode_count, data_start
        );

        let cache = CacheManager::new(device.clone());
        for block in 1..data_start {
            cache.with_block_mut(block, |data| data.fill(0))?;
        }
        cache.with_block_mut(1 + bitmap_blocks, |data| {
            DiskInode::empty(InodeKind::Dir).store(&mut data[..INODE_SIZE]);
        })?;
        cache.with_block_mut(0, |data| {
            data.fill(0);
            sb.store(&mut data[..SuperBlock::ENCODED_LEN]);
        })?;
        cache.sync_all()?;
        device.sync()?;

        Ok(Arc::new(FileSystem {
            device,
            cache,
            sb,
            bitmap: Bitmap::new(1, bitmap_blocks, sb.block_count - data_start),
            alloc_guard: Mutex::new(()),
        }))
    }

    /// Mount an existing filesystem, validating its superblock and root
    /// directory before anything else trusts the on-flash structures.
    pub fn mount(device: Arc<dyn BlockDevice>) -> FsResult<Arc<FileSystem>> {
        let cache = CacheManager::new(device.clone());
        let sb = cache.with_block(0, |data| SuperBlock::load(&data[..SuperBlock::ENCODED_LEN]))?;
        sb.validate(device.block_size(), device.block_count())?;

        let fs = Arc::new(FileSystem {
            device,
            cache,
            sb,
            bitmap: Bitmap::new(1, sb.bitmap_blocks, sb.block_count - sb.data_start),
            alloc_guard: Mutex::new(()),
        });
        let root = fs.read_inode(ROOT_INO)?;
        if root.kind != InodeKind::Dir {
            return Err(FsError::Corrupt);
        }
        let used = fs.bitmap.count_set(&fs.cache)?;
        debug!(
            "mounted: {} blocks, {} inodes, {} data blocks in use",
            fs.sb.block_count, fs.sb.inode_count, used
        );
        Ok(fs)
    }

    pub fn block_size(&self) -> usize {
        self.sb.block_size as usize
    }

    pub fn block_count(&self) -> usize {
        self.sb.block_count as usize
    }

    pub(crate) fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Handle to the root directory.
    pub fn root(self: &Arc<Self>) -> Inode {
        Inode::new(self.clone(), ROOT_INO, InodeKind::Dir)
    }

    fn inode_location(&self, ino: u32) -> FsResult<(u32, usize)> {
        if ino >= self.sb.inode_count {
            return Err(FsError::Corrupt);
        }
        let per_block = self.block_size() / INODE_SIZE;
        let table_start = 1 + self.sb.bitmap_blocks;
        Ok((
            table_start + ino / per_block as u32,
            (ino as usize % per_block) * INODE_SIZE,
        ))
    }

    pub(crate) fn read_inode(&self, ino: u32) -> FsResult<DiskInode> {
        let (block, offset) = self.inode_location(ino)?;
        self.cache
            .with_block(block, |data| DiskInode::load(&data[offset..offset + INODE_SIZE]))?
    }

    pub(crate) fn write_inode(&self, ino: u32, inode: &DiskInode) -> FsResult<()> {
        let (block, offset) = self.inode_location(ino)?;
        self.cache
            .with_block_mut(block, |data| inode.store(&mut data[offset..offset + INODE_SIZE]))?;
        Ok(())
    }

    /// Claim a free inode slot and initialize it for `kind`.
    pub(crate) fn alloc_inode(&self, kind: InodeKind) -> FsResult<u32> {
        let _guard = self.alloc_guard.lock();
        let per_block = self.block_size() / INODE_SIZE;
        let table_start = 1 + self.sb.bitmap_blocks;
        for table_block in 0..self.sb.inode_table_blocks {
            let base = table_block as usize * per_block;
            let found = self.cache.with_block(table_start + table_block, |data| {
                for slot in 0..per_block {
                    let ino = base + slot;
                    if ino >= self.sb.inode_count as usize {
                        break;
                    }
                    if crate::layout::get_u32(data, slot * INODE_SIZE) == InodeKind::Free as u32 {
                        return Some(ino as u32);
                    }
                }
                None
            })?;
            if let Some(ino) = found {
                self.write_inode(ino, &DiskInode::empty(kind))?;
                return Ok(ino);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Return an inode slot to the free pool.
    pub(crate) fn free_inode(&self, ino: u32) -> FsResult<()> {
        if ino == ROOT_INO {
            return Err(FsError::Corrupt);
        }
        self.write_inode(ino, &DiskInode::empty(InodeKind::Free))
    }

    /// Claim a data block, returning its absolute block number.
    pub(crate) fn alloc_block(&self) -> FsResult<u32> {
        let _guard = self.alloc_guard.lock();
        match self.bitmap.alloc(&self.cache)? {
            Some(bit) => Ok(self.sb.data_start + bit),
            None => Err(FsError::NoSpace),
        }
    }

    /// Release a data block. Freeing a block that is not allocated means an
    /// on-flash pointer and the bitmap disagree.
    pub(crate) fn free_block(&self, block: u32) -> FsResult<()> {
        let _guard = self.alloc_guard.lock();
        if block < self.sb.data_start || block >= self.sb.block_count {
            return Err(FsError::Corrupt);
        }
        if !self.bitmap.dealloc(&self.cache, block - self.sb.data_start)? {
            return Err(FsError::Corrupt);
        }
        self.cache.discard(block);
        Ok(())
    }

    /// Visit every block the filesystem currently relies on: all metadata
    /// blocks plus every allocated data block.
    pub fn for_each_used_block(&self, mut f: impl FnMut(u32)) -> FsResult<()> {
        for block in 0..self.sb.data_start {
            f(block);
        }
        let data_start = self.sb.data_start;
        self.bitmap.for_each_set(&self.cache, |bit| f(data_start + bit))
    }

    pub fn stats(&self) -> FsResult<FsStats> {
        Ok(FsStats {
            block_size: self.block_size(),
            total_blocks: self.block_count(),
            metadata_blocks: self.sb.data_start as usize,
            data_blocks: (self.sb.block_count - self.sb.data_start) as usize,
            used_data_blocks: self.bitmap.count_set(&self.cache)? as usize,
        })
    }

    /// Push all dirty cached blocks out and flush the device.
    pub fn sync_all(&self) -> FsResult<()> {
        self.cache.sync_all()?;
        self.device.sync()?;
        Ok(())
    }
}

impl fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("block_size", &self.sb.block_size)
            .field("block_count", &self.sb.block_count)
            .field("inode_count", &self.sb.inode_count)
            .finish_non_exhaustive()
    }
}
