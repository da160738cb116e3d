//! Files, directories and path resolution.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::layout::{
    encode_name, get_u32, put_u32, DirEntry, DiskInode, InodeKind, ATTR_MAX, DIRECT_COUNT,
    DIRENT_SIZE, NAME_MAX, NO_BLOCK,
};

/// Handle to one inode. Handles are cheap to create and are expected to be
/// short lived; callers re-resolve paths rather than caching handles across
/// unrelated operations.
#[derive(Debug, Clone)]
pub struct Inode {
    fs: Arc<FileSystem>,
    ino: u32,
    kind: InodeKind,
}

impl FileSystem {
    /// Walk `path` from the root. Empty components are ignored, so leading
    /// and doubled separators are harmless.
    pub fn resolve(self: &Arc<Self>, path: &str) -> FsResult<Inode> {
        let mut node = self.root();
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            node = node.find(comp)?.ok_or(FsError::NotFound)?;
        }
        Ok(node)
    }

    /// Resolve everything but the last component of `path`, returning the
    /// parent directory handle and the leaf name.
    pub fn resolve_parent<'p>(self: &Arc<Self>, path: &'p str) -> FsResult<(Inode, &'p str)> {
        let mut components = path.split('/').filter(|c| !c.is_empty());
        let mut leaf = components.next().ok_or(FsError::BadName)?;
        let mut node = self.root();
        for comp in components {
            node = node.find(leaf)?.ok_or(FsError::NotFound)?;
            leaf = comp;
        }
        if node.kind != InodeKind::Dir {
            return Err(FsError::NotDir);
        }
        Ok((node, leaf))
    }

    /// Move or rename an entry. The destination name must be free, renaming
    /// an entry onto itself is a no-op, and a directory cannot be moved
    /// below itself.
    pub fn rename(self: &Arc<Self>, from: &str, to: &str) -> FsResult<()> {
        let (from_dir, from_name) = self.resolve_parent(from)?;
        let (to_dir, to_name) = self.resolve_parent(to)?;
        let from_arr = encode_name(from_name)?;
        let to_arr = encode_name(to_name)?;
        let (index, entry) = from_dir
            .entry_by_name(&from_arr)?
            .ok_or(FsError::NotFound)?;
        if from_dir.ino == to_dir.ino && from_arr == to_arr {
            return Ok(());
        }
        // Moving a directory below itself would detach its whole subtree
        // into an unreachable cycle.
        if names_ancestor_of(from, to) {
            return Err(FsError::BadName);
        }
        if to_dir.entry_by_name(&to_arr)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        to_dir.append_entry(&DirEntry {
            name: to_arr,
            inode: entry.inode,
        })?;
        // With from_dir == to_dir the appended entry is now the last one, so
        // swap-last compaction leaves exactly the renamed entry in place.
        from_dir.remove_entry_at(index)
    }
}

/// True when the entry named by `path` lies on the directory chain leading
/// to `other`. Empty components are ignored the same way resolution
/// ignores them, and traversal through files already fails resolution, so
/// a match here always concerns a directory.
fn names_ancestor_of(path: &str, other: &str) -> bool {
    let mut rest = other.split('/').filter(|c| !c.is_empty());
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        if rest.next() != Some(comp) {
            return false;
        }
    }
    rest.next().is_some()
}

impl Inode {
    pub(crate) fn new(fs: Arc<FileSystem>, ino: u32, kind: InodeKind) -> Self {
        Inode { fs, ino, kind }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Dir
    }

    fn disk(&self) -> FsResult<DiskInode> {
        let inode = self.fs.read_inode(self.ino)?;
        if inode.kind == InodeKind::Free {
            // The slot was freed while this handle was alive.
            return Err(FsError::NotFound);
        }
        Ok(inode)
    }

    /// Current content size in bytes.
    pub fn size(&self) -> FsResult<usize> {
        Ok(self.disk()?.size as usize)
    }

    /// Absolute block number backing content block `index`.
    fn nth_block(&self, inode: &DiskInode, index: usize) -> FsResult<u32> {
        if index < DIRECT_COUNT {
            return Ok(inode.direct[index]);
        }
        let slot = index - DIRECT_COUNT;
        if slot >= self.fs.block_size() / 4 || inode.indirect == NO_BLOCK {
            return Err(FsError::Corrupt);
        }
        Ok(self
            .fs
            .cache()
            .with_block(inode.indirect, |data| get_u32(data, slot * 4))?)
    }

    fn set_nth_block(&self, inode: &mut DiskInode, index: usize, block: u32) -> FsResult<()> {
        if index < DIRECT_COUNT {
            inode.direct[index] = block;
            return Ok(());
        }
        let slot = index - DIRECT_COUNT;
        if slot >= self.fs.block_size() / 4 || inode.indirect == NO_BLOCK {
            return Err(FsError::Corrupt);
        }
        self.fs
            .cache()
            .with_block_mut(inode.indirect, |data| put_u32(data, slot * 4, block))?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes starting at `offset`, returning how many
    /// were copied. Reads past the end of the file return zero.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        let inode = self.disk()?;
        let size = inode.size as usize;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.fs.block_size();
        let end = size.min(offset + buf.len());
        let mut pos = offset;
        while pos < end {
            let inner = pos % block_size;
            let take = (block_size - inner).min(end - pos);
            let block = self.nth_block(&inode, pos / block_size)?;
            if block == NO_BLOCK {
                return Err(FsError::Corrupt);
            }
            let dst = &mut buf[pos - offset..pos - offset + take];
            self.fs
                .cache()
                .with_block(block, |data| dst.copy_from_slice(&data[inner..inner + take]))?;
            pos += take;
        }
        Ok(end - offset)
    }

    /// Write `data` at `offset`, growing the file when the write extends
    /// past the current end. `offset` may not exceed the current size.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> FsResult<()> {
        let mut inode = self.disk()?;
        let size = inode.size as usize;
        if offset > size {
            return Err(FsError::BadOffset);
        }
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len();
        if end > size {
            self.grow(&mut inode, end)?;
        }
        let block_size = self.fs.block_size();
        let mut pos = offset;
        while pos < end {
            let inner = pos % block_size;
            let take = (block_size - inner).min(end - pos);
            let block = self.nth_block(&inode, pos / block_size)?;
            if block == NO_BLOCK {
                return Err(FsError::Corrupt);
            }
            let src = &data[pos - offset..pos - offset + take];
            self.fs
                .cache()
                .with_block_mut(block, |data| data[inner..inner + take].copy_from_slice(src))?;
            pos += take;
        }
        Ok(())
    }

    /// Extend the index to cover `new_size` bytes and persist the inode.
    /// On allocation failure every block claimed here is returned, and the
    /// on-flash inode is left untouched.
    fn grow(&self, inode: &mut DiskInode, new_size: usize) -> FsResult<()> {
        let block_size = self.fs.block_size();
        let max_blocks = DIRECT_COUNT + block_size / 4;
        let needed = new_size.div_ceil(block_size);
        if needed > max_blocks || new_size > u32::MAX as usize {
            return Err(FsError::FileTooLarge);
        }
        let current = (inode.size as usize).div_ceil(block_size);
        let mut claimed: Vec<u32> = Vec::new();
        let outcome = (|| -> FsResult<()> {
            for index in current..needed {
                if index >= DIRECT_COUNT && inode.indirect == NO_BLOCK {
                    let indirect = self.fs.alloc_block()?;
                    claimed.push(indirect);
                    self.fs.cache().with_block_mut(indirect, |data| data.fill(0))?;
                    inode.indirect = indirect;
                }
                let block = self.fs.alloc_block()?;
                claimed.push(block);
                self.set_nth_block(inode, index, block)?;
            }
            Ok(())
        })();
        if let Err(err) = outcome {
            for block in claimed {
                let _ = self.fs.free_block(block);
            }
            return Err(err);
        }
        inode.size = new_size as u32;
        self.fs.write_inode(self.ino, inode)
    }

    /// Shrink the file to `new_size` bytes, freeing blocks that fall past
    /// the new end.
    pub fn truncate(&self, new_size: usize) -> FsResult<()> {
        let mut inode = self.disk()?;
        let size = inode.size as usize;
        if new_size > size {
            return Err(FsError::BadOffset);
        }
        if new_size == size {
            return Ok(());
        }
        let block_size = self.fs.block_size();
        let keep = new_size.div_ceil(block_size);
        let current = size.div_ceil(block_size);
        for index in keep..current {
            let block = self.nth_block(&inode, index)?;
            if block != NO_BLOCK {
                self.fs.free_block(block)?;
            }
            if index < DIRECT_COUNT {
                inode.direct[index] = NO_BLOCK;
            } else {
                self.set_nth_block(&mut inode, index, NO_BLOCK)?;
            }
        }
        if keep <= DIRECT_COUNT && inode.indirect != NO_BLOCK {
            self.fs.free_block(inode.indirect)?;
            inode.indirect = NO_BLOCK;
        }
        inode.size = new_size as u32;
        self.fs.write_inode(self.ino, &inode)
    }

    /// Read the inode's attribute bytes into `buf`, returning the stored
    /// length.
    pub fn read_attr(&self, buf: &mut [u8; ATTR_MAX]) -> FsResult<usize> {
        let inode = self.disk()?;
        let len = inode.attr_len as usize;
        buf[..len].copy_from_slice(inode.attr_bytes());
        Ok(len)
    }

    /// Replace the inode's attribute bytes.
    pub fn write_attr(&self, data: &[u8]) -> FsResult<()> {
        if data.len() > ATTR_MAX {
            return Err(FsError::FileTooLarge);
        }
        let mut inode = self.disk()?;
        inode.attr = [0; ATTR_MAX];
        inode.attr[..data.len()].copy_from_slice(data);
        inode.attr_len = data.len() as u32;
        self.fs.write_inode(self.ino, &inode)
    }

    fn require_dir(&self) -> FsResult<()> {
        if self.kind != InodeKind::Dir {
            return Err(FsError::NotDir);
        }
        Ok(())
    }

    fn entry_count(&self) -> FsResult<usize> {
        Ok(self.size()? / DIRENT_SIZE)
    }

    fn entry_at(&self, index: usize) -> FsResult<DirEntry> {
        let mut raw = [0u8; DIRENT_SIZE];
        if self.read_at(index * DIRENT_SIZE, &mut raw)? != DIRENT_SIZE {
            return Err(FsError::Corrupt);
        }
        Ok(DirEntry::load(&raw))
    }

    pub(crate) fn entry_by_name(
        &self,
        name: &[u8; NAME_MAX + 1],
    ) -> FsResult<Option<(usize, DirEntry)>> {
        self.require_dir()?;
        for index in 0..self.entry_count()? {
            let entry = self.entry_at(index)?;
            if entry.name == *name {
                return Ok(Some((index, entry)));
            }
        }
        Ok(None)
    }

    pub(crate) fn append_entry(&self, entry: &DirEntry) -> FsResult<()> {
        let mut raw = [0u8; DIRENT_SIZE];
        entry.store(&mut raw);
        self.write_at(self.size()?, &raw)
    }

    /// Remove the entry at `index` by moving the last entry into its place
    /// and shrinking the directory by one slot.
    pub(crate) fn remove_entry_at(&self, index: usize) -> FsResult<()> {
        let count = self.entry_count()?;
        if index >= count {
            return Err(FsError::Corrupt);
        }
        if index != count - 1 {
            let last = self.entry_at(count - 1)?;
            let mut raw = [0u8; DIRENT_SIZE];
            last.store(&mut raw);
            self.write_at(index * DIRENT_SIZE, &raw)?;
        }
        self.truncate((count - 1) * DIRENT_SIZE)
    }

    /// Look `name` up in this directory.
    pub fn find(&self, name: &str) -> FsResult<Option<Inode>> {
        self.require_dir()?;
        let arr = encode_name(name)?;
        match self.entry_by_name(&arr)? {
            Some((_, entry)) => {
                let kind = self.fs.read_inode(entry.inode)?.kind;
                if kind == InodeKind::Free {
                    return Err(FsError::Corrupt);
                }
                Ok(Some(Inode::new(self.fs.clone(), entry.inode, kind)))
            }
            None => Ok(None),
        }
    }

    fn create(&self, name: &str, kind: InodeKind) -> FsResult<Inode> {
        self.require_dir()?;
        let arr = encode_name(name)?;
        if self.entry_by_name(&arr)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let ino = self.fs.alloc_inode(kind)?;
        let entry = DirEntry { name: arr, inode: ino };
        if let Err(err) = self.append_entry(&entry) {
            let _ = self.fs.free_inode(ino);
            return Err(err);
        }
        Ok(Inode::new(self.fs.clone(), ino, kind))
    }

    /// Create an empty file in this directory.
    pub fn create_file(&self, name: &str) -> FsResult<Inode> {
        self.create(name, InodeKind::File)
    }

    /// Create an empty subdirectory in this directory.
    pub fn create_dir(&self, name: &str) -> FsResult<Inode> {
        self.create(name, InodeKind::Dir)
    }

    /// Remove the named entry. Files lose their content blocks; directories
    /// must be empty.
    pub fn remove(&self, name: &str) -> FsResult<()> {
        self.require_dir()?;
        let arr = encode_name(name)?;
        let (index, entry) = self.entry_by_name(&arr)?.ok_or(FsError::NotFound)?;
        let target = Inode::new(self.fs.clone(), entry.inode, InodeKind::File);
        let target_disk = target.disk()?;
        if target_disk.kind == InodeKind::Dir && target_disk.size != 0 {
            return Err(FsError::DirNotEmpty);
        }
        target.truncate(0)?;
        self.fs.free_inode(entry.inode)?;
        self.remove_entry_at(index)
    }

    /// Names of all entries in this directory.
    pub fn list(&self) -> FsResult<Vec<String>> {
        self.require_dir()?;
        let mut names = Vec::new();
        for index in 0..self.entry_count()? {
            let entry = self.entry_at(index)?;
            names.push(String::from(entry.name()?));
        }
        Ok(names)
    }
}
