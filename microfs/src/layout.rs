//! On-flash record formats.
//!
//! Block 0 holds the superblock. Blocks `1..1+bitmap_blocks` hold the data
//! area allocation bitmap, followed by the inode table, followed by the data
//! area. All integers are little endian.

use crate::error::{FsError, FsResult};

/// Identifies a formatted volume ("MFS1").
pub const FS_MAGIC: u32 = 0x4d46_5331;
/// Bumped on any incompatible layout change.
pub const FS_VERSION: u32 = 1;

/// Bytes per inode table slot.
pub const INODE_SIZE: usize = 128;
/// Block pointers held directly in an inode.
pub const DIRECT_COUNT: usize = 24;
/// Bytes of opaque attribute data stored in each inode.
pub const ATTR_MAX: usize = 16;
/// Bytes per directory entry.
pub const DIRENT_SIZE: usize = 32;
/// Longest permitted entry name, in bytes.
pub const NAME_MAX: usize = DIRENT_SIZE - 4 - 1;
/// Inode number of the root directory.
pub const ROOT_INO: u32 = 0;

/// Block pointer value marking an unallocated slot. Block 0 always holds the
/// superblock, so it can never be a data block.
pub const NO_BLOCK: u32 = 0;

pub(crate) fn get_u32(raw: &[u8], pos: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&raw[pos..pos + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn put_u32(raw: &mut [u8], pos: usize, value: u32) {
    raw[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

/// First record on the volume, describing the region split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub inode_count: u32,
    pub bitmap_blocks: u32,
    pub inode_table_blocks: u32,
    pub data_start: u32,
}

impl SuperBlock {
    pub const ENCODED_LEN: usize = 32;

    pub fn load(raw: &[u8]) -> Self {
        SuperBlock {
            magic: get_u32(raw, 0),
            version: get_u32(raw, 4),
            block_size: get_u32(raw, 8),
            block_count: get_u32(raw, 12),
            inode_count: get_u32(raw, 16),
            bitmap_blocks: get_u32(raw, 20),
            inode_table_blocks: get_u32(raw, 24),
            data_start: get_u32(raw, 28),
        }
    }

    pub fn store(&self, out: &mut [u8]) {
        put_u32(out, 0, self.magic);
        put_u32(out, 4, self.version);
        put_u32(out, 8, self.block_size);
        put_u32(out, 12, self.block_count);
        put_u32(out, 16, self.inode_count);
        put_u32(out, 20, self.bitmap_blocks);
        put_u32(out, 24, self.inode_table_blocks);
        put_u32(out, 28, self.data_start);
    }

    /// Reject superblocks that disagree with the device or with themselves.
    /// Every later block index computation relies on these bounds.
    pub fn validate(&self, block_size: usize, block_count: usize) -> FsResult<()> {
        if self.magic != FS_MAGIC || self.version != FS_VERSION {
            return Err(FsError::Corrupt);
        }
        if self.block_size as usize != block_size || self.block_count as usize > block_count {
            return Err(FsError::Corrupt);
        }
        if self.inode_count == 0 || self.bitmap_blocks == 0 || self.inode_table_blocks == 0 {
            return Err(FsError::Corrupt);
        }
        let expected_start = 1 + self.bitmap_blocks + self.inode_table_blocks;
        if self.data_start != expected_start || self.data_start >= self.block_count {
            return Err(FsError::Corrupt);
        }
        let table_capacity = self.inode_table_blocks as usize * block_size / INODE_SIZE;
        if self.inode_count as usize > table_capacity {
            return Err(FsError::Corrupt);
        }
        let tracked_bits = (self.block_count - self.data_start) as usize;
        if tracked_bits > self.bitmap_blocks as usize * block_size * 8 {
            return Err(FsError::Corrupt);
        }
        Ok(())
    }
}

/// What an inode table slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Free = 0,
    File = 1,
    Dir = 2,
}

impl InodeKind {
    fn from_u32(value: u32) -> FsResult<Self> {
        match value {
            0 => Ok(InodeKind::Free),
            1 => Ok(InodeKind::File),
            2 => Ok(InodeKind::Dir),
            _ => Err(FsError::Corrupt),
        }
    }
}

/// One inode table slot.
///
/// Layout: kind, size, indirect pointer and attribute length as `u32`s,
/// then the attribute bytes, then the direct block pointers.
#[derive(Debug, Clone)]
pub struct DiskInode {
    pub kind: InodeKind,
    pub size: u32,
    pub indirect: u32,
    pub attr_len: u32,
    pub attr: [u8; ATTR_MAX],
    pub direct: [u32; DIRECT_COUNT],
}

impl DiskInode {
    pub fn empty(kind: InodeKind) -> Self {
        DiskInode {
            kind,
            size: 0,
            indirect: NO_BLOCK,
            attr_len: 0,
            attr: [0; ATTR_MAX],
            direct: [NO_BLOCK; DIRECT_COUNT],
        }
    }

    pub fn load(raw: &[u8]) -> FsResult<Self> {
        let kind = InodeKind::from_u32(get_u32(raw, 0))?;
        let attr_len = get_u32(raw, 12);
        if attr_len as usize > ATTR_MAX {
            return Err(FsError::Corrupt);
        }
        let mut attr = [0u8; ATTR_MAX];
        attr.copy_from_slice(&raw[16..16 + ATTR_MAX]);
        let mut direct = [NO_BLOCK; DIRECT_COUNT];
        for (i, slot) in direct.iter_mut().enumerate() {
            *slot = get_u32(raw, 32 + i * 4);
        }
        Ok(DiskInode {
            kind,
            size: get_u32(raw, 4),
            indirect: get_u32(raw, 8),
            attr_len,
            attr,
            direct,
        })
    }

    pub fn store(&self, out: &mut [u8]) {
        out[..INODE_SIZE].fill(0);
        put_u32(out, 0, self.kind as u32);
        put_u32(out, 4, self.size);
        put_u32(out, 8, self.indirect);
        put_u32(out, 12, self.attr_len);
        out[16..16 + ATTR_MAX].copy_from_slice(&self.attr);
        for (i, slot) in self.direct.iter().enumerate() {
            put_u32(out, 32 + i * 4, *slot);
        }
    }

    pub fn attr_bytes(&self) -> &[u8] {
        &self.attr[..self.attr_len as usize]
    }
}

/// Turn a name into its fixed-width on-flash form, rejecting names the
/// directory format cannot represent.
pub(crate) fn encode_name(name: &str) -> FsResult<[u8; NAME_MAX + 1]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > NAME_MAX {
        return Err(FsError::BadName);
    }
    if name == "." || name == ".." {
        return Err(FsError::BadName);
    }
    if bytes.iter().any(|b| *b == 0 || *b == b'/') {
        return Err(FsError::BadName);
    }
    let mut out = [0u8; NAME_MAX + 1];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// One directory entry: a NUL padded name and the inode it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; NAME_MAX + 1],
    pub inode: u32,
}

impl DirEntry {
    pub fn load(raw: &[u8]) -> Self {
        let mut name = [0u8; NAME_MAX + 1];
        name.copy_from_slice(&raw[..NAME_MAX + 1]);
        DirEntry {
            name,
            inode: get_u32(raw, NAME_MAX + 1),
        }
    }

    pub fn store(&self, out: &mut [u8]) {
        out[..NAME_MAX + 1].copy_from_slice(&self.name);
        put_u32(out, NAME_MAX + 1, self.inode);
    }

    pub fn name(&self) -> FsResult<&str> {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).map_err(|_| FsError::Corrupt)
    }
}
