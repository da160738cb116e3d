//! Storage contract between the filesystem and the flash driver below it.

use core::fmt;

/// Result alias for block device primitives.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Failure classes a block device can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Transient transport or controller failure. A retry may succeed and
    /// the stored data is not assumed damaged.
    Io,
    /// The device detected unrecoverable damage in the affected range.
    Corrupt,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Io => write!(f, "device i/o failure"),
            DeviceError::Corrupt => write!(f, "device reported corruption"),
        }
    }
}

impl core::error::Error for DeviceError {}

/// A block-addressed storage medium with erase-before-write semantics.
///
/// One block is one erase granule. `program` may only touch bytes that have
/// been erased since they were last programmed; the filesystem upholds that
/// by erasing a block before rewriting it. All methods take `&self` so a
/// device can be shared behind an `Arc`; implementations serialize access
/// internally.
pub trait BlockDevice: Send + Sync {
    /// Size of one erase block in bytes.
    fn block_size(&self) -> usize;

    /// Number of blocks in the managed region.
    fn block_count(&self) -> usize;

    /// Fill `buf` from `block` starting at byte `offset` within the block.
    fn read(&self, block: u32, offset: usize, buf: &mut [u8]) -> DeviceResult<()>;

    /// Program `data` into `block` starting at byte `offset`. The target
    /// range must be in the erased state.
    fn program(&self, block: u32, offset: usize, data: &[u8]) -> DeviceResult<()>;

    /// Return `block` to the erased (all ones) state.
    fn erase(&self, block: u32) -> DeviceResult<()>;

    /// Flush any device-side buffers.
    fn sync(&self) -> DeviceResult<()>;
}
