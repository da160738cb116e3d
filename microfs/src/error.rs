use core::fmt;

use crate::block_dev::DeviceError;

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The underlying device failed.
    Device(DeviceError),
    /// On-flash structures are inconsistent.
    Corrupt,
    /// No entry with the requested name.
    NotFound,
    /// An entry with the requested name already exists.
    AlreadyExists,
    /// A directory operation was applied to a non-directory.
    NotDir,
    /// A file operation was applied to a directory.
    IsDir,
    /// The directory still contains entries.
    DirNotEmpty,
    /// No free block or inode slot is left.
    NoSpace,
    /// The name is empty, too long, or contains a forbidden byte. Also
    /// raised when a rename would move a directory below itself.
    BadName,
    /// The file would exceed the per-file block index capacity.
    FileTooLarge,
    /// An offset lies outside the valid range for the operation.
    BadOffset,
    /// The device is too small for the requested layout.
    BadGeometry,
}

impl From<DeviceError> for FsError {
    fn from(err: DeviceError) -> Self {
        FsError::Device(err)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Device(err) => write!(f, "device error: {err}"),
            FsError::Corrupt => write!(f, "filesystem structures are corrupted"),
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::AlreadyExists => write!(f, "entry already exists"),
            FsError::NotDir => write!(f, "not a directory"),
            FsError::IsDir => write!(f, "is a directory"),
            FsError::DirNotEmpty => write!(f, "directory not empty"),
            FsError::NoSpace => write!(f, "no space left"),
            FsError::BadName => write!(f, "invalid name"),
            FsError::FileTooLarge => write!(f, "file too large"),
            FsError::BadOffset => write!(f, "offset out of range"),
            FsError::BadGeometry => write!(f, "device too small for layout"),
        }
    }
}

impl core::error::Error for FsError {}
