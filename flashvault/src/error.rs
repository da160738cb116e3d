use microfs::{DeviceError, FsError};
use thiserror::Error;

use crate::crypto::CryptoError;

/// Result alias for volume operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors reported across the volume API.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The volume is not in the mounted state.
    #[error("volume is not mounted")]
    NotMounted,
    /// No file or directory exists at the given path.
    #[error("no such file or directory")]
    NotFound,
    /// A file or directory already exists at the given path.
    #[error("entry already exists")]
    AlreadyExists,
    /// The flash device failed; retrying may succeed.
    #[error("flash i/o failure")]
    Io,
    /// On-flash structures are damaged beyond use.
    #[error("filesystem corrupted")]
    Corrupt,
    /// No storage left for the request.
    #[error("filesystem full")]
    NoSpace,
    /// The cipher layer rejected the request.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The caller passed an argument the operation cannot act on.
    #[error("invalid argument: {0}")]
    InvalidInput(&'static str),
}

impl From<FsError> for Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Device(DeviceError::Io) => Error::Io,
            FsError::Device(DeviceError::Corrupt) | FsError::Corrupt => Error::Corrupt,
            FsError::NotFound | FsError::NotDir => Error::NotFound,
            FsError::AlreadyExists => Error::AlreadyExists,
            FsError::NoSpace => Error::NoSpace,
            FsError::IsDir => Error::InvalidInput("path is a directory"),
            FsError::DirNotEmpty => Error::InvalidInput("directory not empty"),
            FsError::BadName => Error::InvalidInput("invalid name"),
            FsError::FileTooLarge => Error::InvalidInput("content too large"),
            FsError::BadOffset => Error::InvalidInput("offset out of range"),
            FsError::BadGeometry => Error::InvalidInput("region too small"),
        }
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Io => Error::Io,
            DeviceError::Corrupt => Error::Corrupt,
        }
    }
}
