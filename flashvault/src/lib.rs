//! Encrypted file storage on NOR flash.
//!
//! The crate stacks four pieces between a raw NOR flash driver (any
//! [`embedded_storage`] implementation) and the caller:
//!
//! * an adapter translating the filesystem's block contract onto word and
//!   page granular flash access, with erased-state tracking so redundant
//!   erase cycles never reach the device,
//! * the [`microfs`] filesystem engine,
//! * a cipher service ([`CryptoService`]) with exclusive key slots over a
//!   pluggable [`CipherEngine`],
//! * and the [`Volume`] facade, which serializes every operation behind
//!   one lock and moves file content through the cipher for files marked
//!   encrypted at creation.
//!
//! A volume is constructed around a [`Geometry`] describing its region of
//! the device, mounted with [`Volume::init`] (formatting on first use or
//! after corruption), and then driven with path-based calls: `mkfile`,
//! `save`, `read`, `append`, `update`, `rename`, `remove`. Maintenance
//! time is bounded through [`Volume::cleanup`], which pre-erases blocks
//! the filesystem no longer references.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

mod block_set;
mod clock;
pub mod crypto;
mod device;
mod error;
mod geometry;
mod hooks;
mod meta;
pub mod sim;
mod volume;

pub use clock::Clock;
#[cfg(feature = "std")]
pub use clock::SystemClock;
pub use crypto::{
    AesKey, CipherEngine, CryptoContext, CryptoError, CryptoService, SoftCipherEngine,
    AES_BLOCK_SIZE, DIGEST_SIZE, KEY_SLOTS,
};
pub use error::{Error, Result};
pub use geometry::Geometry;
pub use hooks::{EventHooks, NoopHooks};
pub use meta::FileAttr;
pub use volume::{
    CleanupReport, CryptoBinding, FileInfo, Volume, VolumeConfig, MAX_FILE_CONTENT,
};
