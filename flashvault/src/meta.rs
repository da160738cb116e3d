//! Per-file metadata stored in the inode attribute area.

use microfs::ATTR_MAX;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sidecar record kept with every file.
///
/// For encrypted files `plain_len` is the original content length and
/// `enc_len` the stored ciphertext length; plain files keep both at zero
/// and rely on the filesystem size. A file whose attribute is missing or
/// undecodable is treated as plain, which matches what an older volume
/// written before this record existed would contain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    pub encrypted: bool,
    pub plain_len: u32,
    pub enc_len: u32,
}

impl FileAttr {
    pub fn plain() -> Self {
        FileAttr::default()
    }

    pub fn encrypted() -> Self {
        FileAttr {
            encrypted: true,
            plain_len: 0,
            enc_len: 0,
        }
    }

    /// Serialize into an inode attribute buffer, returning the used length.
    pub fn encode(&self, buf: &mut [u8; ATTR_MAX]) -> Result<usize> {
        let used = postcard::to_slice(self, buf)
            .map_err(|_| Error::InvalidInput("attribute encoding failed"))?;
        Ok(used.len())
    }

    pub fn decode(raw: &[u8]) -> Self {
        postcard::from_bytes(raw).unwrap_or_default()
    }
}
