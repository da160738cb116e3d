//! The mounted volume facade.
//!
//! One mutex serializes every operation, including mount and unmount, so
//! callers on any task see a consistent filesystem and a consistent cipher
//! binding. File content crosses the cipher layer on the way in and out of
//! encrypted files; everything else is plain filesystem work delegated to
//! the engine.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::ops::{Deref, DerefMut};

use embedded_storage::nor_flash::NorFlash;
use log::{info, warn};
use microfs::{BlockDevice, FileSystem, FsError, Inode, ATTR_MAX};
use spin::{Mutex, MutexGuard};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::crypto::{CryptoContext, CryptoService};
use crate::device::FlashAdapter;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::hooks::{EventHooks, HookRegistry};
use crate::meta::FileAttr;

/// Upper bound on the content length of a single file.
pub const MAX_FILE_CONTENT: usize = 1 << 20;

/// A cipher service and the context to attach to it while the volume is
/// mounted.
#[derive(Clone)]
pub struct CryptoBinding {
    pub service: Arc<CryptoService>,
    pub context: CryptoContext,
}

/// Construction parameters for a [`Volume`].
pub struct VolumeConfig {
    pub geometry: Geometry,
    /// Capacity of the inode table written at format time.
    pub inode_count: u32,
    /// Cipher binding for encrypted files. A volume without one can only
    /// hold plain files.
    pub crypto: Option<CryptoBinding>,
    pub clock: Arc<dyn Clock>,
}

/// Metadata snapshot for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Content length as the writer saw it.
    pub len: usize,
    /// Bytes occupied in the filesystem (ciphertext length for encrypted
    /// files).
    pub stored_len: usize,
    pub encrypted: bool,
}

/// Outcome of a maintenance sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Unused blocks put through the erase path.
    pub processed: usize,
    /// False when the time budget ran out before the sweep finished.
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

struct VolumeState {
    mount: MountState,
    fs: Option<Arc<FileSystem>>,
    /// Cipher slot attached for this mount.
    slot: Option<usize>,
}

/// Guard wrapping the volume lock so the lock transition hooks fire on
/// both edges.
struct LockedVolume<'a> {
    guard: MutexGuard<'a, VolumeState>,
    hooks: Arc<dyn EventHooks>,
}

impl Deref for LockedVolume<'_> {
    type Target = VolumeState;

    fn deref(&self) -> &VolumeState {
        &self.guard
    }
}

impl DerefMut for LockedVolume<'_> {
    fn deref_mut(&mut self) -> &mut VolumeState {
        &mut self.guard
    }
}

impl Drop for LockedVolume<'_> {
    fn drop(&mut self) {
        self.hooks.post_unlock();
    }
}

/// Encrypted file storage on one flash region.
pub struct Volume<S: NorFlash + Send + 'static> {
    adapter: Arc<FlashAdapter<S>>,
    hooks: Arc<HookRegistry>,
    crypto: Option<CryptoBinding>,
    clock: Arc<dyn Clock>,
    inode_count: u32,
    state: Mutex<VolumeState>,
}

impl<S: NorFlash + Send + 'static> Volume<S> {
    /// Wrap `flash` in a volume. The device is checked against the
    /// geometry here; nothing touches the flash until [`Volume::init`].
    pub fn new(flash: S, config: VolumeConfig) -> Result<Self> {
        if config.inode_count == 0 {
            return Err(Error::InvalidInput("inode count must be nonzero"));
        }
        let hooks = Arc::new(HookRegistry::new());
        let adapter = Arc::new(FlashAdapter::new(flash, config.geometry, hooks.clone())?);
        Ok(Volume {
            adapter,
            hooks,
            crypto: config.crypto,
            clock: config.clock,
            inode_count: config.inode_count,
            state: Mutex::new(VolumeState {
                mount: MountState::Unmounted,
                fs: None,
                slot: None,
            }),
        })
    }

    fn lock(&self) -> LockedVolume<'_> {
        let guard = self.state.lock();
        let hooks = self.hooks.current();
        hooks.post_lock();
        LockedVolume { guard, hooks }
    }

    fn fs_of<'a>(state: &'a LockedVolume<'_>) -> Result<&'a Arc<FileSystem>> {
        if state.mount != MountState::Mounted {
            return Err(Error::NotMounted);
        }
        state.fs.as_ref().ok_or(Error::NotMounted)
    }

    /// Mount the volume, formatting on demand.
    ///
    /// With `force_format` set the region is always reformatted. Otherwise
    /// an existing filesystem is mounted; if that fails with a corruption
    /// signal the region is formatted once and mounted fresh. A second
    /// failure is returned to the caller and the volume stays unmounted.
    pub fn init(&self, force_format: bool) -> Result<()> {
        let mut state = self.lock();
        if state.mount != MountState::Unmounted {
            return Err(Error::InvalidInput("volume is already mounted"));
        }
        state.mount = MountState::Mounting;
        match self.mount_filesystem(force_format) {
            Ok(fs) => {
                if let Some(binding) = &self.crypto {
                    if let Err(err) = binding.service.attach(binding.context.clone()) {
                        state.mount = MountState::Unmounted;
                        return Err(err.into());
                    }
                    state.slot = Some(binding.context.slot);
                }
                state.fs = Some(fs);
                state.mount = MountState::Mounted;
                Ok(())
            }
            Err(err) => {
                state.mount = MountState::Unmounted;
                Err(err)
            }
        }
    }

    fn mount_filesystem(&self, force_format: bool) -> Result<Arc<FileSystem>> {
        // Erased-state knowledge from a previous mount is stale by
        // definition: another consumer may have touched the region.
        self.adapter.reset_erase_map();
        let device: Arc<dyn BlockDevice> = self.adapter.clone();
        if force_format {
            info!("formatting flash volume on request");
            return FileSystem::format(device, self.inode_count).map_err(Into::into);
        }
        match FileSystem::mount(device.clone()) {
            Ok(fs) => Ok(fs),
            Err(FsError::Corrupt) | Err(FsError::Device(microfs::DeviceError::Corrupt)) => {
                warn!("mount failed on corrupted volume, formatting");
                FileSystem::format(device, self.inode_count).map_err(Into::into)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Unmount the volume, flushing all cached state. With `wipe` set the
    /// whole region is erased afterwards. The volume ends up unmounted
    /// even when flushing or wiping fails.
    pub fn deinit(&self, wipe: bool) -> Result<()> {
        let mut state = self.lock();
        let fs = match (state.mount, state.fs.take()) {
            (MountState::Mounted, Some(fs)) => fs,
            _ => return Err(Error::NotMounted),
        };
        state.mount = MountState::Unmounting;
        let flush: Result<()> = fs.sync_all().map_err(Into::into);
        drop(fs);

        if let Some(slot) = state.slot.take() {
            if let Some(binding) = &self.crypto {
                if let Err(err) = binding.service.detach(slot) {
                    warn!("cipher detach failed: {err}");
                }
            }
        }
        let wiped: Result<()> = if wipe {
            info!("wiping flash volume");
            self.adapter.wipe().map_err(Into::into)
        } else {
            Ok(())
        };
        state.mount = MountState::Unmounted;
        flush.and(wiped)
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().mount == MountState::Mounted
    }

    /// Install a new hook set. Takes effect for subsequent operations.
    pub fn set_hooks(&self, hooks: Arc<dyn EventHooks>) {
        self.hooks.replace(hooks);
    }

    fn load_attr(node: &Inode) -> Result<FileAttr> {
        let mut buf = [0u8; ATTR_MAX];
        let len = node.read_attr(&mut buf)?;
        Ok(FileAttr::decode(&buf[..len]))
    }

    fn store_attr(node: &Inode, attr: &FileAttr) -> Result<()> {
        let mut buf = [0u8; ATTR_MAX];
        let len = attr.encode(&mut buf)?;
        node.write_attr(&buf[..len]).map_err(Into::into)
    }

    fn resolve_file(fs: &Arc<FileSystem>, path: &str) -> Result<Inode> {
        let (parent, name) = fs.resolve_parent(path)?;
        let node = parent.find(name)?.ok_or(Error::NotFound)?;
        if node.is_dir() {
            return Err(Error::InvalidInput("path is a directory"));
        }
        Ok(node)
    }

    fn cipher(&self, state: &LockedVolume<'_>) -> Result<(Arc<CryptoService>, usize)> {
        let binding = self
            .crypto
            .as_ref()
            .ok_or(Error::InvalidInput("volume has no cipher context"))?;
        let slot = state
            .slot
            .ok_or(Error::InvalidInput("volume has no cipher context"))?;
        Ok((binding.service.clone(), slot))
    }

    /// Write `data` as the entire new content of the file at `path`,
    /// creating a plain file if none exists. Whether the content is
    /// encrypted at rest follows the file's attribute, fixed at creation.
    pub fn save(&self, path: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_FILE_CONTENT {
            return Err(Error::InvalidInput("content too large"));
        }
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let (parent, name) = fs.resolve_parent(path)?;
        let node = match parent.find(name)? {
            Some(node) if node.is_dir() => {
                return Err(Error::InvalidInput("path is a directory"));
            }
            Some(node) => node,
            None => parent.create_file(name)?,
        };
        let mut attr = Self::load_attr(&node)?;
        if attr.encrypted {
            let (service, slot) = self.cipher(&state)?;
            if data.is_empty() {
                node.truncate(0)?;
                attr.plain_len = 0;
                attr.enc_len = 0;
            } else {
                let cipher = service.encrypt(slot, data)?;
                node.truncate(0)?;
                node.write_at(0, &cipher)?;
                attr.plain_len = data.len() as u32;
                attr.enc_len = cipher.len() as u32;
            }
            Self::store_attr(&node, &attr)?;
        } else {
            node.truncate(0)?;
            node.write_at(0, data)?;
        }
        fs.sync_all()?;
        Ok(())
    }

    /// Extend the plain file at `path` with `data`. Encrypted files cannot
    /// be appended to; the whole content must be rewritten through
    /// [`Volume::save`] so the ciphertext stays consistent.
    pub fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let node = Self::resolve_file(fs, path)?;
        let attr = Self::load_attr(&node)?;
        if attr.encrypted {
            return Err(Error::InvalidInput("cannot append to an encrypted file"));
        }
        let size = node.size()?;
        if size.saturating_add(data.len()) > MAX_FILE_CONTENT {
            return Err(Error::InvalidInput("content too large"));
        }
        if data.is_empty() {
            return Ok(());
        }
        node.write_at(size, data)?;
        fs.sync_all()?;
        Ok(())
    }

    /// Merge `data` into the plain file at `path` starting at `offset`.
    ///
    /// Stored bytes can only lose bits in this operation: the result is
    /// the bitwise AND of old and new content, mirroring what programming
    /// NOR flash in place would produce. The range must lie inside the
    /// current file.
    pub fn update(&self, path: &str, offset: usize, data: &[u8]) -> Result<()> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let node = Self::resolve_file(fs, path)?;
        let attr = Self::load_attr(&node)?;
        if attr.encrypted {
            return Err(Error::InvalidInput("cannot update an encrypted file"));
        }
        let size = node.size()?;
        if offset > size || data.len() > size - offset {
            return Err(Error::InvalidInput("update range outside file"));
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut merged = alloc::vec![0u8; data.len()];
        if node.read_at(offset, &mut merged)? != data.len() {
            return Err(Error::Corrupt);
        }
        for (have, new) in merged.iter_mut().zip(data) {
            *have &= new;
        }
        node.write_at(offset, &merged)?;
        fs.sync_all()?;
        Ok(())
    }

    /// Read file content into `buf` starting at `offset`, returning the
    /// number of bytes copied. The buffer is zeroed first, so a short read
    /// leaves well-defined content behind.
    pub fn read(&self, path: &str, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let node = Self::resolve_file(fs, path)?;
        let attr = Self::load_attr(&node)?;
        buf.fill(0);
        if !attr.encrypted {
            return node.read_at(offset, buf).map_err(Into::into);
        }

        if attr.enc_len == 0 {
            return Ok(0);
        }
        let (service, slot) = self.cipher(&state)?;
        let mut stored = alloc::vec![0u8; attr.enc_len as usize];
        if node.read_at(0, &mut stored)? != stored.len() {
            return Err(Error::Corrupt);
        }
        let plain = Zeroizing::new(service.decrypt(slot, &stored)?);
        if plain.len() != attr.plain_len as usize {
            warn!(
                "decrypted length {} disagrees with recorded length {}",
                plain.len(),
                attr.plain_len
            );
        }
        if offset >= plain.len() {
            return Ok(0);
        }
        let take = buf.len().min(plain.len() - offset);
        buf[..take].copy_from_slice(&plain[offset..offset + take]);
        Ok(take)
    }

    /// Content length of the file at `path`, as its writer saw it.
    pub fn file_len(&self, path: &str) -> Result<usize> {
        Ok(self.stat(path)?.len)
    }

    /// Metadata snapshot of the file at `path`.
    pub fn stat(&self, path: &str) -> Result<FileInfo> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let node = Self::resolve_file(fs, path)?;
        let attr = Self::load_attr(&node)?;
        let stored = node.size()?;
        Ok(FileInfo {
            len: if attr.encrypted {
                attr.plain_len as usize
            } else {
                stored
            },
            stored_len: stored,
            encrypted: attr.encrypted,
        })
    }

    /// Create an empty file. `encrypted` fixes how its content will be
    /// stored for the file's whole life.
    pub fn mkfile(&self, path: &str, encrypted: bool) -> Result<()> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        if encrypted {
            // Fail before creating anything when no cipher is bound.
            self.cipher(&state)?;
        }
        let (parent, name) = fs.resolve_parent(path)?;
        if parent.find(name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let node = parent.create_file(name)?;
        let attr = if encrypted {
            FileAttr::encrypted()
        } else {
            FileAttr::plain()
        };
        Self::store_attr(&node, &attr)?;
        fs.sync_all()?;
        Ok(())
    }

    /// Create an empty directory.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let (parent, name) = fs.resolve_parent(path)?;
        if parent.find(name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        parent.create_dir(name)?;
        fs.sync_all()?;
        Ok(())
    }

    /// Move or rename a file or directory. The destination must not exist.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        fs.rename(from, to)?;
        fs.sync_all()?;
        Ok(())
    }

    /// Remove the file or empty directory at `path`.
    pub fn remove(&self, path: &str) -> Result<()> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let (parent, name) = fs.resolve_parent(path)?;
        parent.remove(name)?;
        fs.sync_all()?;
        Ok(())
    }

    /// Names of the entries in the directory at `path`. Pass an empty
    /// string or "/" for the root.
    pub fn list(&self, path: &str) -> Result<Vec<alloc::string::String>> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        let node = fs.resolve(path)?;
        node.list().map_err(Into::into)
    }

    /// Erase blocks the filesystem no longer references.
    ///
    /// `budget_ms` bounds how long the sweep may run; `None` sweeps to
    /// completion. The report says how many blocks went through the erase
    /// path and whether the sweep covered the whole region. Erases of
    /// already-blank blocks are skipped below this layer, so a sweep over
    /// a clean region is cheap.
    pub fn cleanup(&self, budget_ms: Option<u64>) -> Result<CleanupReport> {
        let state = self.lock();
        let fs = Self::fs_of(&state)?;
        // Flush first so the used-block walk sees every live structure.
        fs.sync_all()?;
        let mut used = crate::block_set::BlockSet::new(self.adapter.block_count());
        fs.for_each_used_block(|block| used.insert(block))?;

        let start = self.clock.now_ms();
        let mut report = CleanupReport {
            processed: 0,
            finished: true,
        };
        for block in 0..self.adapter.block_count() as u32 {
            if used.contains(block) {
                continue;
            }
            if let Some(limit) = budget_ms {
                if self.clock.now_ms().saturating_sub(start) >= limit {
                    report.finished = false;
                    break;
                }
            }
            self.adapter.erase(block)?;
            report.processed += 1;
        }
        Ok(report)
    }
}
