//! Adapter from raw NOR flash to the filesystem's block device contract.
//!
//! Three rules from the flash driver are upheld here so the layers above
//! never see them: reads are word granular with word-aligned destinations,
//! programs are page granular, and a block must be erased before any of its
//! bits can be set again. The adapter also keeps a per-block erased map so
//! redundant erase cycles are skipped entirely, backed by a content scan
//! for blocks that are blank without having been marked.

use alloc::sync::Arc;

use embedded_storage::nor_flash::NorFlash;
use log::{debug, trace};
use microfs::{BlockDevice, DeviceError, DeviceResult};
use spin::Mutex;

use crate::block_set::BlockSet;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::hooks::HookRegistry;

/// Bytes read per step while scanning a block for blankness.
const SCAN_CHUNK: usize = 256;

struct AdapterState<S> {
    flash: S,
    erased: BlockSet,
}

pub(crate) struct FlashAdapter<S: NorFlash> {
    geometry: Geometry,
    hooks: Arc<HookRegistry>,
    state: Mutex<AdapterState<S>>,
}

impl<S: NorFlash + Send> FlashAdapter<S> {
    pub fn new(flash: S, geometry: Geometry, hooks: Arc<HookRegistry>) -> Result<Self> {
        if geometry.page_size() % S::WRITE_SIZE != 0 {
            return Err(Error::InvalidInput("page size below program granularity"));
        }
        if geometry.block_size() % S::ERASE_SIZE != 0 {
            return Err(Error::InvalidInput("block size below erase granularity"));
        }
        if S::READ_SIZE == 0 || 4 % S::READ_SIZE != 0 {
            return Err(Error::InvalidInput("device read granularity above a word"));
        }
        if geometry.base() as usize + geometry.len() > flash.capacity() {
            return Err(Error::InvalidInput("region exceeds device capacity"));
        }
        let block_count = geometry.block_count();
        Ok(FlashAdapter {
            geometry,
            hooks,
            state: Mutex::new(AdapterState {
                flash,
                erased: BlockSet::new(block_count),
            }),
        })
    }

    /// Forget all erased-state knowledge. Done on every mount so stale
    /// assumptions from a previous session cannot suppress a needed erase.
    pub fn reset_erase_map(&self) {
        self.state.lock().erased.clear();
    }

    /// Erase every block of the region, honoring the same skip logic as
    /// individual erases.
    pub fn wipe(&self) -> DeviceResult<()> {
        for block in 0..self.geometry.block_count() as u32 {
            self.erase(block)?;
        }
        Ok(())
    }

    fn check_range(&self, block: u32, offset: usize, len: usize) -> DeviceResult<()> {
        if block as usize >= self.geometry.block_count() {
            return Err(DeviceError::Io);
        }
        if offset + len > self.geometry.block_size() {
            return Err(DeviceError::Io);
        }
        Ok(())
    }

    /// True when every byte of `block` reads back erased.
    fn block_is_blank(&self, flash: &mut S, block: u32) -> DeviceResult<bool> {
        let mut chunk = [0u8; SCAN_CHUNK];
        let mut done = 0;
        let block_size = self.geometry.block_size();
        while done < block_size {
            let take = SCAN_CHUNK.min(block_size - done);
            let buf = &mut chunk[..take];
            flash
                .read(self.geometry.address(block, done), buf)
                .map_err(|err| {
                    debug!("blank scan read failed: {err:?}");
                    DeviceError::Io
                })?;
            if buf.iter().any(|b| *b != 0xff) {
                return Ok(false);
            }
            done += take;
        }
        Ok(true)
    }
}

impl<S: NorFlash + Send> BlockDevice for FlashAdapter<S> {
    fn block_size(&self) -> usize {
        self.geometry.block_size()
    }

    fn block_count(&self) -> usize {
        self.geometry.block_count()
    }

    fn read(&self, block: u32, offset: usize, buf: &mut [u8]) -> DeviceResult<()> {
        self.check_range(block, offset, buf.len())?;
        let address = self.geometry.address(block, offset);
        // Word granularity, including the destination pointer: several
        // flash controllers fault on narrower or misaligned accesses.
        if address % 4 != 0 || buf.len() % 4 != 0 || buf.as_ptr() as usize % 4 != 0 {
            return Err(DeviceError::Io);
        }
        let mut state = self.state.lock();
        state.flash.read(address, buf).map_err(|err| {
            debug!("flash read failed at {address:#x}: {err:?}");
            DeviceError::Io
        })
    }

    fn program(&self, block: u32, offset: usize, data: &[u8]) -> DeviceResult<()> {
        self.check_range(block, offset, data.len())?;
        let page = self.geometry.page_size();
        if offset % page != 0 || data.len() % page != 0 {
            return Err(DeviceError::Io);
        }
        let mut state = self.state.lock();
        // The block stops being erased the moment programming starts, even
        // if a later page fails.
        state.erased.remove(block);
        let mut address = self.geometry.address(block, offset);
        for chunk in data.chunks(page) {
            if let Err(err) = state.flash.write(address, chunk) {
                debug!("flash program failed at {address:#x}: {err:?}");
                return Err(DeviceError::Corrupt);
            }
            address += page as u32;
        }
        Ok(())
    }

    fn erase(&self, block: u32) -> DeviceResult<()> {
        self.check_range(block, 0, 0)?;
        let mut state = self.state.lock();
        if state.erased.contains(block) {
            return Ok(());
        }
        if self.block_is_blank(&mut state.flash, block)? {
            trace!("block {block} already blank, skipping erase");
            state.erased.insert(block);
            return Ok(());
        }
        let from = self.geometry.address(block, 0);
        let to = from + self.geometry.block_size() as u32;
        let hooks = self.hooks.current();
        hooks.pre_erase(block);
        let outcome = state.flash.erase(from, to).map_err(|err| {
            debug!("flash erase failed at {from:#x}: {err:?}");
            DeviceError::Io
        });
        hooks.post_erase(block);
        outcome?;
        state.erased.insert(block);
        Ok(())
    }

    fn sync(&self) -> DeviceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemFlash;

    type Flash = MemFlash<256, 4096>;

    const BLOCKS: usize = 8;

    fn adapter() -> (Flash, FlashAdapter<Flash>) {
        let flash = Flash::new(BLOCKS * 4096);
        let geometry = Geometry::new(0, 4096, 256, BLOCKS).unwrap();
        let adapter =
            FlashAdapter::new(flash.clone(), geometry, Arc::new(HookRegistry::new())).unwrap();
        (flash, adapter)
    }

    fn aligned_buf(len: usize) -> alloc::vec::Vec<u32> {
        alloc::vec![0u32; len / 4]
    }

    fn as_bytes_mut(words: &mut [u32]) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 4)
        }
    }

    #[test]
    fn blank_blocks_skip_the_physical_erase() {
        let (flash, adapter) = adapter();
        adapter.erase(3).unwrap();
        assert_eq!(flash.total_erases(), 0);
        // Second call short-circuits on the erased map.
        adapter.erase(3).unwrap();
        assert_eq!(flash.total_erases(), 0);
    }

    #[test]
    fn programming_invalidates_the_erased_mark() {
        let (flash, adapter) = adapter();
        adapter.erase(1).unwrap();
        adapter.program(1, 0, &[0u8; 256]).unwrap();
        adapter.erase(1).unwrap();
        assert_eq!(flash.erase_count(1), 1);
        adapter.erase(1).unwrap();
        assert_eq!(flash.erase_count(1), 1);
    }

    #[test]
    fn reads_round_trip_programs() {
        let (_flash, adapter) = adapter();
        let mut payload = [0x11u8; 512];
        payload[0] = 0xbe;
        payload[511] = 0xef;
        adapter.program(2, 512, &payload).unwrap();

        let mut words = aligned_buf(512);
        adapter.read(2, 512, as_bytes_mut(&mut words)).unwrap();
        let back = as_bytes_mut(&mut words);
        assert_eq!(back[0], 0xbe);
        assert_eq!(back[511], 0xef);
    }

    #[test]
    fn word_rule_violations_are_io_errors() {
        let (_flash, adapter) = adapter();
        let mut words = aligned_buf(8);
        let bytes = as_bytes_mut(&mut words);
        // Misaligned destination pointer.
        assert_eq!(adapter.read(0, 0, &mut bytes[1..5]), Err(DeviceError::Io));
        // Misaligned length.
        assert_eq!(adapter.read(0, 0, &mut bytes[..6]), Err(DeviceError::Io));
        // Misaligned block offset.
        assert_eq!(adapter.read(0, 2, &mut bytes[..4]), Err(DeviceError::Io));
    }

    #[test]
    fn page_rule_violations_are_io_errors() {
        let (_flash, adapter) = adapter();
        assert_eq!(adapter.program(0, 13, &[0u8; 256]), Err(DeviceError::Io));
        assert_eq!(adapter.program(0, 0, &[0u8; 100]), Err(DeviceError::Io));
        assert_eq!(adapter.program(9, 0, &[0u8; 256]), Err(DeviceError::Io));
    }

    #[test]
    fn failed_programs_report_corruption() {
        let (flash, adapter) = adapter();
        flash.set_fail_writes(true);
        assert_eq!(adapter.program(0, 0, &[0u8; 256]), Err(DeviceError::Corrupt));
        // The block is no longer considered erased even though nothing was
        // written.
        flash.set_fail_writes(false);
        adapter.program(0, 0, &[0u8; 256]).unwrap();
        adapter.erase(0).unwrap();
        assert_eq!(flash.erase_count(0), 1);
    }

    #[test]
    fn failed_erases_are_io_errors() {
        let (flash, adapter) = adapter();
        adapter.program(5, 0, &[0u8; 256]).unwrap();
        flash.set_fail_erases(true);
        assert_eq!(adapter.erase(5), Err(DeviceError::Io));
        flash.set_fail_erases(false);
        adapter.erase(5).unwrap();
    }

    #[test]
    fn wipe_erases_only_dirty_blocks() {
        let (flash, adapter) = adapter();
        adapter.program(0, 0, &[0u8; 256]).unwrap();
        adapter.program(4, 0, &[0u8; 256]).unwrap();
        adapter.wipe().unwrap();
        assert_eq!(flash.total_erases(), 2);
        assert_eq!(flash.erase_count(0), 1);
        assert_eq!(flash.erase_count(4), 1);
    }

    #[test]
    fn incompatible_drivers_are_rejected() {
        let flash = Flash::new(8 * 4096);
        let hooks = Arc::new(HookRegistry::new());
        // Page smaller than the driver's program granularity.
        let geometry = Geometry::new(0, 4096, 4, 8).unwrap();
        assert!(FlashAdapter::new(flash.clone(), geometry, hooks.clone()).is_err());
        // Region larger than the device.
        let geometry = Geometry::new(0, 4096, 256, 9).unwrap();
        assert!(FlashAdapter::new(flash, geometry, hooks).is_err());
    }
}
