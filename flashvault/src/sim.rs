//! In-memory NOR flash for tests and host tooling.

use alloc::sync::Arc;
use alloc::vec::Vec;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use spin::Mutex;

/// Failures the simulated part can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFlashError {
    NotAligned,
    OutOfBounds,
    /// Injected fault.
    Fault,
}

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            MemFlashError::NotAligned => NorFlashErrorKind::NotAligned,
            MemFlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            MemFlashError::Fault => NorFlashErrorKind::Other,
        }
    }
}

struct FlashState {
    data: Vec<u8>,
    sector_erases: Vec<u32>,
    fail_writes: bool,
    fail_erases: bool,
}

/// Simulated NOR flash with `PAGE`-byte program and `SECTOR`-byte erase
/// granules.
///
/// A program may only clear bits; attempting to set an unerased bit fails
/// the call, which makes discipline violations in the layers above loud.
/// Clones share the same backing state, so a test can keep one handle for
/// counters and fault injection while the volume owns the other.
#[derive(Clone)]
pub struct MemFlash<const PAGE: usize, const SECTOR: usize> {
    state: Arc<Mutex<FlashState>>,
}

impl<const PAGE: usize, const SECTOR: usize> MemFlash<PAGE, SECTOR> {
    pub fn new(capacity: usize) -> Self {
        assert!(PAGE > 0 && SECTOR % PAGE == 0, "sector must be a page multiple");
        assert!(capacity > 0 && capacity % SECTOR == 0, "capacity must be a sector multiple");
        MemFlash {
            state: Arc::new(Mutex::new(FlashState {
                data: alloc::vec![0xff; capacity],
                sector_erases: alloc::vec![0; capacity / SECTOR],
                fail_writes: false,
                fail_erases: false,
            })),
        }
    }

    /// Erase cycles `sector` has seen.
    pub fn erase_count(&self, sector: usize) -> u32 {
        self.state.lock().sector_erases[sector]
    }

    /// Erase cycles across the whole part.
    pub fn total_erases(&self) -> u32 {
        self.state.lock().sector_erases.iter().sum()
    }

    /// Make every subsequent program operation fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make every subsequent erase operation fail.
    pub fn set_fail_erases(&self, fail: bool) {
        self.state.lock().fail_erases = fail;
    }

    /// Copy bytes out, bypassing the NOR access rules.
    pub fn read_raw(&self, offset: usize, buf: &mut [u8]) {
        let state = self.state.lock();
        buf.copy_from_slice(&state.data[offset..offset + buf.len()]);
    }

    /// Overwrite bytes directly, bypassing the NOR access rules. Meant for
    /// seeding corruption in tests.
    pub fn write_raw(&self, offset: usize, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl<const PAGE: usize, const SECTOR: usize> ErrorType for MemFlash<PAGE, SECTOR> {
    type Error = MemFlashError;
}

impl<const PAGE: usize, const SECTOR: usize> ReadNorFlash for MemFlash<PAGE, SECTOR> {
    const READ_SIZE: usize = 4;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset % Self::READ_SIZE != 0 || bytes.len() % Self::READ_SIZE != 0 {
            return Err(MemFlashError::NotAligned);
        }
        let state = self.state.lock();
        let end = offset.checked_add(bytes.len()).ok_or(MemFlashError::OutOfBounds)?;
        if end > state.data.len() {
            return Err(MemFlashError::OutOfBounds);
        }
        bytes.copy_from_slice(&state.data[offset..end]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.state.lock().data.len()
    }
}

impl<const PAGE: usize, const SECTOR: usize> NorFlash for MemFlash<PAGE, SECTOR> {
    const WRITE_SIZE: usize = PAGE;
    const ERASE_SIZE: usize = SECTOR;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        if from % SECTOR != 0 || to % SECTOR != 0 {
            return Err(MemFlashError::NotAligned);
        }
        let mut state = self.state.lock();
        if from > to || to > state.data.len() {
            return Err(MemFlashError::OutOfBounds);
        }
        if state.fail_erases {
            return Err(MemFlashError::Fault);
        }
        state.data[from..to].fill(0xff);
        for sector in from / SECTOR..to / SECTOR {
            state.sector_erases[sector] += 1;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset % PAGE != 0 || bytes.len() % PAGE != 0 {
            return Err(MemFlashError::NotAligned);
        }
        let mut state = self.state.lock();
        let end = offset.checked_add(bytes.len()).ok_or(MemFlashError::OutOfBounds)?;
        if end > state.data.len() {
            return Err(MemFlashError::OutOfBounds);
        }
        if state.fail_writes {
            return Err(MemFlashError::Fault);
        }
        for (have, want) in state.data[offset..end].iter_mut().zip(bytes) {
            if *want & !*have != 0 {
                return Err(MemFlashError::Fault);
            }
            *have = *want;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flash = MemFlash<256, 4096>;

    #[test]
    fn program_only_clears_bits() {
        let mut flash = Flash::new(8192);
        flash.write(0, &[0u8; 256]).unwrap();
        // Setting bits back without an erase must fail.
        assert_eq!(flash.write(0, &[1u8; 256]), Err(MemFlashError::Fault));
        flash.erase(0, 4096).unwrap();
        flash.write(0, &[1u8; 256]).unwrap();
        assert_eq!(flash.erase_count(0), 1);
    }

    #[test]
    fn alignment_is_enforced() {
        let mut flash = Flash::new(8192);
        assert_eq!(flash.write(13, &[0u8; 256]), Err(MemFlashError::NotAligned));
        assert_eq!(flash.write(0, &[0u8; 100]), Err(MemFlashError::NotAligned));
        assert_eq!(flash.erase(0, 100), Err(MemFlashError::NotAligned));
        let mut buf = [0u8; 3];
        assert_eq!(flash.read(0, &mut buf), Err(MemFlashError::NotAligned));
    }

    #[test]
    fn clones_share_state() {
        let flash = Flash::new(8192);
        let mut writer = flash.clone();
        writer.write(256, &[0xaau8; 256]).unwrap();
        let mut back = [0u8; 4];
        flash.read_raw(256, &mut back);
        assert_eq!(back, [0xaa; 4]);
    }

    #[test]
    fn injected_faults_fire() {
        let flash = Flash::new(8192);
        let mut dev = flash.clone();
        flash.set_fail_writes(true);
        assert_eq!(dev.write(0, &[0u8; 256]), Err(MemFlashError::Fault));
        flash.set_fail_writes(false);
        dev.write(0, &[0u8; 256]).unwrap();
        flash.set_fail_erases(true);
        assert_eq!(dev.erase(0, 4096), Err(MemFlashError::Fault));
    }
}
