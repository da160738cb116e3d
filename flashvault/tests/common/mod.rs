#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flashvault::sim::MemFlash;
use flashvault::{
    AesKey, Clock, CryptoBinding, CryptoContext, CryptoService, Geometry, Volume, VolumeConfig,
};

pub type TestFlash = MemFlash<256, 4096>;

pub const BLOCK_SIZE: usize = 4096;
pub const BLOCKS: usize = 64;
pub const INODES: u32 = 32;

pub const TEST_KEY: [u8; 16] = [0x42; 16];
pub const TEST_IV: [u8; 16] = [0x24; 16];

pub fn fresh_flash() -> TestFlash {
    TestFlash::new(BLOCKS * BLOCK_SIZE)
}

pub fn geometry() -> Geometry {
    Geometry::new(0, BLOCK_SIZE, 256, BLOCKS).unwrap()
}

/// Clock advancing by a fixed step on every reading, which makes time pass
/// deterministically inside a single call tree.
pub struct ManualClock {
    now: AtomicU64,
    step: u64,
}

impl ManualClock {
    pub fn frozen() -> Self {
        ManualClock {
            now: AtomicU64::new(0),
            step: 0,
        }
    }

    pub fn stepping(step: u64) -> Self {
        ManualClock {
            now: AtomicU64::new(0),
            step,
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(self.step, Ordering::Relaxed)
    }
}

pub fn plain_volume(flash: TestFlash) -> Volume<TestFlash> {
    plain_volume_with_clock(flash, Arc::new(ManualClock::frozen()))
}

pub fn plain_volume_with_clock(flash: TestFlash, clock: Arc<dyn Clock>) -> Volume<TestFlash> {
    Volume::new(
        flash,
        VolumeConfig {
            geometry: geometry(),
            inode_count: INODES,
            crypto: None,
            clock,
        },
    )
    .unwrap()
}

pub fn test_context(slot: usize) -> CryptoContext {
    CryptoContext {
        key: AesKey::from_bytes(&TEST_KEY).unwrap(),
        iv: TEST_IV,
        slot,
    }
}

pub fn crypto_volume(
    flash: TestFlash,
    service: Arc<CryptoService>,
    slot: usize,
) -> Volume<TestFlash> {
    Volume::new(
        flash,
        VolumeConfig {
            geometry: geometry(),
            inode_count: INODES,
            crypto: Some(CryptoBinding {
                service,
                context: test_context(slot),
            }),
            clock: Arc::new(ManualClock::frozen()),
        },
    )
    .unwrap()
}

/// Dump the whole simulated part.
pub fn raw_image(flash: &TestFlash) -> Vec<u8> {
    let mut image = vec![0u8; BLOCKS * BLOCK_SIZE];
    flash.read_raw(0, &mut image);
    image
}

pub fn image_contains(image: &[u8], needle: &[u8]) -> bool {
    image.windows(needle.len()).any(|w| w == needle)
}
