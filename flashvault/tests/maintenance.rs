mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{fresh_flash, plain_volume, plain_volume_with_clock, raw_image, ManualClock};
use flashvault::{CleanupReport, Error, EventHooks};

// Geometry from `common`: one superblock, one bitmap and one inode table
// block, so data starts at block 3 and 61 blocks are sweep candidates.
const DATA_START: usize = 3;
const CANDIDATES: usize = common::BLOCKS - DATA_START;

/// Three data blocks exactly.
fn three_block_payload() -> Vec<u8> {
    vec![0x5au8; 3 * common::BLOCK_SIZE]
}

#[test]
fn formatting_blank_flash_costs_no_erases() {
    let flash = fresh_flash();
    let vol = plain_volume(flash.clone());
    vol.init(false).unwrap();
    assert!(vol.is_mounted());

    // Every block written during format was blank, so each erase was
    // skipped after a scan.
    assert_eq!(flash.total_erases(), 0);
}

#[test]
fn corrupted_superblock_is_formatted_over() {
    let flash = fresh_flash();
    {
        let vol = plain_volume(flash.clone());
        vol.init(false).unwrap();
        vol.save("marker.bin", b"before corruption").unwrap();
        vol.deinit(false).unwrap();
    }
    // Stomp the superblock. Mounting must fall back to a format.
    flash.write_raw(0, &[0u8; 64]);

    let vol = plain_volume(flash);
    vol.init(false).unwrap();
    assert!(vol.is_mounted());
    assert_eq!(vol.list("").unwrap(), Vec::<String>::new());
    vol.save("fresh.bin", b"after recovery").unwrap();
}

#[test]
fn a_failing_format_leaves_the_volume_unmounted() {
    let flash = fresh_flash();
    {
        let vol = plain_volume(flash.clone());
        vol.init(false).unwrap();
        vol.save("marker.bin", b"x").unwrap();
        vol.deinit(false).unwrap();
    }
    flash.write_raw(0, &[0u8; 64]);
    flash.set_fail_writes(true);

    // Mount fails on the bad superblock and the fallback format fails on
    // the injected write fault. Both failures reach the caller.
    let vol = plain_volume(flash.clone());
    assert_eq!(vol.init(false), Err(Error::Corrupt));
    assert!(!vol.is_mounted());
    assert_eq!(vol.list(""), Err(Error::NotMounted));

    // Once the device behaves again the next init recovers.
    flash.set_fail_writes(false);
    vol.init(false).unwrap();
    vol.save("fresh.bin", b"recovered").unwrap();
    let mut buf = [0u8; 9];
    assert_eq!(vol.read("fresh.bin", 0, &mut buf).unwrap(), 9);
    assert_eq!(&buf, b"recovered");
}

#[test]
fn deinit_with_wipe_blanks_the_region() {
    let flash = fresh_flash();
    let vol = plain_volume(flash.clone());
    vol.init(false).unwrap();
    vol.mkdir("d").unwrap();
    vol.save("d/f.bin", &three_block_payload()).unwrap();

    vol.deinit(true).unwrap();
    assert!(!vol.is_mounted());
    assert!(raw_image(&flash).iter().all(|b| *b == 0xff));

    // Re-initializing the blanked region formats it without any physical
    // erase work.
    let before = flash.total_erases();
    vol.init(false).unwrap();
    assert_eq!(vol.list("").unwrap(), Vec::<String>::new());
    assert_eq!(flash.total_erases(), before);
}

#[test]
fn cleanup_erases_exactly_the_stale_blocks() {
    let flash = fresh_flash();
    let vol = plain_volume(flash.clone());
    vol.init(false).unwrap();

    // Nothing to reclaim on a fresh volume, and blank candidates cost no
    // physical erases.
    let before = flash.total_erases();
    let report = vol.cleanup(None).unwrap();
    assert_eq!(
        report,
        CleanupReport {
            processed: CANDIDATES,
            finished: true
        }
    );
    assert_eq!(flash.total_erases(), before);

    // A removed three-block file leaves its blocks and the emptied root
    // directory block carrying stale data.
    vol.save("junk.bin", &three_block_payload()).unwrap();
    vol.remove("junk.bin").unwrap();

    let before = flash.total_erases();
    let report = vol.cleanup(None).unwrap();
    assert_eq!(report.processed, CANDIDATES);
    assert!(report.finished);
    assert_eq!(flash.total_erases(), before + 4);
    for block in DATA_START..DATA_START + 4 {
        assert_eq!(flash.erase_count(block), 1, "block {block}");
    }

    // A second sweep finds everything already erased.
    let before = flash.total_erases();
    let report = vol.cleanup(None).unwrap();
    assert_eq!(report.processed, CANDIDATES);
    assert_eq!(flash.total_erases(), before);

    // Rewriting the same file lands on the swept blocks and skips their
    // erases; only the metadata blocks pay for new erase cycles.
    let before = flash.total_erases();
    vol.save("junk.bin", &three_block_payload()).unwrap();
    assert_eq!(flash.total_erases(), before + 2);
}

#[test]
fn cleanup_honors_its_time_budget() {
    let flash = fresh_flash();
    let vol = plain_volume_with_clock(flash.clone(), Arc::new(ManualClock::stepping(2)));
    vol.init(false).unwrap();
    vol.save("junk.bin", &three_block_payload()).unwrap();
    vol.remove("junk.bin").unwrap();

    // The clock advances 2 ms per reading, so a 5 ms budget admits two
    // candidates before the deadline check trips.
    let report = vol.cleanup(Some(5)).unwrap();
    assert_eq!(
        report,
        CleanupReport {
            processed: 2,
            finished: false
        }
    );

    // An unbounded sweep finishes the job.
    let before = flash.total_erases();
    let report = vol.cleanup(None).unwrap();
    assert_eq!(report.processed, CANDIDATES);
    assert!(report.finished);
    assert_eq!(flash.total_erases(), before + 2);
}

#[test]
fn zero_budget_processes_nothing() {
    let vol = plain_volume(fresh_flash());
    vol.init(false).unwrap();
    let report = vol.cleanup(Some(0)).unwrap();
    assert_eq!(
        report,
        CleanupReport {
            processed: 0,
            finished: false
        }
    );

    // A budget the frozen clock can never exhaust completes the sweep.
    let report = vol.cleanup(Some(1_000)).unwrap();
    assert_eq!(
        report,
        CleanupReport {
            processed: CANDIDATES,
            finished: true
        }
    );
}

#[derive(Default)]
struct CountingHooks {
    pre_erase: AtomicU32,
    post_erase: AtomicU32,
    locks: AtomicU32,
    unlocks: AtomicU32,
}

impl EventHooks for CountingHooks {
    fn pre_erase(&self, _block: u32) {
        self.pre_erase.fetch_add(1, Ordering::Relaxed);
    }

    fn post_erase(&self, _block: u32) {
        self.post_erase.fetch_add(1, Ordering::Relaxed);
    }

    fn post_lock(&self) {
        self.locks.fetch_add(1, Ordering::Relaxed);
    }

    fn post_unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn hooks_bracket_erases_and_lock_transitions() {
    let flash = fresh_flash();
    let vol = plain_volume(flash.clone());
    vol.init(false).unwrap();

    let hooks = Arc::new(CountingHooks::default());
    vol.set_hooks(hooks.clone());
    let before = flash.total_erases();

    vol.save("junk.bin", &three_block_payload()).unwrap();
    vol.remove("junk.bin").unwrap();
    vol.cleanup(None).unwrap();

    let physical = (flash.total_erases() - before) as u32;
    assert!(physical > 0);
    // Erase hooks fire around physical erases only; skipped erases stay
    // silent.
    assert_eq!(hooks.pre_erase.load(Ordering::Relaxed), physical);
    assert_eq!(hooks.post_erase.load(Ordering::Relaxed), physical);
    // One lock and one unlock per operation.
    assert_eq!(hooks.locks.load(Ordering::Relaxed), 3);
    assert_eq!(hooks.unlocks.load(Ordering::Relaxed), 3);

    // The unlock hook fires on failing operations too.
    let mut buf = [0u8; 4];
    assert_eq!(vol.read("missing.bin", 0, &mut buf), Err(Error::NotFound));
    assert_eq!(hooks.locks.load(Ordering::Relaxed), 4);
    assert_eq!(hooks.unlocks.load(Ordering::Relaxed), 4);
}
