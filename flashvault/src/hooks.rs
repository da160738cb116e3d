//! Instrumentation callbacks.

use alloc::sync::Arc;

use spin::Mutex;

/// Observation points around long-running flash work and volume lock
/// transitions.
///
/// Implementations run on the calling task while internal locks are held,
/// so they must be quick and must not call back into the volume. Typical
/// uses are watchdog feeding and RTOS-specific yield points around slow
/// erases.
pub trait EventHooks: Send + Sync {
    /// About to erase `block`.
    fn pre_erase(&self, _block: u32) {}
    /// Finished (or failed) erasing `block`.
    fn post_erase(&self, _block: u32) {}
    /// The volume lock was just taken.
    fn post_lock(&self) {}
    /// The volume lock is about to be released.
    fn post_unlock(&self) {}
}

/// Hook set that does nothing. Active until a caller installs its own.
pub struct NoopHooks;

impl EventHooks for NoopHooks {}

/// Shared, swappable hook installation.
pub(crate) struct HookRegistry {
    active: Mutex<Arc<dyn EventHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry {
            active: Mutex::new(Arc::new(NoopHooks)),
        }
    }

    /// Swap the active hook set. Operations already in flight keep the set
    /// they started with.
    pub fn replace(&self, hooks: Arc<dyn EventHooks>) {
        *self.active.lock() = hooks;
    }

    pub fn current(&self) -> Arc<dyn EventHooks> {
        self.active.lock().clone()
    }
}
