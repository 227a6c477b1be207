//! An allocator behind a spin lock.
//!
//! [`DrmMm`] itself does no locking. GPU memory managers usually guard one
//! allocator per address space with a single lock held across each
//! insert/remove/scan sequence; [`SharedDrmMm`] is that lock, with closure
//! access in the style of the kernel's `with_*` accessors.

use core::cell::UnsafeCell;
use core::fmt;

use self::loom_compat::{AtomicBool, Ordering, spin_hint};
use crate::color::ColorAdjust;
use crate::mm::DrmMm;

/// Atomics from loom or shuttle under `cfg(loom)` / `cfg(shuttle)`, from
/// `core` otherwise.
mod loom_compat {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicBool, Ordering};

    #[cfg(all(shuttle, not(loom)))]
    pub(crate) use shuttle::sync::atomic::{AtomicBool, Ordering};

    #[cfg(not(any(loom, shuttle)))]
    pub(crate) use core::sync::atomic::{AtomicBool, Ordering};

    /// Called while spinning on a held lock. The model checkers need an
    /// explicit yield to make progress.
    #[inline]
    pub(crate) fn spin_hint() {
        #[cfg(loom)]
        loom::thread::yield_now();
        #[cfg(all(shuttle, not(loom)))]
        shuttle::thread::yield_now();
        #[cfg(not(any(loom, shuttle)))]
        core::hint::spin_loop();
    }
}

/// A [`DrmMm`] guarded by a test-and-test-and-set spin lock.
pub struct SharedDrmMm<C: ColorAdjust = ()> {
    locked: AtomicBool,
    mm: UnsafeCell<DrmMm<C>>,
}

// SAFETY: the lock hands out the allocator to one thread at a time, and the
// allocator only holds plain data plus `C`.
unsafe impl<C: ColorAdjust + Send> Send for SharedDrmMm<C> {}
unsafe impl<C: ColorAdjust + Send> Sync for SharedDrmMm<C> {}

impl<C: ColorAdjust> SharedDrmMm<C> {
    /// Wraps an allocator.
    pub fn new(mm: DrmMm<C>) -> Self {
        Self {
            locked: AtomicBool::new(false),
            mm: UnsafeCell::new(mm),
        }
    }

    /// Runs `f` with exclusive access to the allocator, spinning until the
    /// lock is free.
    pub fn with<R>(&self, f: impl FnOnce(&mut DrmMm<C>) -> R) -> R {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return self.locked_with(f);
            }
            while self.locked.load(Ordering::Relaxed) {
                spin_hint();
            }
        }
    }

    /// Runs `f` with exclusive access to the allocator if the lock is free;
    /// returns `None` without running it otherwise.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut DrmMm<C>) -> R) -> Option<R> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then(|| self.locked_with(f))
    }

    /// Returns the allocator. No locking is needed: `&mut self` is exclusive.
    pub fn get_mut(&mut self) -> &mut DrmMm<C> {
        self.mm.get_mut()
    }

    /// Unwraps the allocator.
    pub fn into_inner(self) -> DrmMm<C> {
        self.mm.into_inner()
    }

    /// Runs `f` on the allocator. The caller holds the lock; it is released
    /// when this returns or unwinds.
    fn locked_with<R>(&self, f: impl FnOnce(&mut DrmMm<C>) -> R) -> R {
        let _unlock = Unlock(&self.locked);
        // SAFETY: the lock is held, so no other reference to the allocator
        // exists until `_unlock` is dropped.
        let mm = unsafe { &mut *self.mm.get() };
        f(mm)
    }
}

impl<C: ColorAdjust> fmt::Debug for SharedDrmMm<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDrmMm")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Releases the lock on drop.
struct Unlock<'a>(&'a AtomicBool);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}



#[cfg(all(test, shuttle, not(loom)))]
mod shuttle_tests {
    use shuttle::sync::Arc;
    use shuttle::thread;

    use super::*;
    use crate::mode::SearchPolicy;

    #[test]
    fn insert_remove_churn() {
        shuttle::check_random(
            || {
                let shared = Arc::new(SharedDrmMm::new(DrmMm::new(0, 256)));
                let handles: Vec<_> = (0..3)
                    .map(|_| {
                        let shared = Arc::clone(&shared);
                        thread::spawn(move || {
                            for _ in 0..4 {
                                let id = shared.with(|mm| {
                                    let id = mm.create_node();
                                    mm.insert_node(id, 16, 0, SearchPolicy::BestFit).unwrap();
                                    id
                                });
                                shared.with(|mm| {
                                    mm.remove_node(id);
                                    mm.destroy_node(id);
                                });
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
                shared.with(|mm| assert!(mm.is_clean()));
            },
            100,
        );
    }
}
