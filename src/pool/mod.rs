//! Fixed-capacity pools of VMs, VPs and VSs.
//!
//! Every pool is an arena of slots addressed by a `u16` id. A pool lock
//! serializes allocation and deallocation, and each slot has its own lock for
//! accessors. When more than one pool lock is held the order is VS pool, then
//! VP pool, then VM pool. Slot locks are always taken last and never nested
//! within the same pool.

mod vm;
mod vp;
mod vs;

use spin::{Mutex, MutexGuard};

use crate::{HyperError, HyperResult};

pub use vm::{Vm, VmPool};
pub use vp::{Vp, VpPool};
pub use vs::{Vs, VsPool};

/// Lifecycle state of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatedStatus {
    /// Free for allocation.
    Deallocated,
    /// In use.
    Allocated,
    /// Teardown failed half way. The slot is never handed out again.
    Zombie,
}

/// State every pool slot carries.
pub(crate) trait Slot {
    fn new(id: u16) -> Self;
    fn status(&self) -> AllocatedStatus;
}

/// The arena backing a pool.
pub(crate) struct Slots<T: Slot, const N: usize> {
    lock: Mutex<()>,
    slots: [Mutex<T>; N],
}

impl<T: Slot, const N: usize> Slots<T, N> {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            slots: core::array::from_fn(|i| Mutex::new(T::new(i as u16))),
        }
    }

    /// Serializes allocation and deallocation.
    pub fn lock_pool(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Locks the slot for `id`, or fails with `OutOfRange`.
    pub fn get(&self, id: u16) -> HyperResult<MutexGuard<'_, T>> {
        self.slots
            .get(id as usize)
            .map(|slot| slot.lock())
            .ok_or(HyperError::OutOfRange)
    }

    /// Finds the first free slot and hands it to `init`. The caller must hold
    /// the pool lock.
    pub fn allocate_with<F>(&self, init: F) -> HyperResult<u16>
    where
        F: FnOnce(u16, &mut T) -> HyperResult,
    {
        for (id, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.status() == AllocatedStatus::Deallocated {
                init(id as u16, &mut slot)?;
                return Ok(id as u16);
            }
        }
        Err(HyperError::NoMemory)
    }

    /// Returns true if any allocated slot satisfies `pred`.
    pub fn any<F: Fn(&T) -> bool>(&self, pred: F) -> bool {
        self.slots.iter().any(|slot| {
            let slot = slot.lock();
            slot.status() == AllocatedStatus::Allocated && pred(&slot)
        })
    }

    /// Number of slots that are allocated.
    pub fn count_allocated(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().status() == AllocatedStatus::Allocated)
            .count()
    }

    pub fn status(&self, id: u16) -> AllocatedStatus {
        self.get(id)
            .map(|slot| slot.status())
            .unwrap_or(AllocatedStatus::Deallocated)
    }
}
