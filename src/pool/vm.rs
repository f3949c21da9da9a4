use super::{AllocatedStatus, Slot, Slots, VpPool};
use crate::config::{MAX_PPS, MAX_VMS};
use crate::syscall::BF_INVALID_ID;
use crate::{HyperError, HyperResult, Tls};

/// A virtual machine.
#[derive(Debug)]
pub struct Vm {
    id: u16,
    status: AllocatedStatus,
    active: [bool; MAX_PPS],
}

impl Slot for Vm {
    fn new(id: u16) -> Self {
        Self {
            id,
            status: AllocatedStatus::Deallocated,
            active: [false; MAX_PPS],
        }
    }

    fn status(&self) -> AllocatedStatus {
        self.status
    }
}

impl Vm {
    /// Lowest core this VM is active on.
    fn first_active(&self) -> Option<u16> {
        self.active.iter().position(|&a| a).map(|pp| pp as u16)
    }
}

/// Pool of [`Vm`]s.
pub struct VmPool {
    slots: Slots<Vm, MAX_VMS>,
}

impl VmPool {
    pub fn new() -> Self {
        Self {
            slots: Slots::new(),
        }
    }

    pub(crate) fn lock_pool(&self) -> spin::MutexGuard<'_, ()> {
        self.slots.lock_pool()
    }

    /// Allocates a VM and returns its id.
    pub fn allocate(&self) -> HyperResult<u16> {
        let _pool = self.slots.lock_pool();
        let vmid = self.slots.allocate_with(|_, vm| {
            vm.status = AllocatedStatus::Allocated;
            vm.active = [false; MAX_PPS];
            Ok(())
        })?;
        debug!("[MK] vm {:#x} allocated", vmid);
        Ok(vmid)
    }

    /// Frees `vmid`. Freeing a VM that is already free succeeds.
    ///
    /// Fails with `BadState` if the VM is active on any core or still owns a
    /// VP.
    pub fn deallocate(&self, vp_pool: &VpPool, vmid: u16) -> HyperResult {
        let _vps = vp_pool.lock_pool();
        let _pool = self.slots.lock_pool();
        let mut vm = self.slots.get(vmid)?;
        match vm.status {
            AllocatedStatus::Deallocated => return Ok(()),
            AllocatedStatus::Zombie => return Err(HyperError::BadState),
            AllocatedStatus::Allocated => {}
        }
        if let Some(ppid) = vm.first_active() {
            error!("[MK] vm {:#x} is still active on pp {:#x}", vmid, ppid);
            return Err(HyperError::BadState);
        }
        if vp_pool.is_vm_assigned(vmid) {
            error!("[MK] vm {:#x} still has vps assigned", vmid);
            return Err(HyperError::BadState);
        }
        vm.status = AllocatedStatus::Deallocated;
        debug!("[MK] vm {:#x} deallocated", vmid);
        Ok(())
    }

    pub fn is_allocated(&self, vmid: u16) -> bool {
        self.slots.status(vmid) == AllocatedStatus::Allocated
    }

    pub fn is_deallocated(&self, vmid: u16) -> bool {
        self.slots.status(vmid) == AllocatedStatus::Deallocated
    }

    /// Lowest core `vmid` is active on, or `BF_INVALID_ID`.
    pub fn is_active(&self, vmid: u16) -> u16 {
        self.slots
            .get(vmid)
            .ok()
            .filter(|vm| vm.status == AllocatedStatus::Allocated)
            .and_then(|vm| vm.first_active())
            .unwrap_or(BF_INVALID_ID)
    }

    pub fn is_active_on_this_pp(&self, tls: &Tls, vmid: u16) -> bool {
        self.slots
            .get(vmid)
            .map(|vm| vm.status == AllocatedStatus::Allocated && vm.active[tls.ppid as usize])
            .unwrap_or(false)
    }

    /// Makes `vmid` the active VM on this core. The core must have no active
    /// VM.
    pub fn set_active(&self, tls: &mut Tls, vmid: u16) -> HyperResult {
        if tls.active_vmid != BF_INVALID_ID {
            return Err(HyperError::BadState);
        }
        let mut vm = self.slots.get(vmid)?;
        if vm.status != AllocatedStatus::Allocated {
            return Err(HyperError::BadState);
        }
        vm.active[tls.ppid as usize] = true;
        tls.active_vmid = vmid;
        Ok(())
    }

    /// Clears `vmid` as this core's active VM. `BF_INVALID_ID` is a no-op.
    pub fn set_inactive(&self, tls: &mut Tls, vmid: u16) -> HyperResult {
        if vmid == BF_INVALID_ID {
            return Ok(());
        }
        if tls.active_vmid != vmid {
            return Err(HyperError::BadState);
        }
        let mut vm = self.slots.get(vmid)?;
        vm.active[tls.ppid as usize] = false;
        tls.active_vmid = BF_INVALID_ID;
        Ok(())
    }

    /// Number of allocated VMs.
    pub fn count_allocated(&self) -> usize {
        self.slots.count_allocated()
    }

    /// Logs the state of `vmid`.
    pub fn dump(&self, vmid: u16) {
        match self.slots.get(vmid) {
            Ok(vm) => info!(
                "[MK] vm {:#06x}: {:?}, active on pp {:#06x}",
                vm.id,
                vm.status,
                vm.first_active().unwrap_or(BF_INVALID_ID)
            ),
            Err(_) => info!("[MK] vm {:#06x}: out of range", vmid),
        }
    }
}
