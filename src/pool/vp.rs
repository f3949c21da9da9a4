use super::{AllocatedStatus, Slot, Slots, VmPool, VsPool};
use crate::config::MAX_VPS;
use crate::syscall::BF_INVALID_ID;
use crate::{HyperError, HyperResult, MkCraftHal, Tls};

/// A virtual processor, owned by one VM and assigned to one core.
#[derive(Debug)]
pub struct Vp {
    id: u16,
    status: AllocatedStatus,
    assigned_vmid: u16,
    assigned_ppid: u16,
    active_ppid: Option<u16>,
}

impl Slot for Vp {
    fn new(id: u16) -> Self {
        Self {
            id,
            status: AllocatedStatus::Deallocated,
            assigned_vmid: BF_INVALID_ID,
            assigned_ppid: BF_INVALID_ID,
            active_ppid: None,
        }
    }

    fn status(&self) -> AllocatedStatus {
        self.status
    }
}

/// Pool of [`Vp`]s.
pub struct VpPool {
    slots: Slots<Vp, MAX_VPS>,
}

impl VpPool {
    pub fn new() -> Self {
        Self {
            slots: Slots::new(),
        }
    }

    pub(crate) fn lock_pool(&self) -> spin::MutexGuard<'_, ()> {
        self.slots.lock_pool()
    }

    /// Allocates a VP owned by `vmid` and assigned to core `ppid`.
    ///
    /// Fails with `NotFound` if `vmid` is not allocated.
    pub fn allocate(&self, vm_pool: &VmPool, vmid: u16, ppid: u16) -> HyperResult<u16> {
        let _pool = self.slots.lock_pool();
        let _vms = vm_pool.lock_pool();
        if !vm_pool.is_allocated(vmid) {
            error!("[MK] vp cannot be assigned to dead vm {:#x}", vmid);
            return Err(HyperError::NotFound);
        }
        let vpid = self.slots.allocate_with(|_, vp| {
            vp.status = AllocatedStatus::Allocated;
            vp.assigned_vmid = vmid;
            vp.assigned_ppid = ppid;
            vp.active_ppid = None;
            Ok(())
        })?;
        debug!("[MK] vp {:#x} allocated to vm {:#x} on pp {:#x}", vpid, vmid, ppid);
        Ok(vpid)
    }

    /// Frees `vpid`. Freeing a VP that is already free succeeds.
    ///
    /// Fails with `BadState` if the VP is active or still owns a VS.
    pub fn deallocate<H: MkCraftHal>(&self, vs_pool: &VsPool<H>, vpid: u16) -> HyperResult {
        let _vss = vs_pool.lock_pool();
        let _pool = self.slots.lock_pool();
        let mut vp = self.slots.get(vpid)?;
        match vp.status {
            AllocatedStatus::Deallocated => return Ok(()),
            AllocatedStatus::Zombie => return Err(HyperError::BadState),
            AllocatedStatus::Allocated => {}
        }
        if let Some(ppid) = vp.active_ppid {
            error!("[MK] vp {:#x} is still active on pp {:#x}", vpid, ppid);
            return Err(HyperError::BadState);
        }
        if vs_pool.is_vp_assigned(vpid) {
            error!("[MK] vp {:#x} still has vss assigned", vpid);
            return Err(HyperError::BadState);
        }
        *vp = Vp::new(vpid);
        debug!("[MK] vp {:#x} deallocated", vpid);
        Ok(())
    }

    pub fn is_allocated(&self, vpid: u16) -> bool {
        self.slots.status(vpid) == AllocatedStatus::Allocated
    }

    pub fn is_deallocated(&self, vpid: u16) -> bool {
        self.slots.status(vpid) == AllocatedStatus::Deallocated
    }

    fn read<F: Fn(&Vp) -> u16>(&self, vpid: u16, f: F) -> u16 {
        self.slots
            .get(vpid)
            .ok()
            .filter(|vp| vp.status == AllocatedStatus::Allocated)
            .map(|vp| f(&vp))
            .unwrap_or(BF_INVALID_ID)
    }

    /// The VM owning `vpid`, or `BF_INVALID_ID`.
    pub fn assigned_vm(&self, vpid: u16) -> u16 {
        self.read(vpid, |vp| vp.assigned_vmid)
    }

    /// The core `vpid` runs on, or `BF_INVALID_ID`.
    pub fn assigned_pp(&self, vpid: u16) -> u16 {
        self.read(vpid, |vp| vp.assigned_ppid)
    }

    /// The core `vpid` is active on, or `BF_INVALID_ID`.
    pub fn is_active(&self, vpid: u16) -> u16 {
        self.read(vpid, |vp| vp.active_ppid.unwrap_or(BF_INVALID_ID))
    }

    pub fn is_active_on_this_pp(&self, tls: &Tls, vpid: u16) -> bool {
        self.is_active(vpid) == tls.ppid
    }

    /// Whether any allocated VP belongs to `vmid`.
    pub fn is_vm_assigned(&self, vmid: u16) -> bool {
        self.slots.any(|vp| vp.assigned_vmid == vmid)
    }

    /// Makes `vpid` this core's active VP. The VP must be assigned to this
    /// core and not active anywhere.
    pub fn set_active(&self, tls: &mut Tls, vpid: u16) -> HyperResult {
        if tls.active_vpid != BF_INVALID_ID {
            return Err(HyperError::BadState);
        }
        let mut vp = self.slots.get(vpid)?;
        if vp.status != AllocatedStatus::Allocated
            || vp.active_ppid.is_some()
            || vp.assigned_ppid != tls.ppid
        {
            return Err(HyperError::BadState);
        }
        vp.active_ppid = Some(tls.ppid);
        tls.active_vpid = vpid;
        Ok(())
    }

    /// Clears `vpid` as this core's active VP. `BF_INVALID_ID` is a no-op.
    pub fn set_inactive(&self, tls: &mut Tls, vpid: u16) -> HyperResult {
        if vpid == BF_INVALID_ID {
            return Ok(());
        }
        if tls.active_vpid != vpid {
            return Err(HyperError::BadState);
        }
        let mut vp = self.slots.get(vpid)?;
        vp.active_ppid = None;
        tls.active_vpid = BF_INVALID_ID;
        Ok(())
    }

    /// Reassigns an inactive VP to core `ppid`.
    pub fn migrate(&self, ppid: u16, vpid: u16) -> HyperResult {
        let mut vp = self.slots.get(vpid)?;
        if vp.status != AllocatedStatus::Allocated || vp.active_ppid.is_some() {
            return Err(HyperError::BadState);
        }
        vp.assigned_ppid = ppid;
        Ok(())
    }

    /// Number of allocated VPs.
    pub fn count_allocated(&self) -> usize {
        self.slots.count_allocated()
    }

    /// Logs the state of `vpid`.
    pub fn dump(&self, vpid: u16) {
        match self.slots.get(vpid) {
            Ok(vp) => info!(
                "[MK] vp {:#06x}: {:?}, vm {:#06x}, pp {:#06x}, active {:#06x}",
                vp.id,
                vp.status,
                vp.assigned_vmid,
                vp.assigned_ppid,
                vp.active_ppid.unwrap_or(BF_INVALID_ID)
            ),
            Err(_) => info!("[MK] vp {:#06x}: out of range", vpid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateSave;

    struct Pools {
        vms: VmPool,
        vps: VpPool,
        vss: VsPool<crate::test_support::MockHal>,
    }

    fn pools() -> Pools {
        Pools {
            vms: VmPool::new(),
            vps: VpPool::new(),
            vss: VsPool::new(),
        }
    }

    #[test]
    fn vp_requires_live_vm() {
        let p = pools();
        assert_eq!(p.vps.allocate(&p.vms, 0, 0), Err(HyperError::NotFound));
        let vmid = p.vms.allocate().unwrap();
        let vpid = p.vps.allocate(&p.vms, vmid, 1).unwrap();
        assert_eq!(p.vps.assigned_vm(vpid), vmid);
        assert_eq!(p.vps.assigned_pp(vpid), 1);

        assert_eq!(p.vms.deallocate(&p.vps, vmid), Err(HyperError::BadState));
        p.vps.deallocate(&p.vss, vpid).unwrap();
        p.vms.deallocate(&p.vps, vmid).unwrap();
        assert_eq!(p.vps.allocate(&p.vms, vmid, 0), Err(HyperError::NotFound));
        assert_eq!(p.vps.count_allocated(), 0);
    }

    #[test]
    fn accessors_of_free_slot_are_invalid() {
        let p = pools();
        assert_eq!(p.vps.assigned_vm(0), BF_INVALID_ID);
        assert_eq!(p.vps.assigned_pp(0), BF_INVALID_ID);
        assert_eq!(p.vps.is_active(0), BF_INVALID_ID);
        assert_eq!(p.vps.assigned_vm(BF_INVALID_ID), BF_INVALID_ID);
        p.vps.deallocate(&p.vss, 0).unwrap();
        p.vps.deallocate(&p.vss, 0).unwrap();
        assert!(p.vps.is_deallocated(0));
    }

    #[test]
    fn activation_is_per_assigned_core() {
        let p = pools();
        let mut core0 = Tls::new(0, 2, StateSave::default());
        let mut core1 = Tls::new(1, 2, StateSave::default());
        let vmid = p.vms.allocate().unwrap();
        let vpid = p.vps.allocate(&p.vms, vmid, 0).unwrap();

        assert_eq!(p.vps.set_active(&mut core1, vpid), Err(HyperError::BadState));
        p.vps.set_active(&mut core0, vpid).unwrap();
        assert!(p.vps.is_active_on_this_pp(&core0, vpid));
        assert_eq!(p.vps.migrate(1, vpid), Err(HyperError::BadState));
        assert_eq!(p.vps.deallocate(&p.vss, vpid), Err(HyperError::BadState));

        p.vps.set_inactive(&mut core0, vpid).unwrap();
        p.vps.migrate(1, vpid).unwrap();
        p.vps.set_active(&mut core1, vpid).unwrap();
        assert_eq!(p.vps.is_active(vpid), 1);
        p.vps.set_inactive(&mut core1, vpid).unwrap();
        p.vps.deallocate(&p.vss, vpid).unwrap();
    }
}
