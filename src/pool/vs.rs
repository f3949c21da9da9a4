use super::{AllocatedStatus, Slot, Slots, VpPool};
use crate::arch::{
    interruption_info, reg_location, GeneralRegisters, RegLocation, StateSave, VmcsControl32,
    VmcsGuest64, VmcsGuestNW, VmcsReadOnly32, VmxRegion, INTERRUPTION_TYPE_NMI,
};
use crate::config::MAX_VSS;
use crate::syscall::BF_INVALID_ID;
use crate::{HyperError, HyperResult, Intrinsic, MkCraftHal, Tls};

const NMI_VECTOR: u8 = 2;

/// Virtual processor state: one VMCS plus the registers it does not hold.
pub struct Vs<H: MkCraftHal> {
    id: u16,
    status: AllocatedStatus,
    assigned_vmid: u16,
    assigned_vpid: u16,
    assigned_ppid: u16,
    active_ppid: Option<u16>,
    /// Core whose VMCS cache may hold this VS, from `vmptrld` until `vmclear`.
    loaded_ppid: Option<u16>,
    launched: bool,
    vmcs: Option<VmxRegion<H>>,
    gprs: GeneralRegisters,
}

impl<H: MkCraftHal> Slot for Vs<H> {
    fn new(id: u16) -> Self {
        Self {
            id,
            status: AllocatedStatus::Deallocated,
            assigned_vmid: BF_INVALID_ID,
            assigned_vpid: BF_INVALID_ID,
            assigned_ppid: BF_INVALID_ID,
            active_ppid: None,
            loaded_ppid: None,
            launched: false,
            vmcs: None,
            gprs: GeneralRegisters::default(),
        }
    }

    fn status(&self) -> AllocatedStatus {
        self.status
    }
}

impl<H: MkCraftHal> Vs<H> {
    fn vmcs_paddr(&self) -> HyperResult<usize> {
        self.vmcs
            .as_ref()
            .map(|vmcs| vmcs.phys_addr())
            .ok_or(HyperError::BadState)
    }

    fn check_allocated(&self) -> HyperResult {
        match self.status {
            AllocatedStatus::Allocated => Ok(()),
            _ => Err(HyperError::BadState),
        }
    }

    /// Makes this VS's VMCS current on the calling core.
    fn ensure_loaded<I: Intrinsic>(&mut self, tls: &mut Tls, intrinsic: &mut I) -> HyperResult {
        self.check_allocated()?;
        if self.assigned_ppid != tls.ppid {
            error!(
                "[MK] vs {:#x} is assigned to pp {:#x}, not pp {:#x}",
                self.id, self.assigned_ppid, tls.ppid
            );
            return Err(HyperError::BadState);
        }
        if tls.loaded_vsid == self.id {
            return Ok(());
        }
        intrinsic.vmld(self.vmcs_paddr()?)?;
        tls.loaded_vsid = self.id;
        self.loaded_ppid = Some(tls.ppid);
        Ok(())
    }

    fn clear<I: Intrinsic>(&mut self, tls: &mut Tls, intrinsic: &mut I) -> HyperResult {
        self.check_allocated()?;
        match self.active_ppid {
            Some(ppid) if ppid != tls.ppid => {
                error!("[MK] vs {:#x} is active on pp {:#x}", self.id, ppid);
                return Err(HyperError::BadState);
            }
            _ => {}
        }
        match self.loaded_ppid {
            Some(ppid) if ppid != tls.ppid => {
                error!("[MK] vs {:#x} is loaded on pp {:#x}", self.id, ppid);
                return Err(HyperError::BadState);
            }
            _ => {}
        }
        intrinsic.vmcl(self.vmcs_paddr()?)?;
        self.launched = false;
        self.loaded_ppid = None;
        if tls.loaded_vsid == self.id {
            tls.loaded_vsid = BF_INVALID_ID;
        }
        Ok(())
    }

    /// The register file for this VS. The active VS keeps its registers in
    /// the core's TLS.
    fn gprs_mut<'a>(&'a mut self, tls: &'a mut Tls) -> &'a mut GeneralRegisters {
        if tls.active_vsid == self.id && self.active_ppid == Some(tls.ppid) {
            &mut tls.gprs
        } else {
            &mut self.gprs
        }
    }
}

/// Pool of [`Vs`]s.
pub struct VsPool<H: MkCraftHal> {
    slots: Slots<Vs<H>, MAX_VSS>,
}

impl<H: MkCraftHal> VsPool<H> {
    pub fn new() -> Self {
        Self {
            slots: Slots::new(),
        }
    }

    pub(crate) fn lock_pool(&self) -> spin::MutexGuard<'_, ()> {
        self.slots.lock_pool()
    }

    fn get_allocated(&self, vsid: u16) -> HyperResult<spin::MutexGuard<'_, Vs<H>>> {
        let vs = self.slots.get(vsid)?;
        vs.check_allocated()?;
        Ok(vs)
    }

    /// Allocates a VS for `vpid` on core `ppid` and prepares its VMCS.
    ///
    /// The new VMCS is left cleared, so nothing is current on the calling
    /// core afterwards.
    pub fn allocate<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vp_pool: &VpPool,
        vpid: u16,
        ppid: u16,
    ) -> HyperResult<u16> {
        let _pool = self.slots.lock_pool();
        let _vps = vp_pool.lock_pool();
        if !vp_pool.is_allocated(vpid) {
            error!("[MK] vs cannot be assigned to dead vp {:#x}", vpid);
            return Err(HyperError::NotFound);
        }
        let vmid = vp_pool.assigned_vm(vpid);
        let vsid = self.slots.allocate_with(|vsid, vs| {
            let vmcs = VmxRegion::new(intrinsic.vmcs_revision_id(), false)?;
            let paddr = vmcs.phys_addr();
            intrinsic.vmcl(paddr)?;
            intrinsic.vmld(paddr)?;
            tls.loaded_vsid = BF_INVALID_ID;
            intrinsic.vmwr(VmcsGuest64::LINK_PTR as u32, u64::MAX)?;
            intrinsic.vmwr(crate::arch::vmx::vmcs::VmcsControl16::VPID as u32, vsid as u64 + 1)?;
            intrinsic.vmcl(paddr)?;

            *vs = Vs::new(vsid);
            vs.status = AllocatedStatus::Allocated;
            vs.assigned_vmid = vmid;
            vs.assigned_vpid = vpid;
            vs.assigned_ppid = ppid;
            vs.vmcs = Some(vmcs);
            Ok(())
        })?;
        debug!("[MK] vs {:#x} allocated to vp {:#x} on pp {:#x}", vsid, vpid, ppid);
        Ok(vsid)
    }

    /// Frees `vsid`. Freeing a VS that is already free succeeds.
    ///
    /// A VS loaded on the calling core is cleared first. Fails with
    /// `BadState` if the VS is active, or loaded on another core. If the
    /// clear itself fails the slot becomes a zombie.
    pub fn deallocate<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vsid: u16,
    ) -> HyperResult {
        let _pool = self.slots.lock_pool();
        let mut vs = self.slots.get(vsid)?;
        match vs.status {
            AllocatedStatus::Deallocated => return Ok(()),
            AllocatedStatus::Zombie => return Err(HyperError::BadState),
            AllocatedStatus::Allocated => {}
        }
        if let Some(ppid) = vs.active_ppid {
            error!("[MK] vs {:#x} is still active on pp {:#x}", vsid, ppid);
            return Err(HyperError::BadState);
        }
        match vs.loaded_ppid {
            Some(ppid) if ppid != tls.ppid => {
                error!("[MK] vs {:#x} is loaded on pp {:#x}", vsid, ppid);
                return Err(HyperError::BadState);
            }
            Some(_) => {
                if let Err(err) = vs.clear(tls, intrinsic) {
                    error!("[MK] vs {:#x} could not be cleared, now a zombie", vsid);
                    vs.status = AllocatedStatus::Zombie;
                    return Err(err);
                }
            }
            None => {}
        }
        if tls.loaded_vsid == vsid {
            tls.loaded_vsid = BF_INVALID_ID;
        }
        *vs = Vs::new(vsid);
        debug!("[MK] vs {:#x} deallocated", vsid);
        Ok(())
    }

    pub fn is_allocated(&self, vsid: u16) -> bool {
        self.slots.status(vsid) == AllocatedStatus::Allocated
    }

    pub fn is_deallocated(&self, vsid: u16) -> bool {
        self.slots.status(vsid) == AllocatedStatus::Deallocated
    }

    pub fn is_zombie(&self, vsid: u16) -> bool {
        self.slots.status(vsid) == AllocatedStatus::Zombie
    }

    fn read<F: Fn(&Vs<H>) -> u16>(&self, vsid: u16, f: F) -> u16 {
        self.get_allocated(vsid)
            .map(|vs| f(&vs))
            .unwrap_or(BF_INVALID_ID)
    }

    /// The VM owning `vsid`, or `BF_INVALID_ID`.
    pub fn assigned_vm(&self, vsid: u16) -> u16 {
        self.read(vsid, |vs| vs.assigned_vmid)
    }

    /// The VP owning `vsid`, or `BF_INVALID_ID`.
    pub fn assigned_vp(&self, vsid: u16) -> u16 {
        self.read(vsid, |vs| vs.assigned_vpid)
    }

    /// The core `vsid` may run on, or `BF_INVALID_ID`.
    pub fn assigned_pp(&self, vsid: u16) -> u16 {
        self.read(vsid, |vs| vs.assigned_ppid)
    }

    /// The core `vsid` is active on, or `BF_INVALID_ID`.
    pub fn is_active(&self, vsid: u16) -> u16 {
        self.read(vsid, |vs| vs.active_ppid.unwrap_or(BF_INVALID_ID))
    }

    pub fn is_active_on_this_pp(&self, tls: &Tls, vsid: u16) -> bool {
        self.is_active(vsid) == tls.ppid
    }

    /// Whether `vsid` has been entered since its last clear.
    pub fn is_launched(&self, vsid: u16) -> bool {
        self.get_allocated(vsid).map(|vs| vs.launched).unwrap_or(false)
    }

    /// Whether any allocated VS belongs to `vpid`.
    pub fn is_vp_assigned(&self, vpid: u16) -> bool {
        self.slots.any(|vs| vs.assigned_vpid == vpid)
    }

    /// Makes `vsid` this core's active VS and moves its registers into the
    /// TLS.
    pub fn set_active(&self, tls: &mut Tls, vsid: u16) -> HyperResult {
        if tls.active_vsid != BF_INVALID_ID {
            return Err(HyperError::BadState);
        }
        let mut vs = self.get_allocated(vsid)?;
        if vs.active_ppid.is_some() || vs.assigned_ppid != tls.ppid {
            return Err(HyperError::BadState);
        }
        tls.gprs = vs.gprs;
        vs.active_ppid = Some(tls.ppid);
        tls.active_vsid = vsid;
        Ok(())
    }

    /// Saves the TLS registers back into `vsid` and clears it as this core's
    /// active VS. `BF_INVALID_ID` is a no-op.
    pub fn set_inactive(&self, tls: &mut Tls, vsid: u16) -> HyperResult {
        if vsid == BF_INVALID_ID {
            return Ok(());
        }
        if tls.active_vsid != vsid {
            return Err(HyperError::BadState);
        }
        let mut vs = self.get_allocated(vsid)?;
        vs.gprs = tls.gprs;
        vs.active_ppid = None;
        tls.active_vsid = BF_INVALID_ID;
        Ok(())
    }

    /// Flushes `vsid`'s VMCS with `vmclear` and resets its launched flag.
    pub fn clear<I: Intrinsic>(&self, tls: &mut Tls, intrinsic: &mut I, vsid: u16) -> HyperResult {
        self.get_allocated(vsid)?.clear(tls, intrinsic)
    }

    /// Reassigns an inactive VS to core `ppid`, clearing it first.
    pub fn migrate<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        ppid: u16,
        vsid: u16,
    ) -> HyperResult {
        let mut vs = self.get_allocated(vsid)?;
        if vs.active_ppid.is_some() {
            return Err(HyperError::BadState);
        }
        vs.clear(tls, intrinsic)?;
        vs.assigned_ppid = ppid;
        Ok(())
    }

    /// Reads ABI register `reg` of `vsid`.
    ///
    /// Fails with `InvalidParam` for a register the microkernel does not
    /// expose.
    pub fn read_reg<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vsid: u16,
        reg: u64,
    ) -> HyperResult<u64> {
        let mut vs = self.get_allocated(vsid)?;
        match reg_location(reg).ok_or(HyperError::InvalidParam)? {
            RegLocation::Gpr(idx) => vs.gprs_mut(tls).get(idx).ok_or(HyperError::InvalidParam),
            RegLocation::Vmcs(field) => {
                vs.ensure_loaded(tls, intrinsic)?;
                intrinsic.vmrd(field)
            }
        }
    }

    /// Writes ABI register `reg` of `vsid`.
    pub fn write_reg<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vsid: u16,
        reg: u64,
        val: u64,
    ) -> HyperResult {
        let mut vs = self.get_allocated(vsid)?;
        match reg_location(reg).ok_or(HyperError::InvalidParam)? {
            RegLocation::Gpr(idx) => vs
                .gprs_mut(tls)
                .set(idx, val)
                .ok_or(HyperError::InvalidParam),
            RegLocation::Vmcs(field) => {
                vs.ensure_loaded(tls, intrinsic)?;
                intrinsic.vmwr(field, val)
            }
        }
    }

    /// Moves `vsid`'s instruction pointer past the instruction that exited.
    pub fn advance_ip<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vsid: u16,
    ) -> HyperResult {
        let mut vs = self.get_allocated(vsid)?;
        vs.ensure_loaded(tls, intrinsic)?;
        let rip = intrinsic.vmrd(VmcsGuestNW::RIP as u32)?;
        let len = intrinsic.vmrd(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN as u32)?;
        intrinsic.vmwr(VmcsGuestNW::RIP as u32, rip.wrapping_add(len))
    }

    /// Loads the state the loader had on this core into `vsid`, so entering
    /// it continues the loader as a guest.
    pub fn init_as_root<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vsid: u16,
    ) -> HyperResult {
        let mut vs = self.get_allocated(vsid)?;
        vs.ensure_loaded(tls, intrinsic)?;
        let root = tls.root_state;
        intrinsic.vmwr(VmcsGuestNW::RIP as u32, root.rip)?;
        intrinsic.vmwr(VmcsGuestNW::RSP as u32, root.rsp)?;
        intrinsic.vmwr(VmcsGuestNW::RFLAGS as u32, root.rflags)?;
        intrinsic.vmwr(VmcsGuestNW::CR0 as u32, root.cr0)?;
        intrinsic.vmwr(VmcsGuestNW::CR3 as u32, root.cr3)?;
        intrinsic.vmwr(VmcsGuestNW::CR4 as u32, root.cr4)?;
        intrinsic.vmwr(VmcsGuest64::IA32_EFER as u32, root.efer)?;
        *vs.gprs_mut(tls) = root.gprs;
        Ok(())
    }

    /// Enters the active VS on this core and returns the exit reason.
    ///
    /// Uses `vmlaunch` on the first entry after a clear and `vmresume`
    /// afterwards. A pending NMI is injected on this entry.
    pub fn run<I: Intrinsic>(&self, tls: &mut Tls, intrinsic: &mut I) -> HyperResult<u64> {
        let vsid = tls.active_vsid;
        let launched = {
            let mut vs = self.get_allocated(vsid)?;
            vs.ensure_loaded(tls, intrinsic)?;
            vs.launched
        };
        if tls.nmi_pending {
            intrinsic.vmwr(
                VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32,
                interruption_info(NMI_VECTOR, INTERRUPTION_TYPE_NMI, false),
            )?;
            tls.nmi_pending = false;
        }
        let reason = intrinsic.vmrun(&mut tls.gprs, launched)?;
        self.get_allocated(vsid)?.launched = true;
        Ok(reason)
    }

    /// Captures `vsid` as the architectural state to hand back to the
    /// loader on promotion.
    pub fn to_state_save<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vsid: u16,
    ) -> HyperResult<StateSave> {
        let mut vs = self.get_allocated(vsid)?;
        vs.ensure_loaded(tls, intrinsic)?;
        Ok(StateSave {
            gprs: *vs.gprs_mut(tls),
            rip: intrinsic.vmrd(VmcsGuestNW::RIP as u32)?,
            rsp: intrinsic.vmrd(VmcsGuestNW::RSP as u32)?,
            rflags: intrinsic.vmrd(VmcsGuestNW::RFLAGS as u32)?,
            cr0: intrinsic.vmrd(VmcsGuestNW::CR0 as u32)?,
            cr3: intrinsic.vmrd(VmcsGuestNW::CR3 as u32)?,
            cr4: intrinsic.vmrd(VmcsGuestNW::CR4 as u32)?,
            efer: intrinsic.vmrd(VmcsGuest64::IA32_EFER as u32)?,
        })
    }

    /// Number of allocated VSs.
    pub fn count_allocated(&self) -> usize {
        self.slots.count_allocated()
    }

    /// Logs the state of `vsid`.
    pub fn dump(&self, vsid: u16) {
        match self.slots.get(vsid) {
            Ok(vs) => {
                info!(
                    "[MK] vs {:#06x}: {:?}, vm {:#06x}, vp {:#06x}, pp {:#06x}, active {:#06x}, launched {}",
                    vs.id,
                    vs.status,
                    vs.assigned_vmid,
                    vs.assigned_vpid,
                    vs.assigned_ppid,
                    vs.active_ppid.unwrap_or(BF_INVALID_ID),
                    vs.launched
                );
                info!("[MK]   {:x?}", vs.gprs);
            }
            Err(_) => info!("[MK] vs {:#06x}: out of range", vsid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::exit_reason;
    use crate::pool::VmPool;
    use crate::test_support::{MockHal, MockIntrinsic};

    struct Fixture {
        vms: VmPool,
        vps: VpPool,
        vss: VsPool<MockHal>,
        tls: Tls,
        intrinsic: MockIntrinsic,
        vpid: u16,
    }

    fn fixture() -> Fixture {
        let vms = VmPool::new();
        let vps = VpPool::new();
        let vmid = vms.allocate().unwrap();
        let vpid = vps.allocate(&vms, vmid, 0).unwrap();
        Fixture {
            vms,
            vps,
            vss: VsPool::new(),
            tls: Tls::new(0, 2, StateSave::default()),
            intrinsic: MockIntrinsic::new(),
            vpid,
        }
    }

    impl Fixture {
        fn new_vs(&mut self) -> u16 {
            self.vss
                .allocate(&mut self.tls, &mut self.intrinsic, &self.vps, self.vpid, 0)
                .unwrap()
        }
    }

    #[test]
    fn allocation_prepares_and_clears_vmcs() {
        let mut f = fixture();
        let vsid = f.new_vs();
        assert_eq!(f.vss.assigned_vp(vsid), f.vpid);
        assert_eq!(f.vss.assigned_pp(vsid), 0);
        assert_eq!(f.tls.loaded_vsid, BF_INVALID_ID);
        assert!(!f.vss.is_launched(vsid));

        let vmcs = f.intrinsic.vmcs_of(0);
        assert_eq!(vmcs.get(&(VmcsGuest64::LINK_PTR as u32)), Some(&u64::MAX));
        assert_eq!(vmcs.get(&0), Some(&1));
        assert_eq!(f.intrinsic.current, None);
    }

    #[test]
    fn vs_requires_live_vp() {
        let mut f = fixture();
        let dead = f.vpid + 1;
        assert_eq!(
            f.vss.allocate(&mut f.tls, &mut f.intrinsic, &f.vps, dead, 0),
            Err(HyperError::NotFound)
        );
        assert_eq!(f.vss.count_allocated(), 0);
        let vsid = f.new_vs();
        assert_eq!(f.vps.deallocate(&f.vss, f.vpid), Err(HyperError::BadState));
        f.vss.deallocate(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        f.vps.deallocate(&f.vss, f.vpid).unwrap();
        let _ = &f.vms;
    }

    #[test]
    fn deallocate_evicts_vmcs_loaded_here() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss.advance_ip(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        assert_eq!(f.tls.loaded_vsid, vsid);

        let clears = f.intrinsic.clears.len();
        f.vss.deallocate(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        assert_eq!(f.intrinsic.clears.len(), clears + 1);
        assert_eq!(f.tls.loaded_vsid, BF_INVALID_ID);
        assert_eq!(f.vss.assigned_vp(vsid), BF_INVALID_ID);
        assert!(!f.vss.is_allocated(vsid));
        f.vss.deallocate(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        assert!(f.vss.is_deallocated(vsid));
    }

    #[test]
    fn deallocate_loaded_on_other_core_fails_fast() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss.advance_ip(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        let mut core1 = Tls::new(1, 2, StateSave::default());
        assert_eq!(
            f.vss.deallocate(&mut core1, &mut f.intrinsic, vsid),
            Err(HyperError::BadState)
        );
        assert!(f.vss.is_allocated(vsid));
    }

    #[test]
    fn failed_clear_leaves_a_zombie() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss.advance_ip(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        f.intrinsic.fail_vmcl = true;
        assert_eq!(
            f.vss.deallocate(&mut f.tls, &mut f.intrinsic, vsid),
            Err(HyperError::BadState)
        );
        assert!(f.vss.is_zombie(vsid));
        assert!(!f.vss.is_allocated(vsid));
        f.intrinsic.fail_vmcl = false;
        assert_eq!(
            f.vss.deallocate(&mut f.tls, &mut f.intrinsic, vsid),
            Err(HyperError::BadState)
        );
        assert_ne!(f.new_vs(), vsid);
    }

    #[test]
    fn active_vs_is_not_destroyable_and_owns_tls_registers() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss.write_reg(&mut f.tls, &mut f.intrinsic, vsid, 1, 0x1234).unwrap();
        f.vss.set_active(&mut f.tls, vsid).unwrap();
        assert_eq!(f.tls.gprs.rax, 0x1234);
        assert_eq!(
            f.vss.deallocate(&mut f.tls, &mut f.intrinsic, vsid),
            Err(HyperError::BadState)
        );

        f.vss.write_reg(&mut f.tls, &mut f.intrinsic, vsid, 2, 0x55).unwrap();
        assert_eq!(f.tls.gprs.rbx, 0x55);
        f.tls.gprs.rcx = 0x77;
        f.vss.set_inactive(&mut f.tls, vsid).unwrap();
        assert_eq!(
            f.vss.read_reg(&mut f.tls, &mut f.intrinsic, vsid, 3),
            Ok(0x77)
        );
        f.vss.deallocate(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
    }

    #[test]
    fn unknown_register_is_rejected() {
        let mut f = fixture();
        let vsid = f.new_vs();
        assert_eq!(
            f.vss.read_reg(&mut f.tls, &mut f.intrinsic, vsid, 0),
            Err(HyperError::InvalidParam)
        );
        assert_eq!(
            f.vss.write_reg(&mut f.tls, &mut f.intrinsic, vsid, 9999, 1),
            Err(HyperError::InvalidParam)
        );
    }

    #[test]
    fn launch_once_then_resume() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss.set_active(&mut f.tls, vsid).unwrap();
        f.intrinsic.script_exits(&[exit_reason::CPUID, exit_reason::CPUID]);
        assert_eq!(f.vss.run(&mut f.tls, &mut f.intrinsic), Ok(exit_reason::CPUID));
        assert_eq!(f.vss.run(&mut f.tls, &mut f.intrinsic), Ok(exit_reason::CPUID));
        assert_eq!((f.intrinsic.launches, f.intrinsic.resumes), (1, 1));

        f.vss.set_inactive(&mut f.tls, vsid).unwrap();
        f.vss.clear(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        assert!(!f.vss.is_launched(vsid));
    }

    #[test]
    fn pending_nmi_is_injected_once() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss.set_active(&mut f.tls, vsid).unwrap();
        f.tls.nmi_pending = true;
        f.vss.run(&mut f.tls, &mut f.intrinsic).unwrap();
        assert!(!f.tls.nmi_pending);
        let info = VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32;
        assert_eq!(f.intrinsic.vmcs_of(0).get(&info), Some(&0x8000_0202));
    }

    #[test]
    fn migrate_clears_and_reassigns() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss.set_active(&mut f.tls, vsid).unwrap();
        f.vss.run(&mut f.tls, &mut f.intrinsic).unwrap();
        assert_eq!(
            f.vss.migrate(&mut f.tls, &mut f.intrinsic, 1, vsid),
            Err(HyperError::BadState)
        );
        f.vss.set_inactive(&mut f.tls, vsid).unwrap();
        f.vss.migrate(&mut f.tls, &mut f.intrinsic, 1, vsid).unwrap();
        assert_eq!(f.vss.assigned_pp(vsid), 1);
        assert!(!f.vss.is_launched(vsid));
        assert_eq!(f.tls.loaded_vsid, BF_INVALID_ID);
        assert_eq!(
            f.vss.advance_ip(&mut f.tls, &mut f.intrinsic, vsid),
            Err(HyperError::BadState)
        );
    }

    #[test]
    fn advance_ip_adds_instruction_length() {
        let mut f = fixture();
        let vsid = f.new_vs();
        f.vss
            .write_reg(&mut f.tls, &mut f.intrinsic, vsid, 152, 0x1000)
            .unwrap();
        f.intrinsic
            .vmwr(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN as u32, 2)
            .unwrap();
        f.vss.advance_ip(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        assert_eq!(
            f.vss.read_reg(&mut f.tls, &mut f.intrinsic, vsid, 152),
            Ok(0x1002)
        );
    }

    #[test]
    fn root_state_round_trips_through_promotion_snapshot() {
        let mut f = fixture();
        f.tls.root_state.rip = 0xffff_8000_0000_1000;
        f.tls.root_state.cr3 = 0x5000;
        f.tls.root_state.gprs.r15 = 15;
        let vsid = f.new_vs();
        f.vss.init_as_root(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        let state = f.vss.to_state_save(&mut f.tls, &mut f.intrinsic, vsid).unwrap();
        assert_eq!(state, f.tls.root_state);
    }
}
