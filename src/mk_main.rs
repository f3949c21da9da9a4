//! The microkernel context shared by every core, and the per-core start path.

use alloc::boxed::Box;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use spin::{Mutex, MutexGuard, Once};

use crate::config::{MAX_EXTENSIONS, MAX_PPS};
use crate::pool::{VmPool, VpPool, VsPool};
use crate::syscall::{SyscallGate, BF_ROOT_VMID, BF_STATUS_SUCCESS};
use crate::vmexit::{self, VmExitLog, VmExitRecord};
use crate::{esr, CoreState, EsrOutcome, ExtFault, Extension, ExtensionImage, HostPhysAddr};
use crate::{HyperError, HyperResult, Intrinsic, MkCraftHal, PendingAction, StateSave, Tls};

/// The core that allocates the root VM and runs extension entry points.
const BSP_PPID: u16 = 0;

/// What the loader hands the microkernel on each core.
#[derive(Debug, Clone, Copy)]
pub struct MkArgs {
    pub ppid: u16,
    pub online_pps: u16,
    /// The loader's own state on this core, resumed by the root VS.
    pub root_state: StateSave,
}

/// How a core's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreExit {
    /// A VS's state was handed back to the loader.
    Promoted,
    /// The core was stopped.
    Halted,
}

/// State shared by every core running the microkernel.
///
/// Pools are locked internally, so the context is used by `&` from all cores
/// at once while each core owns its [`Tls`].
pub struct Microkernel<H: MkCraftHal> {
    online_pps: u16,
    vm_pool: VmPool,
    vp_pool: VpPool,
    vs_pool: VsPool<H>,
    exts: ArrayVec<Extension<H>, MAX_EXTENSIONS>,
    vmexit_ext: Once<u16>,
    fail_ext: Once<u16>,
    vmexit_logs: [Mutex<VmExitLog>; MAX_PPS],
}

impl<H: MkCraftHal> Microkernel<H> {
    /// Loads `images` as extensions `0..` for `online_pps` cores.
    ///
    /// `mk_root` is the microkernel's own root page table, shared into every
    /// extension's address space when given.
    pub fn new(
        online_pps: u16,
        mk_root: Option<HostPhysAddr>,
        images: Vec<Box<dyn ExtensionImage>>,
    ) -> HyperResult<Self> {
        if online_pps == 0 || online_pps as usize > MAX_PPS {
            error!("[MK] unsupported number of pps: {}", online_pps);
            return Err(HyperError::InvalidParam);
        }
        if images.is_empty() || images.len() > MAX_EXTENSIONS {
            error!("[MK] unsupported number of extensions: {}", images.len());
            return Err(HyperError::InvalidParam);
        }
        let mut exts = ArrayVec::new();
        for (id, image) in images.into_iter().enumerate() {
            exts.push(Extension::new(id as u16, image, online_pps, mk_root)?);
        }
        Ok(Self {
            online_pps,
            vm_pool: VmPool::new(),
            vp_pool: VpPool::new(),
            vs_pool: VsPool::new(),
            exts,
            vmexit_ext: Once::new(),
            fail_ext: Once::new(),
            vmexit_logs: core::array::from_fn(|_| Mutex::new(VmExitLog::new())),
        })
    }

    /// Creates the per-core context for the core described by `args`.
    pub fn new_tls(&self, args: &MkArgs) -> HyperResult<Tls> {
        if args.online_pps != self.online_pps {
            error!(
                "[MK] pp {:#x} reports {} online pps, expected {}",
                args.ppid, args.online_pps, self.online_pps
            );
            return Err(HyperError::InvalidParam);
        }
        if args.ppid >= self.online_pps {
            error!("[MK] pp {:#x} is out of range", args.ppid);
            return Err(HyperError::InvalidParam);
        }
        Ok(Tls::new(args.ppid, args.online_pps, args.root_state))
    }

    pub fn online_pps(&self) -> u16 {
        self.online_pps
    }

    pub fn vm_pool(&self) -> &VmPool {
        &self.vm_pool
    }

    pub fn vp_pool(&self) -> &VpPool {
        &self.vp_pool
    }

    pub fn vs_pool(&self) -> &VsPool<H> {
        &self.vs_pool
    }

    pub fn ext(&self, extid: u16) -> Option<&Extension<H>> {
        self.exts.get(extid as usize)
    }

    pub fn exts(&self) -> &[Extension<H>] {
        &self.exts
    }

    /// The extension holding the VMExit registration.
    pub fn vmexit_ext(&self) -> Option<u16> {
        self.vmexit_ext.get().copied()
    }

    /// The extension holding the fail registration.
    pub fn fail_ext(&self) -> Option<u16> {
        self.fail_ext.get().copied()
    }

    fn register_once(slot: &Once<u16>, what: &str, ext: &Extension<H>, ip: u64) -> HyperResult {
        if !ext.is_code_addr(ip) {
            error!("[MK] ext {:#x} {} callback {:#x} is not in its code", ext.id(), what, ip);
            return Err(HyperError::InvalidParam);
        }
        let mut won = false;
        let owner = *slot.call_once(|| {
            won = true;
            ext.id()
        });
        if !won {
            error!(
                "[MK] ext {:#x} cannot register a {} callback, ext {:#x} already has",
                ext.id(),
                what,
                owner
            );
            return Err(HyperError::AlreadyExists);
        }
        info!("[MK] ext {:#x} registered {} callback {:#x}", ext.id(), what, ip);
        Ok(())
    }

    /// Makes `ext` the VMExit extension. Only the first registration wins.
    pub(crate) fn register_vmexit(&self, ext: &Extension<H>, ip: u64) -> HyperResult {
        Self::register_once(&self.vmexit_ext, "vmexit", ext, ip)?;
        ext.set_vmexit_ip(ip)
    }

    /// Makes `ext` the fail extension. Only the first registration wins.
    pub(crate) fn register_fail(&self, ext: &Extension<H>, ip: u64) -> HyperResult {
        Self::register_once(&self.fail_ext, "fail", ext, ip)?;
        ext.set_fail_ip(ip)
    }

    /// Runs extension `extid` at `ip` on this core until it returns or
    /// faults. Its syscalls are dispatched on the way.
    pub(crate) fn execute_ext<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        extid: u16,
        ip: u64,
        sp: u64,
        arg0: u64,
        arg1: u64,
    ) -> HyperResult<Result<u64, ExtFault>> {
        let ext = self.ext(extid).ok_or(HyperError::NotFound)?;
        tls.active_extid = extid;
        ext.activate(intrinsic);
        let mut gate = SyscallGate::new(self, tls, intrinsic)?;
        let ret = ext.image().execute(ip, sp, arg0, arg1, &mut gate);
        gate.finish();
        Ok(ret)
    }

    /// Like [`Self::execute_ext`], for calls made while the core boots. Any
    /// result other than success fails the boot.
    fn boot_call<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        extid: u16,
        ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> HyperResult {
        let sp = self.ext(extid).ok_or(HyperError::NotFound)?.stack_top(tls.ppid);
        match self.execute_ext(tls, intrinsic, extid, ip, sp, arg0, arg1)? {
            Ok(BF_STATUS_SUCCESS) => Ok(()),
            Ok(status) => {
                error!("[MK] ext {:#x} failed to boot: {:#018x}", extid, status);
                Err(HyperError::Internal)
            }
            Err(fault) if fault.vector == esr::NMI_VECTOR => {
                self.dispatch_esr(tls, intrinsic, fault);
                error!("[MK] ext {:#x} was cut short by an nmi while booting", extid);
                Err(HyperError::Internal)
            }
            Err(fault) => {
                error!(
                    "[MK] ext {:#x} took {} at {:#018x} while booting",
                    extid,
                    esr::esr_vector_to_name(fault.vector),
                    fault.rip
                );
                Err(HyperError::Internal)
            }
        }
    }

    /// Starts the microkernel on the core `tls` belongs to.
    ///
    /// The bootstrap core first creates the root VM and runs every
    /// extension's entry point. Each core then runs the bootstrap callbacks,
    /// which must leave a root VS to run, and enters the VMExit loop.
    ///
    /// Returns an error if the core could not be started, in which case the
    /// loader continues as if the microkernel were absent.
    pub fn start_core<I: Intrinsic>(&self, tls: &mut Tls, intrinsic: &mut I) -> HyperResult<CoreExit> {
        if tls.state() != CoreState::NotLaunched {
            return Err(HyperError::BadState);
        }
        let ppid = tls.ppid;
        info!("[MK] starting pp {:#x} of {}", ppid, self.online_pps);

        if ppid == BSP_PPID {
            let vmid = self.vm_pool.allocate()?;
            if vmid != BF_ROOT_VMID {
                error!("[MK] root vm got id {:#x}", vmid);
                return Err(HyperError::BadState);
            }
            for ext in self.exts.iter() {
                let ip = ext.image().entry_ip();
                self.boot_call(tls, intrinsic, ext.id(), ip, ppid as u64, self.online_pps as u64)?;
            }
        }
        self.vm_pool.set_active(tls, BF_ROOT_VMID)?;

        tls.pending = None;
        for ext in self.exts.iter() {
            if let Some(ip) = ext.bootstrap_ip() {
                self.boot_call(tls, intrinsic, ext.id(), ip, ppid as u64, 0)?;
            }
        }
        if self.vmexit_ext().is_none() {
            error!("[MK] no extension registered for vmexits");
            return Err(HyperError::NotFound);
        }
        match tls.pending.take() {
            Some(PendingAction::Run) => {}
            other => {
                error!("[MK] bootstrap of pp {:#x} left {:?} instead of a vs to run", tls.ppid, other);
                return Err(HyperError::BadState);
            }
        }
        vmexit::run_loop(self, tls, intrinsic)
    }

    /// Hands `vsid`'s state back to the loader and ends the session here.
    pub(crate) fn promote<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        vsid: u16,
    ) -> HyperResult<CoreExit> {
        let state = self.vs_pool.to_state_save(tls, intrinsic, vsid)?;
        tls.transition(CoreState::Promoted)?;
        info!("[MK] promoting vs {:#x} on pp {:#x}", vsid, tls.ppid);
        intrinsic.promote(&state);
        Ok(CoreExit::Promoted)
    }

    /// Stops this core.
    pub(crate) fn halt<I: Intrinsic>(&self, tls: &mut Tls, intrinsic: &mut I) -> CoreExit {
        if let Err(err) = tls.transition(CoreState::Halted) {
            warn!("[MK] halting pp {:#x} from {:?}: {:?}", tls.ppid, tls.state(), err);
        }
        error!("[MK] pp {:#x} halted", tls.ppid);
        intrinsic.halt();
        CoreExit::Halted
    }

    /// Entry point for exceptions taken in extension code on this core.
    pub fn dispatch_esr<I: Intrinsic>(
        &self,
        tls: &mut Tls,
        intrinsic: &mut I,
        fault: ExtFault,
    ) -> EsrOutcome {
        esr::dispatch_esr(self, tls, intrinsic, fault)
    }

    pub(crate) fn log_vmexit(&self, ppid: u16, record: VmExitRecord) {
        if let Some(log) = self.vmexit_logs.get(ppid as usize) {
            log.lock().push(record);
        }
    }

    /// The VMExit log of core `ppid`.
    pub fn vmexit_log(&self, ppid: u16) -> Option<MutexGuard<'_, VmExitLog>> {
        if ppid >= self.online_pps {
            return None;
        }
        self.vmexit_logs.get(ppid as usize).map(|log| log.lock())
    }

    pub fn dump_vmexit_log(&self, ppid: u16) -> HyperResult {
        self.vmexit_log(ppid)
            .ok_or(HyperError::InvalidParam)?
            .dump(ppid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec;

    use super::*;
    use crate::arch::exit_reason;
    use crate::syscall::*;
    use crate::test_support::*;

    fn args(ppid: u16, online_pps: u16) -> MkArgs {
        MkArgs {
            ppid,
            online_pps,
            root_state: StateSave::default(),
        }
    }

    fn idle_image() -> Box<dyn ExtensionImage> {
        let (image, _) = ScriptedExt::new(|_, _| Ok(BF_STATUS_SUCCESS));
        Box::new(image)
    }

    #[test]
    fn new_validates_its_inputs() {
        assert_eq!(
            Microkernel::<MockHal>::new(0, None, vec![idle_image()]).err(),
            Some(HyperError::InvalidParam)
        );
        assert_eq!(
            Microkernel::<MockHal>::new(MAX_PPS as u16 + 1, None, vec![idle_image()]).err(),
            Some(HyperError::InvalidParam)
        );
        assert_eq!(
            Microkernel::<MockHal>::new(1, None, vec![]).err(),
            Some(HyperError::InvalidParam)
        );
        let too_many = (0..=MAX_EXTENSIONS).map(|_| idle_image()).collect();
        assert_eq!(
            Microkernel::<MockHal>::new(1, None, too_many).err(),
            Some(HyperError::InvalidParam)
        );

        let mk = Microkernel::<MockHal>::new(2, None, vec![idle_image(), idle_image()]).unwrap();
        assert_eq!(mk.exts().len(), 2);
        assert_eq!(mk.ext(1).map(|ext| ext.id()), Some(1));
        assert!(mk.ext(2).is_none());
        assert_eq!(mk.vm_pool().count_allocated(), 0);
        assert_eq!(mk.vmexit_ext(), None);
    }

    #[test]
    fn tls_must_match_the_topology() {
        let mk = Microkernel::<MockHal>::new(2, None, vec![idle_image()]).unwrap();
        let tls = mk.new_tls(&args(1, 2)).unwrap();
        assert_eq!((tls.ppid, tls.online_pps), (1, 2));
        assert_eq!(tls.state(), CoreState::NotLaunched);
        assert_eq!(mk.new_tls(&args(2, 2)).err(), Some(HyperError::InvalidParam));
        assert_eq!(mk.new_tls(&args(0, 3)).err(), Some(HyperError::InvalidParam));
    }

    #[test]
    fn boot_requires_a_vmexit_extension() {
        let (image, calls) = ScriptedExt::new(|_, _| Ok(BF_STATUS_SUCCESS));
        let mk = Microkernel::<MockHal>::new(1, None, vec![Box::new(image) as _]).unwrap();
        let mut tls = mk.new_tls(&args(0, 1)).unwrap();
        let mut intrinsic = MockIntrinsic::new();
        assert_eq!(mk.start_core(&mut tls, &mut intrinsic), Err(HyperError::NotFound));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(intrinsic.launches, 0);
    }

    #[test]
    fn bootstrap_core_creates_the_root_vm_and_runs_entries_once() {
        let (image, calls) = root_ext(cpuid_then_promote(), None);
        let mk = Microkernel::<MockHal>::new(2, None, vec![Box::new(image) as _]).unwrap();

        let mut bsp = mk.new_tls(&args(0, 2)).unwrap();
        let mut bsp_intrinsic = MockIntrinsic::new();
        assert_eq!(mk.start_core(&mut bsp, &mut bsp_intrinsic), Ok(CoreExit::Promoted));
        assert!(mk.vm_pool().is_allocated(BF_ROOT_VMID));
        assert_eq!(mk.vmexit_ext(), Some(0));

        let mut ap = mk.new_tls(&args(1, 2)).unwrap();
        let mut ap_intrinsic = MockIntrinsic::new();
        assert_eq!(mk.start_core(&mut ap, &mut ap_intrinsic), Ok(CoreExit::Promoted));
        assert_eq!(mk.vm_pool().count_allocated(), 1);
        assert_eq!(mk.vp_pool().count_allocated(), 2);
        assert_eq!(mk.vs_pool().assigned_pp(1), 1);
        assert_eq!(ap.active_vsid, 1);
        assert_eq!(ap_intrinsic.launches, 1);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| c.ip == TEST_ENTRY_IP).count(), 1);
        let bootstraps: vec::Vec<_> = calls.iter().filter(|c| c.ip == TEST_BOOTSTRAP_IP).collect();
        assert_eq!(bootstraps.len(), 2);
        assert_eq!((bootstraps[0].arg0, bootstraps[1].arg0), (0, 1));
        let last = calls.last().unwrap();
        assert_eq!((last.ip, last.arg0, last.arg1), (TEST_VMEXIT_IP, 1, exit_reason::HLT));

        assert_eq!(mk.vmexit_log(1).unwrap().len(), 1);
        assert!(mk.vmexit_log(2).is_none());
        assert_eq!(mk.start_core(&mut ap, &mut ap_intrinsic), Err(HyperError::BadState));
    }

    fn exit_at_boot(call: &Call, port: &mut dyn SyscallPort) -> Result<(), BfStatus> {
        let mut sys = BfSyscall::initialize(port, BF_SPEC_ID1_VAL)?;
        if call.ip == TEST_ENTRY_IP {
            sys.register_bootstrap(TEST_BOOTSTRAP_IP)?;
            sys.register_vmexit(TEST_VMEXIT_IP)?;
        } else {
            sys.control_exit()?;
        }
        match sys.release() {
            BF_STATUS_SUCCESS => Ok(()),
            status => Err(status),
        }
    }

    #[test]
    fn exit_during_bootstrap_fails_the_boot() {
        let (image, calls) = ScriptedExt::new(|call, port| Ok(status_of_result(exit_at_boot(call, port))));
        let mk = Microkernel::<MockHal>::new(1, None, vec![Box::new(image) as _]).unwrap();
        let mut tls = mk.new_tls(&args(0, 1)).unwrap();
        let mut intrinsic = MockIntrinsic::new();
        assert_eq!(mk.start_core(&mut tls, &mut intrinsic), Err(HyperError::BadState));
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(intrinsic.launches, 0);
        assert!(!intrinsic.halted);
    }

    #[test]
    fn nmi_during_boot_stays_pending() {
        let (image, calls) = ScriptedExt::new(|_, _| {
            Err(ExtFault {
                vector: esr::NMI_VECTOR,
                ..ExtFault::default()
            })
        });
        let mk = Microkernel::<MockHal>::new(1, None, vec![Box::new(image) as _]).unwrap();
        let mut tls = mk.new_tls(&args(0, 1)).unwrap();
        let mut intrinsic = MockIntrinsic::new();
        assert_eq!(mk.start_core(&mut tls, &mut intrinsic), Err(HyperError::Internal));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(tls.nmi_pending);
        assert_eq!(tls.esr.vector, esr::NMI_VECTOR);
        assert_eq!(intrinsic.launches, 0);
        assert!(!intrinsic.halted);
    }

    #[test]
    fn failing_entry_point_fails_the_boot() {
        let (image, _) = ScriptedExt::new(|_, _| Ok(BF_STATUS_FAILURE_UNKNOWN));
        let mk = Microkernel::<MockHal>::new(1, None, vec![Box::new(image) as _]).unwrap();
        let mut tls = mk.new_tls(&args(0, 1)).unwrap();
        let mut intrinsic = MockIntrinsic::new();
        assert_eq!(mk.start_core(&mut tls, &mut intrinsic), Err(HyperError::Internal));
    }
}
