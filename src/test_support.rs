//! Host-side stand-ins for the platform, used by unit tests.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::boxed::Box;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use crate::arch::exit_reason;
use crate::memory::{HostPhysAddr, HostVirtAddr, PAGE_SIZE_4K};
use crate::syscall::{
    BfStatus, BfSyscall, SyscallPort, BF_INVALID_HANDLE, BF_ROOT_VMID, BF_SPEC_ID1_VAL,
    BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_SUCCESS,
};
use crate::{ExtFault, ExtensionImage, GeneralRegisters, HyperError, HyperResult, Intrinsic};
use crate::{MkCraftHal, Segment, StateSave};

/// Physical addresses handed out by [`MockHal`] start here, well below any
/// window the extension layout places them in.
const PHYS_BASE: HostPhysAddr = 0x10_0000;

struct PhysMap {
    next: HostPhysAddr,
    /// phys -> (host pointer, pages)
    by_phys: BTreeMap<HostPhysAddr, (HostVirtAddr, usize)>,
    /// host pointer -> phys
    by_virt: BTreeMap<HostVirtAddr, HostPhysAddr>,
    outstanding: isize,
}

thread_local! {
    static PHYS: RefCell<PhysMap> = RefCell::new(PhysMap {
        next: PHYS_BASE,
        by_phys: BTreeMap::new(),
        by_virt: BTreeMap::new(),
        outstanding: 0,
    });
}

/// Pages handed out by [`MockHal`] on this thread and not yet returned.
pub fn outstanding_pages() -> isize {
    PHYS.with(|m| m.borrow().outstanding)
}

fn layout(num_pages: usize) -> Layout {
    Layout::from_size_align(num_pages * PAGE_SIZE_4K, PAGE_SIZE_4K).unwrap()
}

/// HAL backed by the host allocator.
///
/// Every allocation gets a small, contiguous fake physical address so that
/// physical addresses fit the extension windows the way they do on real
/// machines. Translation goes through a per-thread table.
pub struct MockHal;

impl MkCraftHal for MockHal {
    fn alloc_pages(num_pages: usize) -> Option<HostPhysAddr> {
        let ptr = unsafe { alloc_zeroed(layout(num_pages)) };
        if ptr.is_null() {
            return None;
        }
        PHYS.with(|m| {
            let mut m = m.borrow_mut();
            let phys = m.next;
            m.next += num_pages * PAGE_SIZE_4K;
            m.by_phys.insert(phys, (ptr as HostVirtAddr, num_pages));
            m.by_virt.insert(ptr as HostVirtAddr, phys);
            m.outstanding += num_pages as isize;
            Some(phys)
        })
    }

    fn dealloc_pages(pa: HostPhysAddr, num_pages: usize) {
        PHYS.with(|m| {
            let mut m = m.borrow_mut();
            let (virt, pages) = m.by_phys.remove(&pa).expect("freeing unknown page");
            assert_eq!(pages, num_pages, "freeing {:#x} with the wrong size", pa);
            m.by_virt.remove(&virt);
            m.outstanding -= num_pages as isize;
            unsafe { dealloc(virt as *mut u8, layout(num_pages)) };
        })
    }

    fn phys_to_virt(pa: HostPhysAddr) -> HostVirtAddr {
        PHYS.with(|m| {
            let m = m.borrow();
            let (&base, &(virt, pages)) = m.by_phys.range(..=pa).next_back().expect("unknown phys");
            assert!(pa < base + pages * PAGE_SIZE_4K, "unknown phys {:#x}", pa);
            virt + (pa - base)
        })
    }

    fn virt_to_phys(va: HostVirtAddr) -> HostPhysAddr {
        PHYS.with(|m| {
            let m = m.borrow();
            let (&base, &phys) = m.by_virt.range(..=va).next_back().expect("unknown virt");
            phys + (va - base)
        })
    }
}

/// Records every intrinsic call and emulates VMCS storage.
#[derive(Default)]
pub struct MockIntrinsic {
    pub vmcs: BTreeMap<HostPhysAddr, BTreeMap<u32, u64>>,
    /// VMCS regions in the order they were first seen.
    pub order: Vec<HostPhysAddr>,
    pub current: Option<HostPhysAddr>,
    pub clears: Vec<HostPhysAddr>,
    pub fail_vmcl: bool,
    pub fail_entry: bool,
    pub launches: usize,
    pub resumes: usize,
    /// Exit reasons returned by successive entries. `HLT` once exhausted.
    pub exits: VecDeque<u64>,
    pub msrs: BTreeMap<u32, u64>,
    pub rpt: Option<HostPhysAddr>,
    pub rpt_loads: usize,
    pub invlpgs: Vec<HostVirtAddr>,
    pub promoted: Option<StateSave>,
    pub halted: bool,
}

impl MockIntrinsic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_exits(&mut self, reasons: &[u64]) {
        self.exits.extend(reasons.iter().copied());
    }

    /// Fields of the `n`th VMCS region seen.
    pub fn vmcs_of(&self, n: usize) -> &BTreeMap<u32, u64> {
        &self.vmcs[&self.order[n]]
    }

    fn touch(&mut self, vmcs: HostPhysAddr) {
        if !self.vmcs.contains_key(&vmcs) {
            self.vmcs.insert(vmcs, BTreeMap::new());
            self.order.push(vmcs);
        }
    }

    fn current_mut(&mut self) -> HyperResult<&mut BTreeMap<u32, u64>> {
        let current = self.current.ok_or(HyperError::BadState)?;
        self.vmcs.get_mut(&current).ok_or(HyperError::BadState)
    }
}

impl Intrinsic for MockIntrinsic {
    fn vmcs_revision_id(&self) -> u32 {
        0x12
    }

    fn vmld(&mut self, vmcs: HostPhysAddr) -> HyperResult {
        self.touch(vmcs);
        self.current = Some(vmcs);
        Ok(())
    }

    fn vmcl(&mut self, vmcs: HostPhysAddr) -> HyperResult {
        if self.fail_vmcl {
            return Err(HyperError::BadState);
        }
        self.touch(vmcs);
        self.clears.push(vmcs);
        if self.current == Some(vmcs) {
            self.current = None;
        }
        Ok(())
    }

    fn vmrd(&self, field: u32) -> HyperResult<u64> {
        let current = self.current.ok_or(HyperError::BadState)?;
        Ok(self.vmcs[&current].get(&field).copied().unwrap_or(0))
    }

    fn vmwr(&mut self, field: u32, value: u64) -> HyperResult {
        self.current_mut()?.insert(field, value);
        Ok(())
    }

    fn vmrun(&mut self, _gprs: &mut GeneralRegisters, launched: bool) -> HyperResult<u64> {
        self.current_mut()?;
        if self.fail_entry {
            return Err(HyperError::BadState);
        }
        if launched {
            self.resumes += 1;
        } else {
            self.launches += 1;
        }
        Ok(self.exits.pop_front().unwrap_or(exit_reason::HLT))
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    fn set_rpt(&mut self, rpt: HostPhysAddr) {
        self.rpt = Some(rpt);
        self.rpt_loads += 1;
    }

    fn invlpg(&mut self, virt: HostVirtAddr) {
        self.invlpgs.push(virt);
    }

    fn promote(&mut self, state: &StateSave) {
        self.promoted = Some(*state);
    }

    fn halt(&mut self) {
        self.halted = true;
    }
}

/// Code address of the test extension's entry point.
pub const TEST_ENTRY_IP: u64 = crate::config::EXT_CODE_ADDR as u64;
/// Code address the test extension registers for bootstrap callbacks.
pub const TEST_BOOTSTRAP_IP: u64 = TEST_ENTRY_IP + 0x100;
/// Code address the test extension registers for VMExit callbacks.
pub const TEST_VMEXIT_IP: u64 = TEST_ENTRY_IP + 0x200;
/// Code address the test extension registers for fail callbacks.
pub const TEST_FAIL_IP: u64 = TEST_ENTRY_IP + 0x300;

/// One call into the test extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub ip: u64,
    pub sp: u64,
    pub arg0: u64,
    pub arg1: u64,
}

type Script = dyn Fn(&Call, &mut dyn SyscallPort) -> Result<u64, ExtFault> + Send + Sync;

/// An extension whose code is a closure. Every call is recorded.
pub struct ScriptedExt {
    segments: Vec<Segment>,
    script: Box<Script>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedExt {
    /// Creates an extension with one read/execute code page and returns the
    /// shared call record alongside it.
    pub fn new<F>(script: F) -> (Self, Arc<Mutex<Vec<Call>>>)
    where
        F: Fn(&Call, &mut dyn SyscallPort) -> Result<u64, ExtFault> + Send + Sync + 'static,
    {
        let code = MockHal::alloc_page().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ext = Self {
            segments: vec![Segment {
                vaddr: TEST_ENTRY_IP as usize,
                paddr: code,
                size: PAGE_SIZE_4K,
                flags: crate::MemFlags::RE,
            }],
            script: Box::new(script),
            calls: calls.clone(),
        };
        (ext, calls)
    }
}

impl ExtensionImage for ScriptedExt {
    fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn entry_ip(&self) -> u64 {
        TEST_ENTRY_IP
    }

    fn execute(
        &self,
        ip: u64,
        sp: u64,
        arg0: u64,
        arg1: u64,
        port: &mut dyn SyscallPort,
    ) -> Result<u64, ExtFault> {
        let call = Call { ip, sp, arg0, arg1 };
        self.calls.lock().unwrap().push(call);
        (self.script)(&call, port)
    }
}

impl Drop for ScriptedExt {
    fn drop(&mut self) {
        for seg in self.segments.iter() {
            MockHal::dealloc_page(seg.paddr);
        }
    }
}

/// One callback of a test extension, written against the typed syscalls.
pub type Handler = Box<dyn Fn(&mut BfSyscall<'_>, &Call) -> Result<u64, ExtFault> + Send + Sync>;

/// Collapses a syscall result into the status a callback returns.
pub fn status_of_result(r: Result<(), BfStatus>) -> u64 {
    match r {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(status) => status,
    }
}

fn root_entry(port: &mut dyn SyscallPort, handle: &AtomicU64, has_fail: bool) -> Result<(), BfStatus> {
    let mut sys = BfSyscall::initialize(port, BF_SPEC_ID1_VAL)?;
    handle.store(sys.handle(), Ordering::Relaxed);
    sys.register_bootstrap(TEST_BOOTSTRAP_IP)?;
    sys.register_vmexit(TEST_VMEXIT_IP)?;
    if has_fail {
        sys.register_fail(TEST_FAIL_IP)?;
    }
    Ok(())
}

fn root_bootstrap(sys: &mut BfSyscall<'_>) -> Result<(), BfStatus> {
    let ppid = sys.tls_ppid();
    let vpid = sys.create_vp(BF_ROOT_VMID)?;
    let vsid = sys.create_vs(vpid, ppid)?;
    sys.init_as_root(vsid)?;
    sys.run(BF_ROOT_VMID, vpid, vsid)
}

/// An extension that behaves like a minimal root VM policy: it registers its
/// callbacks from the entry point, and its bootstrap callback creates a VP and
/// a VS for the calling core, initializes the VS from the loader's state and
/// runs it. Exits go to `on_vmexit`, failures to `on_fail`.
pub fn root_ext(on_vmexit: Handler, on_fail: Option<Handler>) -> (ScriptedExt, Arc<Mutex<Vec<Call>>>) {
    let handle = AtomicU64::new(BF_INVALID_HANDLE);
    let has_fail = on_fail.is_some();
    ScriptedExt::new(move |call, port| {
        if call.ip == TEST_ENTRY_IP {
            return Ok(status_of_result(root_entry(port, &handle, has_fail)));
        }

        let mut sys = BfSyscall::with_handle(port, handle.load(Ordering::Relaxed));
        match call.ip {
            TEST_BOOTSTRAP_IP => Ok(status_of_result(root_bootstrap(&mut sys))),
            TEST_VMEXIT_IP => on_vmexit(&mut sys, call),
            TEST_FAIL_IP => match &on_fail {
                Some(on_fail) => on_fail(&mut sys, call),
                None => Ok(BF_STATUS_FAILURE_UNKNOWN),
            },
            _ => Ok(BF_STATUS_FAILURE_UNKNOWN),
        }
    })
}

/// Resumes the guest past every CPUID and promotes the exiting VS on any
/// other exit.
pub fn cpuid_then_promote() -> Handler {
    Box::new(|sys, call| {
        if call.arg1 == exit_reason::CPUID {
            return Ok(status_of_result(sys.advance_ip_and_run_current()));
        }
        Ok(status_of_result(sys.promote(call.arg0 as u16)))
    })
}
