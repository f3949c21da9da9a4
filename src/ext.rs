//! Extensions: their handles, callbacks and address spaces.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::arch::GeneralRegisters;
use crate::config::*;
use crate::memory::{is_page_aligned, pages_for, HostPhysAddr, HostVirtAddr, MemFlags, PAGE_SIZE_4K};
use crate::paging::RootPageTable;
use crate::syscall::{make_handle, SyscallPort, BF_INVALID_HANDLE, BF_SPEC_ID1_VAL};
use crate::{HyperError, HyperResult, Intrinsic, MkCraftHal, Tls};

/// A loadable segment of an extension image. The loader has already placed
/// it in physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: HostVirtAddr,
    pub paddr: HostPhysAddr,
    pub size: usize,
    pub flags: MemFlags,
}

/// A CPU exception taken while extension code was running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtFault {
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
}

/// A loaded extension image and the means to run its code.
pub trait ExtensionImage: Send + Sync {
    /// The segments to map, in load order.
    fn segments(&self) -> &[Segment];

    /// Address of the extension's entry point.
    fn entry_ip(&self) -> u64;

    /// Runs the extension code at `ip` on stack `sp` with two arguments until
    /// it returns to the microkernel.
    ///
    /// Every syscall the code makes goes through `port`. Returns the status
    /// the code returned, or the exception that stopped it.
    ///
    /// `Err` aborts the callback. An NMI that arrives while the code runs
    /// should instead be handed to [`Microkernel::dispatch_esr`], which marks
    /// it pending for the guest, after which the code resumes where it was.
    /// An NMI returned as `Err` is still kept pending, but the callback is
    /// treated as failed.
    ///
    /// [`Microkernel::dispatch_esr`]: crate::Microkernel::dispatch_esr
    fn execute(
        &self,
        ip: u64,
        sp: u64,
        arg0: u64,
        arg1: u64,
        port: &mut dyn SyscallPort,
    ) -> Result<u64, ExtFault>;
}

/// The TLS block extension code finds through its thread pointer. Offsets are
/// part of the syscall ABI.
#[repr(C)]
pub struct ExtTlsBlock {
    reserved0: [u8; 0x800],
    /// Registers of the active VS.
    pub gprs: GeneralRegisters,
    reserved1: [u8; 0x778],
    pub active_extid: u16,
    pub active_vmid: u16,
    pub active_vpid: u16,
    pub active_vsid: u16,
    pub active_ppid: u16,
    pub online_pps: u16,
    reserved2: [u8; 4],
}

impl ExtTlsBlock {
    /// Copies the core's active ids and VS registers into the block.
    pub(crate) fn publish(&mut self, tls: &Tls) {
        self.gprs = tls.gprs;
        self.active_extid = tls.active_extid;
        self.active_vmid = tls.active_vmid;
        self.active_vpid = tls.active_vpid;
        self.active_vsid = tls.active_vsid;
        self.active_ppid = tls.ppid;
        self.online_pps = tls.online_pps;
    }

    /// Picks up register changes the extension made.
    pub(crate) fn read_back(&self, tls: &mut Tls) {
        tls.gprs = self.gprs;
    }
}

/// Base of the per-core region for `ppid` inside a window of per-core
/// regions. Each region starts with a guard page.
const fn per_core_base(window: usize, size: usize, ppid: u16) -> usize {
    window + ppid as usize * (size + PAGE_SIZE_4K)
}

fn in_window(addr: usize, len: usize, window: Range<usize>) -> bool {
    addr >= window.start && addr < window.end && len <= window.end - addr
}

/// Virtual address of `phys` in `vmid`'s direct map window.
pub(crate) fn direct_map_addr(vmid: u16, phys: HostPhysAddr) -> HostVirtAddr {
    EXT_DIRECT_MAP_ADDR + vmid as usize * EXT_DIRECT_MAP_SIZE + phys
}

/// A loaded extension.
pub struct Extension<H: MkCraftHal> {
    id: u16,
    image: Box<dyn ExtensionImage>,
    online_pps: u16,

    handle: AtomicU64,
    opens: AtomicU32,

    bootstrap_ip: AtomicU64,
    vmexit_ip: AtomicU64,
    fail_ip: AtomicU64,

    rpt: Mutex<RootPageTable<H>>,
    tls_blocks: ArrayVec<HostPhysAddr, MAX_PPS>,
    huge_allocs: Mutex<Vec<(HostPhysAddr, usize)>>,
}

impl<H: MkCraftHal> Extension<H> {
    /// Builds the address space of extension `id`.
    ///
    /// Maps the image's segments plus a stack, a fail stack and a TLS region
    /// for each of the `online_pps` cores. When `mk_root` is given the
    /// microkernel's half of that root table is shared into the new one.
    pub fn new(
        id: u16,
        image: Box<dyn ExtensionImage>,
        online_pps: u16,
        mk_root: Option<HostPhysAddr>,
    ) -> HyperResult<Self> {
        if online_pps == 0 || online_pps as usize > MAX_PPS {
            return Err(HyperError::InvalidParam);
        }
        let mut rpt = RootPageTable::new()?;
        if let Some(root) = mk_root {
            rpt.add_tables(root)?;
        }
        let mut ext = Self {
            id,
            image,
            online_pps,
            handle: AtomicU64::new(BF_INVALID_HANDLE),
            opens: AtomicU32::new(0),
            bootstrap_ip: AtomicU64::new(0),
            vmexit_ip: AtomicU64::new(0),
            fail_ip: AtomicU64::new(0),
            rpt: Mutex::new(rpt),
            tls_blocks: ArrayVec::new(),
            huge_allocs: Mutex::new(Vec::new()),
        };
        ext.map_code()?;
        for ppid in 0..online_pps {
            ext.map_stack(ppid)?;
            ext.map_fail_stack(ppid)?;
            ext.map_tls(ppid)?;
        }
        info!("[MK] ext {:#x} loaded for {} pps", id, online_pps);
        Ok(ext)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn image(&self) -> &dyn ExtensionImage {
        &*self.image
    }

    /// Maps every image segment into the code window.
    pub fn map_code(&mut self) -> HyperResult {
        let rpt = self.rpt.get_mut();
        for seg in self.image.segments() {
            let code_window = EXT_CODE_ADDR..EXT_CODE_ADDR + EXT_CODE_SIZE;
            if !is_page_aligned(seg.vaddr)
                || !is_page_aligned(seg.paddr)
                || !in_window(seg.vaddr, seg.size, code_window)
            {
                error!(
                    "[MK] ext {:#x} segment {:#x}+{:#x} is outside the code window",
                    self.id, seg.vaddr, seg.size
                );
                return Err(HyperError::InvalidParam);
            }
            rpt.map_range(seg.vaddr, seg.paddr, seg.size, seg.flags)?;
        }
        Ok(())
    }

    fn map_guarded(
        &mut self,
        window: usize,
        size: usize,
        ppid: u16,
    ) -> HyperResult<(HostVirtAddr, HostPhysAddr)> {
        let base = per_core_base(window, size, ppid);
        let bottom = base + PAGE_SIZE_4K;
        let rpt = self.rpt.get_mut();
        rpt.reserve_guard(base)?;
        if let Some(t) = rpt.query(bottom) {
            return Ok((bottom, t.paddr));
        }
        let first = rpt.alloc_page(bottom, MemFlags::RW)?;
        rpt.alloc_region(bottom + PAGE_SIZE_4K, size - PAGE_SIZE_4K, MemFlags::RW)?;
        Ok((bottom, first))
    }

    /// Maps the stack `ppid` runs callbacks on, below a guard page.
    pub fn map_stack(&mut self, ppid: u16) -> HyperResult {
        self.map_guarded(EXT_STACK_ADDR, EXT_STACK_SIZE, ppid)
            .map(|_| ())
    }

    /// Maps the stack `ppid` runs the fail callback on, below a guard page.
    pub fn map_fail_stack(&mut self, ppid: u16) -> HyperResult {
        self.map_guarded(EXT_FAIL_STACK_ADDR, EXT_FAIL_STACK_SIZE, ppid)
            .map(|_| ())
    }

    /// Maps the TLS region of `ppid`. Its second page is the [`ExtTlsBlock`].
    pub fn map_tls(&mut self, ppid: u16) -> HyperResult {
        let (bottom, _) = self.map_guarded(EXT_TLS_ADDR, EXT_TLS_SIZE, ppid)?;
        let block = self
            .rpt
            .get_mut()
            .query(bottom + PAGE_SIZE_4K)
            .ok_or(HyperError::Internal)?;
        if self.tls_blocks.len() == ppid as usize {
            self.tls_blocks.push(block.paddr);
        }
        Ok(())
    }

    /// Top of the stack for `ppid`.
    pub fn stack_top(&self, ppid: u16) -> u64 {
        (per_core_base(EXT_STACK_ADDR, EXT_STACK_SIZE, ppid) + PAGE_SIZE_4K + EXT_STACK_SIZE) as u64
    }

    /// Top of the fail stack for `ppid`.
    pub fn fail_stack_top(&self, ppid: u16) -> u64 {
        let base = per_core_base(EXT_FAIL_STACK_ADDR, EXT_FAIL_STACK_SIZE, ppid);
        (base + PAGE_SIZE_4K + EXT_FAIL_STACK_SIZE) as u64
    }

    /// Thread pointer of `ppid`, the address of its [`ExtTlsBlock`].
    pub fn tls_block_addr(&self, ppid: u16) -> u64 {
        (per_core_base(EXT_TLS_ADDR, EXT_TLS_SIZE, ppid) + 2 * PAGE_SIZE_4K) as u64
    }

    /// The TLS block of `ppid`, seen through the microkernel's mapping.
    ///
    /// Only the core `ppid` may call this, and only one reference may be
    /// live at a time.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn tls_block(&self, ppid: u16) -> HyperResult<&mut ExtTlsBlock> {
        let paddr = *self
            .tls_blocks
            .get(ppid as usize)
            .ok_or(HyperError::OutOfRange)?;
        Ok(unsafe { &mut *(H::phys_to_virt(paddr) as *mut ExtTlsBlock) })
    }

    /// Switches the calling core into this extension's address space.
    pub fn activate<I: Intrinsic>(&self, intrinsic: &mut I) {
        self.rpt.lock().activate(intrinsic);
    }

    /// Opens the extension's handle for ABI `version`.
    ///
    /// Fails with `NotSupported` for another version, and with
    /// `AlreadyExists` while a handle is open.
    pub fn open_handle(&self, version: u64) -> HyperResult<u64> {
        if version != BF_SPEC_ID1_VAL {
            error!("[MK] ext {:#x} asked for unsupported version {:#x}", self.id, version);
            return Err(HyperError::NotSupported);
        }
        let nonce = self.opens.fetch_add(1, Ordering::Relaxed);
        let handle = make_handle(self.id, nonce);
        self.handle
            .compare_exchange(BF_INVALID_HANDLE, handle, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                error!("[MK] ext {:#x} already has an open handle", self.id);
                HyperError::AlreadyExists
            })?;
        Ok(handle)
    }

    /// Returns true if `handle` is this extension's open handle.
    pub fn is_handle_valid(&self, handle: u64) -> bool {
        handle != BF_INVALID_HANDLE && handle == self.handle.load(Ordering::Acquire)
    }

    pub fn close_handle(&self) {
        self.handle.store(BF_INVALID_HANDLE, Ordering::Release);
    }

    /// Whether `ip` is mapped executable inside the code window.
    pub fn is_code_addr(&self, ip: u64) -> bool {
        let ip = ip as usize;
        in_window(ip, 1, EXT_CODE_ADDR..EXT_CODE_ADDR + EXT_CODE_SIZE)
            && self
                .rpt
                .lock()
                .query(ip)
                .map_or(false, |t| t.flags.contains(MemFlags::EXECUTE))
    }

    fn check_ip(&self, ip: u64) -> HyperResult {
        if self.is_code_addr(ip) {
            Ok(())
        } else {
            error!("[MK] ext {:#x} callback {:#x} is not in its code", self.id, ip);
            Err(HyperError::InvalidParam)
        }
    }

    /// Registers the callback each core runs when it starts.
    pub fn register_bootstrap(&self, ip: u64) -> HyperResult {
        self.check_ip(ip)?;
        self.bootstrap_ip
            .compare_exchange(0, ip, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| HyperError::AlreadyExists)
    }

    /// Records the VMExit callback once this extension won the VMExit
    /// registration.
    pub(crate) fn set_vmexit_ip(&self, ip: u64) -> HyperResult {
        self.check_ip(ip)?;
        self.vmexit_ip.store(ip, Ordering::Release);
        Ok(())
    }

    /// Records the fail callback once this extension won the fail
    /// registration.
    pub(crate) fn set_fail_ip(&self, ip: u64) -> HyperResult {
        self.check_ip(ip)?;
        self.fail_ip.store(ip, Ordering::Release);
        Ok(())
    }

    fn ip_of(slot: &AtomicU64) -> Option<u64> {
        match slot.load(Ordering::Acquire) {
            0 => None,
            ip => Some(ip),
        }
    }

    pub fn bootstrap_ip(&self) -> Option<u64> {
        Self::ip_of(&self.bootstrap_ip)
    }

    pub fn vmexit_ip(&self) -> Option<u64> {
        Self::ip_of(&self.vmexit_ip)
    }

    pub fn fail_ip(&self) -> Option<u64> {
        Self::ip_of(&self.fail_ip)
    }

    /// Maps the page-pool page at `phys` and returns its address.
    pub fn map_page_pool(&self, phys: HostPhysAddr, auto_release: bool) -> HyperResult<HostVirtAddr> {
        if !is_page_aligned(phys) || phys >= EXT_PAGE_POOL_SIZE {
            return Err(HyperError::OutOfRange);
        }
        let virt = EXT_PAGE_POOL_ADDR + phys;
        self.rpt.lock().map_page(virt, phys, MemFlags::RW, auto_release)?;
        Ok(virt)
    }

    /// Maps `pages` contiguous heap-pool pages starting at `phys`.
    pub fn map_heap_pool(&self, phys: HostPhysAddr, pages: usize) -> HyperResult<HostVirtAddr> {
        let size = pages * PAGE_SIZE_4K;
        if !is_page_aligned(phys) || phys >= EXT_HEAP_POOL_SIZE || size > EXT_HEAP_POOL_SIZE - phys {
            return Err(HyperError::OutOfRange);
        }
        let virt = EXT_HEAP_POOL_ADDR + phys;
        self.rpt.lock().map_range(virt, phys, size, MemFlags::RW)?;
        Ok(virt)
    }

    /// Allocates a zeroed page for the extension. Returns `(virt, phys)`.
    pub fn alloc_page(&self) -> HyperResult<(HostVirtAddr, HostPhysAddr)> {
        let phys = H::alloc_page().ok_or(HyperError::NoMemory)?;
        unsafe { core::ptr::write_bytes(H::phys_to_virt(phys) as *mut u8, 0, PAGE_SIZE_4K) };
        match self.map_page_pool(phys, true) {
            Ok(virt) => Ok((virt, phys)),
            Err(err) => {
                H::dealloc_page(phys);
                Err(err)
            }
        }
    }

    /// Frees a page returned by [`Extension::alloc_page`].
    ///
    /// Fails with `InvalidParam` if `virt` is not an allocated page-pool
    /// page.
    pub fn free_page(&self, virt: HostVirtAddr) -> HyperResult {
        let window = EXT_PAGE_POOL_ADDR..EXT_PAGE_POOL_ADDR + EXT_PAGE_POOL_SIZE;
        if !is_page_aligned(virt) || !window.contains(&virt) {
            return Err(HyperError::InvalidParam);
        }
        match self.rpt.lock().unmap_page(virt)? {
            Some(_) => Ok(()),
            None => Err(HyperError::InvalidParam),
        }
    }

    /// Allocates physically contiguous memory for the extension. Returns
    /// `(virt, phys)`. Heap-pool memory lives as long as the extension.
    pub fn alloc_huge(&self, size: usize) -> HyperResult<(HostVirtAddr, HostPhysAddr)> {
        if size == 0 || size > EXT_HEAP_POOL_MAX_ALLOC {
            return Err(HyperError::InvalidParam);
        }
        let pages = pages_for(size);
        let phys = H::alloc_pages(pages).ok_or(HyperError::NoMemory)?;
        unsafe {
            core::ptr::write_bytes(H::phys_to_virt(phys) as *mut u8, 0, pages * PAGE_SIZE_4K)
        };
        match self.map_heap_pool(phys, pages) {
            Ok(virt) => {
                self.huge_allocs.lock().push((phys, pages));
                Ok((virt, phys))
            }
            Err(err) => {
                let mut rpt = self.rpt.lock();
                for i in 0..pages {
                    let _ = rpt.unmap_page(EXT_HEAP_POOL_ADDR + phys + i * PAGE_SIZE_4K);
                }
                H::dealloc_pages(phys, pages);
                Err(err)
            }
        }
    }

    /// Maps guest physical page `phys` of `vmid` into the direct map window.
    pub fn map_direct(&self, vmid: u16, phys: HostPhysAddr) -> HyperResult<HostVirtAddr> {
        if vmid as usize >= MAX_VMS || phys == 0 || !is_page_aligned(phys) || phys >= EXT_DIRECT_MAP_SIZE {
            return Err(HyperError::InvalidParam);
        }
        let virt = direct_map_addr(vmid, phys);
        self.rpt.lock().map_page(virt, phys, MemFlags::RW, false)?;
        Ok(virt)
    }

    /// Removes a direct map of `vmid`. Unmapping an unmapped page succeeds.
    pub fn unmap_direct(&self, vmid: u16, virt: HostVirtAddr) -> HyperResult {
        let base = direct_map_addr(vmid, 0);
        if vmid as usize >= MAX_VMS
            || !is_page_aligned(virt)
            || !(base..base + EXT_DIRECT_MAP_SIZE).contains(&virt)
        {
            return Err(HyperError::InvalidParam);
        }
        self.rpt.lock().unmap_page(virt).map(|_| ())
    }

    /// Copies a NUL-terminated string of at most `max` bytes out of the
    /// extension's address space.
    pub fn read_str(&self, virt: HostVirtAddr, max: usize) -> HyperResult<String> {
        let rpt = self.rpt.lock();
        let mut out = Vec::new();
        for i in 0..max {
            let t = rpt.query(virt + i).ok_or(HyperError::InvalidParam)?;
            if !t.flags.contains(MemFlags::USER) {
                return Err(HyperError::PermissionDenied);
            }
            let byte = unsafe { *(H::phys_to_virt(t.paddr) as *const u8) };
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Logs the extension's state.
    pub fn dump(&self) {
        info!(
            "[MK] ext {:#06x}: handle {}, bootstrap {:#x}, vmexit {:#x}, fail {:#x}",
            self.id,
            if self.handle.load(Ordering::Acquire) == BF_INVALID_HANDLE {
                "closed"
            } else {
                "open"
            },
            self.bootstrap_ip().unwrap_or(0),
            self.vmexit_ip().unwrap_or(0),
            self.fail_ip().unwrap_or(0)
        );
        self.rpt.lock().dump();
    }

    /// Number of page-pool pages the extension holds.
    pub fn page_pool_pages(&self) -> usize {
        self.rpt
            .lock()
            .pages_in(EXT_PAGE_POOL_ADDR..EXT_PAGE_POOL_ADDR + EXT_PAGE_POOL_SIZE)
    }

    pub fn dump_page_pool(&self) {
        info!("[MK] ext {:#06x} page pool: {} pages", self.id, self.page_pool_pages());
    }

    pub fn dump_huge_pool(&self) {
        let allocs = self.huge_allocs.lock();
        info!("[MK] ext {:#06x} huge pool: {} allocations", self.id, allocs.len());
        for (phys, pages) in allocs.iter() {
            info!("[MK]   {:#x}: {} pages", phys, pages);
        }
    }
}

impl<H: MkCraftHal> Drop for Extension<H> {
    fn drop(&mut self) {
        for (phys, pages) in self.huge_allocs.get_mut().drain(..) {
            H::dealloc_pages(phys, pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::*;
    use crate::test_support::*;
    use crate::StateSave;
    use memoffset::offset_of;

    fn ext(online_pps: u16) -> Extension<MockHal> {
        let (image, _) = ScriptedExt::new(|_, _| Ok(BF_STATUS_SUCCESS));
        Extension::new(0, Box::new(image), online_pps, None).unwrap()
    }

    #[test]
    fn tls_block_layout_matches_abi() {
        assert_eq!(offset_of!(ExtTlsBlock, gprs), TLS_OFFSET_RAX);
        assert_eq!(offset_of!(ExtTlsBlock, active_extid), TLS_OFFSET_ACTIVE_EXTID);
        assert_eq!(offset_of!(ExtTlsBlock, active_vmid), TLS_OFFSET_ACTIVE_VMID);
        assert_eq!(offset_of!(ExtTlsBlock, active_vpid), TLS_OFFSET_ACTIVE_VPID);
        assert_eq!(offset_of!(ExtTlsBlock, active_vsid), TLS_OFFSET_ACTIVE_VSID);
        assert_eq!(offset_of!(ExtTlsBlock, active_ppid), TLS_OFFSET_ACTIVE_PPID);
        assert_eq!(offset_of!(ExtTlsBlock, online_pps), TLS_OFFSET_ONLINE_PPS);
        assert_eq!(core::mem::size_of::<ExtTlsBlock>(), PAGE_SIZE_4K);
    }

    #[test]
    fn handle_lifecycle() {
        let ext = ext(1);
        assert!(!ext.is_handle_valid(BF_INVALID_HANDLE));
        assert_eq!(ext.open_handle(0x1234), Err(HyperError::NotSupported));

        let handle = ext.open_handle(BF_SPEC_ID1_VAL).unwrap();
        assert_eq!(handle >> 48, 0x6642);
        assert_eq!(handle & 0xFFFF, 1);
        assert!(ext.is_handle_valid(handle));
        assert!(!ext.is_handle_valid(handle ^ 0x1_0000));

        assert_eq!(ext.open_handle(BF_SPEC_ID1_VAL), Err(HyperError::AlreadyExists));
        assert!(ext.is_handle_valid(handle));

        ext.close_handle();
        ext.close_handle();
        assert!(!ext.is_handle_valid(handle));
        let reopened = ext.open_handle(BF_SPEC_ID1_VAL).unwrap();
        assert_ne!(reopened, handle);
        assert!(ext.is_handle_valid(reopened));
    }

    #[test]
    fn per_core_regions_sit_above_guard_pages() {
        let ext = ext(2);
        let rpt = ext.rpt.lock();
        for ppid in 0..2 {
            let top = ext.stack_top(ppid) as usize;
            let bottom = top - EXT_STACK_SIZE;
            let t = rpt.query(top - 8).unwrap();
            assert_eq!(t.flags, MemFlags::RW | MemFlags::USER);
            assert!(rpt.query(bottom).is_some());
            assert!(rpt.query(bottom - 8).is_none());
            assert_ne!(rpt.entry_bits(bottom - PAGE_SIZE_4K), Some(0));

            let fail_top = ext.fail_stack_top(ppid) as usize;
            assert!(rpt.query(fail_top - 8).is_some());
            assert!(rpt.query(fail_top - EXT_FAIL_STACK_SIZE - 8).is_none());

            assert!(rpt.query(ext.tls_block_addr(ppid) as usize).is_some());
        }
        assert_ne!(ext.stack_top(0), ext.stack_top(1));
        let code = rpt.query(TEST_ENTRY_IP as usize).unwrap();
        assert_eq!(code.flags, MemFlags::RE | MemFlags::USER);
    }

    #[test]
    fn mapping_a_region_twice_is_idempotent() {
        let mut ext = ext(1);
        let before = ext.rpt.lock().query(ext.stack_top(0) as usize - 8);
        ext.map_stack(0).unwrap();
        ext.map_tls(0).unwrap();
        ext.map_code().unwrap();
        assert_eq!(ext.rpt.lock().query(ext.stack_top(0) as usize - 8), before);
        assert_eq!(ext.tls_blocks.len(), 1);
    }

    #[test]
    fn tls_block_publishes_core_state() {
        let ext = ext(2);
        let mut tls = Tls::new(1, 2, StateSave::default());
        tls.active_extid = 0;
        tls.active_vsid = 7;
        tls.gprs.rax = 0x42;
        ext.tls_block(1).unwrap().publish(&tls);

        let paddr = ext.rpt.lock().query(ext.tls_block_addr(1) as usize).unwrap().paddr;
        let raw = MockHal::phys_to_virt(paddr);
        let read16 = |off: usize| unsafe { *((raw + off) as *const u16) };
        assert_eq!(read16(TLS_OFFSET_ACTIVE_VSID), 7);
        assert_eq!(read16(TLS_OFFSET_ACTIVE_PPID), 1);
        assert_eq!(read16(TLS_OFFSET_ONLINE_PPS), 2);
        assert_eq!(unsafe { *((raw + TLS_OFFSET_RAX) as *const u64) }, 0x42);

        unsafe { *((raw + TLS_OFFSET_RAX) as *mut u64) = 0x43 };
        ext.tls_block(1).unwrap().read_back(&mut tls);
        assert_eq!(tls.gprs.rax, 0x43);
        assert!(ext.tls_block(2).is_err());
    }

    #[test]
    fn callbacks_must_point_into_code() {
        let ext = ext(1);
        assert_eq!(ext.register_bootstrap(0x1000), Err(HyperError::InvalidParam));
        assert_eq!(
            ext.register_bootstrap(ext.stack_top(0) - 8),
            Err(HyperError::InvalidParam)
        );
        let code_end = (EXT_CODE_ADDR + EXT_CODE_SIZE) as u64;
        for ip in [code_end, code_end + 0x1000, u64::MAX] {
            assert!(!ext.is_code_addr(ip));
            assert_eq!(ext.register_bootstrap(ip), Err(HyperError::InvalidParam));
        }
        ext.register_bootstrap(TEST_BOOTSTRAP_IP).unwrap();
        assert_eq!(ext.bootstrap_ip(), Some(TEST_BOOTSTRAP_IP));
        assert_eq!(
            ext.register_bootstrap(TEST_BOOTSTRAP_IP),
            Err(HyperError::AlreadyExists)
        );
        assert_eq!(ext.vmexit_ip(), None);
    }

    #[test]
    fn window_bounds() {
        let window = 0x1000..0x3000;
        assert!(in_window(0x1000, 0x2000, window.clone()));
        assert!(in_window(0x2fff, 1, window.clone()));
        assert!(!in_window(0x2fff, 2, window.clone()));
        assert!(!in_window(0xfff, 1, window.clone()));
        assert!(!in_window(0x3000, 1, window.clone()));
        assert!(!in_window(usize::MAX, 1, window));
    }

    #[test]
    fn page_pool_pages_round_trip() {
        let start = outstanding_pages();
        {
            let ext = ext(1);
            let (virt, phys) = ext.alloc_page().unwrap();
            assert_eq!(virt, EXT_PAGE_POOL_ADDR + phys);
            assert_eq!(ext.page_pool_pages(), 1);
            ext.free_page(virt).unwrap();
            assert_eq!(ext.free_page(virt), Err(HyperError::InvalidParam));
            assert_eq!(ext.free_page(virt + 1), Err(HyperError::InvalidParam));
            assert_eq!(ext.free_page(0x1000), Err(HyperError::InvalidParam));
            ext.alloc_page().unwrap();
            assert_eq!(ext.page_pool_pages(), 1);
        }
        assert_eq!(outstanding_pages(), start);
    }

    #[test]
    fn huge_allocations_are_contiguous() {
        let start = outstanding_pages();
        {
            let ext = ext(1);
            assert_eq!(ext.alloc_huge(0), Err(HyperError::InvalidParam));
            assert_eq!(
                ext.alloc_huge(EXT_HEAP_POOL_MAX_ALLOC + 1),
                Err(HyperError::InvalidParam)
            );
            let (virt, phys) = ext.alloc_huge(3 * PAGE_SIZE_4K - 1).unwrap();
            assert_eq!(virt, EXT_HEAP_POOL_ADDR + phys);
            let rpt = ext.rpt.lock();
            for i in 0..3 {
                let off = i * PAGE_SIZE_4K;
                assert_eq!(rpt.query(virt + off).unwrap().paddr, phys + off);
            }
            assert!(rpt.query(virt + 3 * PAGE_SIZE_4K).is_none());
        }
        assert_eq!(outstanding_pages(), start);
    }

    #[test]
    fn direct_map_is_per_vm_and_idempotent() {
        let ext = ext(1);
        let virt = ext.map_direct(1, 0x5000).unwrap();
        assert_eq!(virt, EXT_DIRECT_MAP_ADDR + EXT_DIRECT_MAP_SIZE + 0x5000);
        assert_eq!(ext.map_direct(1, 0x5000), Ok(virt));
        assert_ne!(ext.map_direct(2, 0x5000).unwrap(), virt);
        assert_eq!(ext.map_direct(1, 0), Err(HyperError::InvalidParam));
        assert_eq!(ext.map_direct(1, 0x5001), Err(HyperError::InvalidParam));

        assert_eq!(ext.unmap_direct(2, virt), Err(HyperError::InvalidParam));
        ext.unmap_direct(1, virt).unwrap();
        ext.unmap_direct(1, virt).unwrap();
        assert!(ext.rpt.lock().query(virt).is_none());
    }

    #[test]
    fn strings_are_read_through_the_extension_mapping() {
        let ext = ext(1);
        let (virt, phys) = ext.alloc_page().unwrap();
        let host = MockHal::phys_to_virt(phys) as *mut u8;
        unsafe { core::ptr::copy_nonoverlapping(b"hello\0".as_ptr(), host, 6) };
        assert_eq!(ext.read_str(virt, 64).unwrap(), "hello");
        assert_eq!(ext.read_str(virt, 3).unwrap(), "hel");
        assert_eq!(ext.read_str(0x1000, 3), Err(HyperError::InvalidParam));
    }
}
