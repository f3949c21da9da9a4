use core::ops::Range;

use super::{table_index, PageTable64, Translation, X64Entry, X64PagingMetaData, ENTRY_COUNT};
use crate::config::MK_ROOT_INDEX_START;
use crate::memory::{pages_for, HostPhysAddr, HostVirtAddr, MemFlags, PAGE_SIZE_4K};
use crate::{HyperError, HyperResult, Intrinsic, MkCraftHal};

/// The address space an extension runs in.
///
/// The lower half belongs to the extension and is only ever mapped with user
/// permissions. The upper half is aliased from the microkernel's own root
/// table and is never released by this one.
pub struct RootPageTable<H: MkCraftHal> {
    pt: PageTable64<X64PagingMetaData, X64Entry, H>,
}

impl<H: MkCraftHal> RootPageTable<H> {
    pub fn new() -> HyperResult<Self> {
        Ok(Self {
            pt: PageTable64::try_new()?,
        })
    }

    /// Physical address to load into CR3.
    pub fn root_paddr(&self) -> HostPhysAddr {
        self.pt.root_paddr()
    }

    /// Shares the microkernel half of `mk_root` with this table.
    pub fn add_tables(&mut self, mk_root: HostPhysAddr) -> HyperResult {
        self.pt
            .alias_root_entries(mk_root, MK_ROOT_INDEX_START..ENTRY_COUNT)
    }

    fn check_user_range(vaddr: HostVirtAddr) -> HyperResult {
        if table_index(vaddr, 3) >= MK_ROOT_INDEX_START || vaddr >> 47 != 0 {
            error!("[MK] {:#x} is outside the extension half", vaddr);
            return Err(HyperError::OutOfRange);
        }
        Ok(())
    }

    /// Maps one 4K page for the extension.
    ///
    /// Fails with `InvalidParam` for a writable and executable mapping.
    pub fn map_page(
        &mut self,
        vaddr: HostVirtAddr,
        paddr: HostPhysAddr,
        flags: MemFlags,
        auto_release: bool,
    ) -> HyperResult {
        if flags.is_wx() {
            error!("[MK] w^x violation mapping {:#x} -> {:#x}", vaddr, paddr);
            return Err(HyperError::InvalidParam);
        }
        Self::check_user_range(vaddr)?;
        let flags = flags | MemFlags::READ | MemFlags::USER;
        self.pt.map_page(vaddr, paddr, flags, auto_release)
    }

    /// Maps `size` bytes of physically contiguous memory page by page.
    pub fn map_range(
        &mut self,
        vaddr: HostVirtAddr,
        paddr: HostPhysAddr,
        size: usize,
        flags: MemFlags,
    ) -> HyperResult {
        for i in 0..pages_for(size) {
            let off = i * PAGE_SIZE_4K;
            self.map_page(vaddr + off, paddr + off, flags, false)?;
        }
        Ok(())
    }

    /// Backs `vaddr` with a fresh zeroed page owned by this table.
    pub fn alloc_page(&mut self, vaddr: HostVirtAddr, flags: MemFlags) -> HyperResult<HostPhysAddr> {
        let paddr = H::alloc_page().ok_or(HyperError::NoMemory)?;
        unsafe { core::ptr::write_bytes(H::phys_to_virt(paddr) as *mut u8, 0, PAGE_SIZE_4K) };
        if let Err(err) = self.map_page(vaddr, paddr, flags, true) {
            H::dealloc_page(paddr);
            return Err(err);
        }
        Ok(paddr)
    }

    /// Backs `[vaddr, vaddr + size)` with fresh pages.
    pub fn alloc_region(&mut self, vaddr: HostVirtAddr, size: usize, flags: MemFlags) -> HyperResult {
        for i in 0..pages_for(size) {
            self.alloc_page(vaddr + i * PAGE_SIZE_4K, flags)?;
        }
        Ok(())
    }

    /// Reserves the page at `vaddr` as a guard, so any access faults.
    pub fn reserve_guard(&mut self, vaddr: HostVirtAddr) -> HyperResult {
        Self::check_user_range(vaddr)?;
        self.pt.reserve(vaddr)
    }

    /// Unmaps the page at `vaddr`. Unmapping an unmapped page returns `None`.
    pub fn unmap_page(&mut self, vaddr: HostVirtAddr) -> HyperResult<Option<Translation>> {
        Self::check_user_range(vaddr)?;
        self.pt.unmap(vaddr)
    }

    pub fn query(&self, vaddr: HostVirtAddr) -> Option<Translation> {
        self.pt.query(vaddr)
    }

    /// Raw bits of the 4K entry for `vaddr`.
    pub fn entry_bits(&self, vaddr: HostVirtAddr) -> Option<u64> {
        self.pt.raw_entry(vaddr)
    }

    /// Number of pages this table maps inside `window`, excluding aliases.
    pub fn pages_in(&self, window: Range<HostVirtAddr>) -> usize {
        let mut count = 0;
        self.pt.for_each_leaf(|vaddr, t| {
            if window.contains(&vaddr) {
                count += t.page_size / PAGE_SIZE_4K;
            }
        });
        count
    }

    /// Switches the calling core to this address space.
    pub fn activate<I: Intrinsic>(&self, intrinsic: &mut I) {
        intrinsic.set_rpt(self.root_paddr());
    }

    /// Logs a summary of this table.
    pub fn dump(&self) {
        info!(
            "[MK] rpt {:#x}: {} tables, {} user pages",
            self.root_paddr(),
            self.pt.table_count(),
            self.pages_in(0..(1 << 47))
        );
    }
}
