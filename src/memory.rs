use bitflags;
use core::marker::PhantomData;

use crate::{HyperError, HyperResult, MkCraftHal};

/// Host physical address.
pub type HostPhysAddr = usize;
/// Host virtual address.
pub type HostVirtAddr = usize;

/// Size of a 4K page.
pub const PAGE_SIZE_4K: usize = 0x1000;
/// Size of a 2M block.
pub const PAGE_SIZE_2M: usize = 0x20_0000;

/// Returns true if `addr` is aligned to a 4K page.
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE_4K - 1) == 0
}

/// Returns the number of 4K pages needed to cover `size` bytes.
pub const fn pages_for(size: usize) -> usize {
    (size + PAGE_SIZE_4K - 1) / PAGE_SIZE_4K
}

bitflags::bitflags! {
    /// Permission of a mapped memory region.
    pub struct MemFlags: u64 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXECUTE       = 1 << 2;
        const USER          = 1 << 3;
    }
}

impl MemFlags {
    /// Read-only data.
    pub const RO: Self = Self::READ;
    /// Read/write data.
    pub const RW: Self = Self::from_bits_truncate(Self::READ.bits() | Self::WRITE.bits());
    /// Read/execute code.
    pub const RE: Self = Self::from_bits_truncate(Self::READ.bits() | Self::EXECUTE.bits());

    /// A mapping may be writable or executable, never both.
    pub fn is_wx(&self) -> bool {
        self.contains(Self::WRITE | Self::EXECUTE)
    }
}

/// A 4K-sized contiguous physical memory page, it will deallocate the page
/// automatically on drop.
#[derive(Debug)]
pub struct PhysFrame<H: MkCraftHal> {
    start_paddr: HostPhysAddr,
    _phantom: PhantomData<H>,
}

impl<H: MkCraftHal> PhysFrame<H> {
    /// Allocates a page from the HAL.
    pub fn alloc() -> HyperResult<Self> {
        let start_paddr = H::alloc_page().ok_or(HyperError::NoMemory)?;
        if start_paddr == 0 {
            return Err(HyperError::Internal);
        }
        Ok(Self {
            start_paddr,
            _phantom: PhantomData,
        })
    }

    /// Allocates a page and fills it with zeros.
    pub fn alloc_zero() -> HyperResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    /// Physical address of the page.
    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    /// Pointer to the page through the HAL's physical map.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr) as *mut u8
    }

    /// Fills the whole page with `byte`.
    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, H::PAGE_SIZE) }
    }

    /// Gives up ownership of the page without freeing it.
    pub fn into_raw(self) -> HostPhysAddr {
        let paddr = self.start_paddr;
        core::mem::forget(self);
        paddr
    }
}

impl<H: MkCraftHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        if self.start_paddr > 0 {
            H::dealloc_page(self.start_paddr);
        }
    }
}
