use crate::memory::{HostPhysAddr, HostVirtAddr, PAGE_SIZE_4K};

/// The interfaces which the underlying software (loader or host kernel) must
/// implement.
pub trait MkCraftHal: Sized {
    /// Page size.
    const PAGE_SIZE: usize = PAGE_SIZE_4K;

    /// Allocates a 4K-sized physical page, returns its physical address.
    fn alloc_page() -> Option<HostPhysAddr> {
        Self::alloc_pages(1)
    }
    /// Deallocates the given physical page.
    fn dealloc_page(pa: HostPhysAddr) {
        Self::dealloc_pages(pa, 1)
    }
    /// Allocates physically contiguous pages, returns the physical address of
    /// the first one.
    fn alloc_pages(num_pages: usize) -> Option<HostPhysAddr>;
    /// Gives back the allocated pages starts from `pa` to the page allocator.
    fn dealloc_pages(pa: HostPhysAddr, num_pages: usize);

    /// Convert a host physical address to host virtual address.
    fn phys_to_virt(pa: HostPhysAddr) -> HostVirtAddr;
    /// Convert a host virtual address to host physical address.
    fn virt_to_phys(va: HostVirtAddr) -> HostPhysAddr;
}
