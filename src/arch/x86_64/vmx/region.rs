use bit_field::BitField;

use crate::memory::PhysFrame;
use crate::{HostPhysAddr, HostVirtAddr, HyperResult, MkCraftHal};

/// VMCS/VMXON region in 4K size. (SDM Vol. 3C, Section 24.2)
#[derive(Debug)]
pub struct VmxRegion<H: MkCraftHal> {
    frame: PhysFrame<H>,
}

impl<H: MkCraftHal> VmxRegion<H> {
    /// Allocates a zeroed region and stamps the revision identifier into its
    /// first word.
    pub fn new(revision_id: u32, shadow_indicator: bool) -> HyperResult<Self> {
        let frame = PhysFrame::alloc_zero()?;
        unsafe {
            (*(frame.as_mut_ptr() as *mut u32))
                .set_bits(0..=30, revision_id)
                .set_bit(31, shadow_indicator);
        }
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    pub fn virt_addr(&self) -> HostVirtAddr {
        self.frame.as_mut_ptr() as usize
    }

    /// The revision identifier stored in the region header.
    pub fn revision_id(&self) -> u32 {
        unsafe { (*(self.frame.as_mut_ptr() as *const u32)).get_bits(0..=30) }
    }
}
