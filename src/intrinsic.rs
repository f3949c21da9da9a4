use crate::arch::{GeneralRegisters, StateSave};
use crate::memory::{HostPhysAddr, HostVirtAddr};
use crate::HyperResult;

/// Raw per-core CPU primitives the microkernel consumes.
///
/// Each physical core owns exactly one implementation and passes it by
/// `&mut` through every entry point, so no method needs to be reentrant.
pub trait Intrinsic {
    /// VMCS revision identifier reported by IA32_VMX_BASIC.
    fn vmcs_revision_id(&self) -> u32;

    /// Makes the VMCS at `vmcs` current on this core (`vmptrld`).
    fn vmld(&mut self, vmcs: HostPhysAddr) -> HyperResult;
    /// Flushes the VMCS at `vmcs` to memory and marks it inactive (`vmclear`).
    fn vmcl(&mut self, vmcs: HostPhysAddr) -> HyperResult;
    /// Reads a field of the current VMCS.
    fn vmrd(&self, field: u32) -> HyperResult<u64>;
    /// Writes a field of the current VMCS.
    fn vmwr(&mut self, field: u32, value: u64) -> HyperResult;

    /// Enters the guest described by the current VMCS with `gprs` loaded,
    /// using `vmlaunch` if `launched` is false and `vmresume` otherwise.
    /// Returns the basic exit reason once the guest exits.
    fn vmrun(&mut self, gprs: &mut GeneralRegisters, launched: bool) -> HyperResult<u64>;

    /// Read 64 bits msr register.
    fn rdmsr(&self, msr: u32) -> u64;
    /// Write 64 bits to msr register.
    fn wrmsr(&mut self, msr: u32, value: u64);

    /// Switches this core to the root page table at `rpt`.
    fn set_rpt(&mut self, rpt: HostPhysAddr);
    /// Invalidates the TLB entry for `virt` on this core.
    fn invlpg(&mut self, virt: HostVirtAddr);

    /// Restores `state` as the architectural state of this core and leaves
    /// VMX operation.
    fn promote(&mut self, state: &StateSave);
    /// Stops this core.
    fn halt(&mut self);
}
