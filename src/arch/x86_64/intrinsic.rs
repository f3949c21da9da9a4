use core::arch::global_asm;
use core::marker::PhantomData;

use bit_field::BitField;
use x86::bits64::vmx;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::SegmentSelector;
use x86_64::registers::control::{Cr0, Cr3, Cr4};

use super::msr::Msr;
use super::regs::{GeneralRegisters, StateSave};
use super::vmx::vmcs::{exit_reason, VmcsHost16, VmcsHost64, VmcsHostNW, VmcsReadOnly32};
use crate::memory::{HostPhysAddr, HostVirtAddr};
use crate::{HyperError, HyperResult, Intrinsic, MkCraftHal};

extern "C" {
    fn mkcraft_vmrun(gprs: *mut GeneralRegisters, launched: u64) -> u64;
    fn mkcraft_vmexit();
    fn mkcraft_promote(state: *const StateSave) -> !;
}

/// Returned by `mkcraft_vmrun` when `vmlaunch`/`vmresume` falls through.
const VMENTRY_FAILED: u64 = u64::MAX;

/// [`Intrinsic`] backed by the real VMX instructions of the current core.
pub struct VmxIntrinsic<H: MkCraftHal> {
    vmcs_revision_id: u32,
    _phantom: PhantomData<H>,
}

impl<H: MkCraftHal> VmxIntrinsic<H> {
    /// Creates the intrinsic for a core already in VMX root operation.
    pub fn new(vmcs_revision_id: u32) -> Self {
        Self {
            vmcs_revision_id,
            _phantom: PhantomData,
        }
    }

    /// Copies this core's host state into the current VMCS, so that VM exits
    /// land back in `mkcraft_vmexit` on the microkernel's stack.
    fn setup_host_state(&mut self) -> HyperResult {
        self.vmwr(VmcsHost64::IA32_PAT as u32, Msr::IA32_PAT.read())?;
        self.vmwr(VmcsHost64::IA32_EFER as u32, Msr::IA32_EFER.read())?;

        self.vmwr(VmcsHostNW::CR0 as u32, Cr0::read_raw())?;
        self.vmwr(
            VmcsHostNW::CR3 as u32,
            Cr3::read_raw().0.start_address().as_u64(),
        )?;
        self.vmwr(VmcsHostNW::CR4 as u32, Cr4::read_raw())?;

        self.vmwr(VmcsHost16::ES_SELECTOR as u32, x86::segmentation::es().bits() as u64)?;
        self.vmwr(VmcsHost16::CS_SELECTOR as u32, x86::segmentation::cs().bits() as u64)?;
        self.vmwr(VmcsHost16::SS_SELECTOR as u32, x86::segmentation::ss().bits() as u64)?;
        self.vmwr(VmcsHost16::DS_SELECTOR as u32, x86::segmentation::ds().bits() as u64)?;
        self.vmwr(VmcsHost16::FS_SELECTOR as u32, x86::segmentation::fs().bits() as u64)?;
        self.vmwr(VmcsHost16::GS_SELECTOR as u32, x86::segmentation::gs().bits() as u64)?;
        self.vmwr(VmcsHostNW::FS_BASE as u32, Msr::IA32_FS_BASE.read())?;
        self.vmwr(VmcsHostNW::GS_BASE as u32, Msr::IA32_GS_BASE.read())?;

        let tr = unsafe { x86::task::tr() };
        let mut gdtp = DescriptorTablePointer::<u64>::default();
        let mut idtp = DescriptorTablePointer::<u64>::default();
        unsafe {
            dtables::sgdt(&mut gdtp);
            dtables::sidt(&mut idtp);
        }
        self.vmwr(VmcsHost16::TR_SELECTOR as u32, tr.bits() as u64)?;
        self.vmwr(VmcsHostNW::TR_BASE as u32, tr_base(tr, &gdtp))?;
        self.vmwr(VmcsHostNW::GDTR_BASE as u32, gdtp.base as u64)?;
        self.vmwr(VmcsHostNW::IDTR_BASE as u32, idtp.base as u64)?;
        self.vmwr(VmcsHostNW::RIP as u32, mkcraft_vmexit as usize as u64)
    }
}

fn tr_base(tr: SegmentSelector, gdt: &DescriptorTablePointer<u64>) -> u64 {
    let index = tr.index() as usize;
    let table_len = (gdt.limit as usize + 1) / core::mem::size_of::<u64>();
    if index + 1 >= table_len {
        return 0;
    }
    let table = unsafe { core::slice::from_raw_parts(gdt.base, table_len) };
    let entry = table[index];
    if entry.get_bit(47) {
        let base_low = entry.get_bits(16..40) | entry.get_bits(56..64) << 24;
        let base_high = table[index + 1] & 0xffff_ffff;
        base_low | base_high << 32
    } else {
        0
    }
}

impl<H: MkCraftHal> Intrinsic for VmxIntrinsic<H> {
    fn vmcs_revision_id(&self) -> u32 {
        self.vmcs_revision_id
    }

    fn vmld(&mut self, vmcs: HostPhysAddr) -> HyperResult {
        unsafe { vmx::vmptrld(vmcs as u64)? };
        Ok(())
    }

    fn vmcl(&mut self, vmcs: HostPhysAddr) -> HyperResult {
        unsafe { vmx::vmclear(vmcs as u64)? };
        Ok(())
    }

    fn vmrd(&self, field: u32) -> HyperResult<u64> {
        Ok(unsafe { vmx::vmread(field)? })
    }

    fn vmwr(&mut self, field: u32, value: u64) -> HyperResult {
        unsafe { vmx::vmwrite(field, value)? };
        Ok(())
    }

    fn vmrun(&mut self, gprs: &mut GeneralRegisters, launched: bool) -> HyperResult<u64> {
        if !launched {
            self.setup_host_state()?;
        }
        let reason = unsafe { mkcraft_vmrun(gprs, launched as u64) };
        if reason == VMENTRY_FAILED {
            let err = self.vmrd(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32)?;
            error!(
                "[MK] {} failed with vm-instruction error {}",
                if launched { "vmresume" } else { "vmlaunch" },
                err
            );
            return Err(HyperError::BadState);
        }
        trace!("[MK] vmexit: {}", exit_reason::name(reason));
        Ok(reason)
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) }
    }

    fn set_rpt(&mut self, rpt: HostPhysAddr) {
        unsafe { x86::controlregs::cr3_write(rpt as u64) }
    }

    fn invlpg(&mut self, virt: HostVirtAddr) {
        unsafe { x86::tlb::flush(virt) }
    }

    fn promote(&mut self, state: &StateSave) {
        unsafe { mkcraft_promote(state) }
    }

    fn halt(&mut self) {
        loop {
            unsafe { x86::halt() }
        }
    }
}

// mkcraft_vmrun(gprs: *mut GeneralRegisters, launched: u64) -> u64
//
// The host RSP written to the VMCS points at the saved `gprs` pointer, so the
// exit path can find the save area. Field offsets follow `GeneralRegisters`.
global_asm!(
    ".global mkcraft_vmrun",
    "mkcraft_vmrun:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov rdx, {host_rsp}",
    "vmwrite rdx, rsp",
    "test rsi, rsi",
    "mov rax, [rdi + 0x00]",
    "mov rbx, [rdi + 0x08]",
    "mov rcx, [rdi + 0x10]",
    "mov rdx, [rdi + 0x18]",
    "mov rbp, [rdi + 0x20]",
    "mov rsi, [rdi + 0x28]",
    "mov r8,  [rdi + 0x38]",
    "mov r9,  [rdi + 0x40]",
    "mov r10, [rdi + 0x48]",
    "mov r11, [rdi + 0x50]",
    "mov r12, [rdi + 0x58]",
    "mov r13, [rdi + 0x60]",
    "mov r14, [rdi + 0x68]",
    "mov r15, [rdi + 0x70]",
    "mov rdi, [rdi + 0x30]",
    "jnz 2f",
    "vmlaunch",
    "jmp 3f",
    "2:",
    "vmresume",
    "3:",
    "pop rdi",
    "mov rax, {failed}",
    "jmp 4f",
    ".global mkcraft_vmexit",
    "mkcraft_vmexit:",
    "push rdi",
    "mov rdi, [rsp + 8]",
    "mov [rdi + 0x00], rax",
    "mov [rdi + 0x08], rbx",
    "mov [rdi + 0x10], rcx",
    "mov [rdi + 0x18], rdx",
    "mov [rdi + 0x20], rbp",
    "mov [rdi + 0x28], rsi",
    "mov [rdi + 0x38], r8",
    "mov [rdi + 0x40], r9",
    "mov [rdi + 0x48], r10",
    "mov [rdi + 0x50], r11",
    "mov [rdi + 0x58], r12",
    "mov [rdi + 0x60], r13",
    "mov [rdi + 0x68], r14",
    "mov [rdi + 0x70], r15",
    "pop rax",
    "mov [rdi + 0x30], rax",
    "pop rdi",
    "mov rcx, {exit_reason}",
    "vmread rax, rcx",
    "and rax, 0xffff",
    "4:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
    host_rsp = const VmcsHostNW::RSP as u32,
    failed = const VMENTRY_FAILED,
    exit_reason = const VmcsReadOnly32::EXIT_REASON as u32,
);

// mkcraft_promote(state: *const StateSave) -> !
//
// Leaves VMX operation and resumes the loader's saved context on this core.
// Offsets follow `StateSave`: gprs occupy 0x00..0x78, then rip 0x78, rsp 0x80,
// rflags 0x88, cr0 0x90, cr3 0x98, cr4 0xa0, efer 0xa8.
global_asm!(
    ".global mkcraft_promote",
    "mkcraft_promote:",
    "vmxoff",
    "mov rax, [rdi + 0x90]",
    "mov cr0, rax",
    "mov rax, [rdi + 0xa0]",
    "mov cr4, rax",
    "mov rax, [rdi + 0x98]",
    "mov cr3, rax",
    "mov rax, [rdi + 0xa8]",
    "mov rdx, rax",
    "shr rdx, 32",
    "mov ecx, {efer}",
    "wrmsr",
    "mov rsp, [rdi + 0x80]",
    "push qword ptr [rdi + 0x88]",
    "popfq",
    "push qword ptr [rdi + 0x78]",
    "mov rax, [rdi + 0x00]",
    "mov rbx, [rdi + 0x08]",
    "mov rcx, [rdi + 0x10]",
    "mov rdx, [rdi + 0x18]",
    "mov rbp, [rdi + 0x20]",
    "mov rsi, [rdi + 0x28]",
    "mov r8,  [rdi + 0x38]",
    "mov r9,  [rdi + 0x40]",
    "mov r10, [rdi + 0x48]",
    "mov r11, [rdi + 0x50]",
    "mov r12, [rdi + 0x58]",
    "mov r13, [rdi + 0x60]",
    "mov r14, [rdi + 0x68]",
    "mov r15, [rdi + 0x70]",
    "mov rdi, [rdi + 0x30]",
    "ret",
    efer = const Msr::IA32_EFER as u32,
);

#[cfg(test)]
mod tests {
    use core::mem::size_of;

    use memoffset::offset_of;

    use super::*;

    #[test]
    fn trampoline_offsets_match_layouts() {
        assert_eq!(size_of::<GeneralRegisters>(), 0x78);
        assert_eq!(offset_of!(GeneralRegisters, rdi), 0x30);
        assert_eq!(offset_of!(GeneralRegisters, r15), 0x70);
        assert_eq!(offset_of!(StateSave, rip), 0x78);
        assert_eq!(offset_of!(StateSave, rsp), 0x80);
        assert_eq!(offset_of!(StateSave, rflags), 0x88);
        assert_eq!(offset_of!(StateSave, cr0), 0x90);
        assert_eq!(offset_of!(StateSave, cr3), 0x98);
        assert_eq!(offset_of!(StateSave, cr4), 0xa0);
        assert_eq!(offset_of!(StateSave, efer), 0xa8);
        assert_eq!(size_of::<StateSave>(), 0xb0);
    }
}
