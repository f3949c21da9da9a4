use bit_field::BitField;
use bitflags::bitflags;
use x86::msr::{rdmsr, wrmsr};

/// X86 model-specific registers the microkernel touches itself. (SDM Vol. 4)
///
/// Extensions reach every other MSR through `intrinsic_op_rdmsr` and
/// `intrinsic_op_wrmsr`.
#[repr(u32)]
#[derive(Debug, Copy, Clone)]
#[allow(non_camel_case_types, dead_code)]
pub enum Msr {
    IA32_FEATURE_CONTROL = 0x3a,
    IA32_PAT = 0x277,

    IA32_VMX_BASIC = 0x480,
    IA32_VMX_CR0_FIXED0 = 0x486,
    IA32_VMX_CR0_FIXED1 = 0x487,
    IA32_VMX_CR4_FIXED0 = 0x488,
    IA32_VMX_CR4_FIXED1 = 0x489,

    IA32_EFER = 0xc000_0080,
    IA32_FS_BASE = 0xc000_0100,
    IA32_GS_BASE = 0xc000_0101,
}

impl Msr {
    /// Read 64 bits msr register.
    #[inline(always)]
    pub fn read(self) -> u64 {
        unsafe { rdmsr(self as _) }
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write(self, value: u64) {
        wrmsr(self as _, value)
    }
}

pub(super) trait MsrReadWrite {
    const MSR: Msr;

    fn read_raw() -> u64 {
        Self::MSR.read()
    }

    unsafe fn write_raw(flags: u64) {
        Self::MSR.write(flags);
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. when clear,
       /// VMXON causes a #GP.
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
   }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 23.7)
pub struct FeatureControl;

impl MsrReadWrite for FeatureControl {
    const MSR: Msr = Msr::IA32_FEATURE_CONTROL;
}

impl FeatureControl {
    /// Read the current IA32_FEATURE_CONTROL flags.
    pub fn read() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Self::read_raw())
    }

    /// Write IA32_FEATURE_CONTROL flags, preserving reserved values.
    pub fn write(flags: FeatureControlFlags) {
        let old_value = Self::read_raw();
        let reserved = old_value & !(FeatureControlFlags::all().bits());
        let new_value = reserved | flags.bits();
        unsafe { Self::write_raw(new_value) };
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of the INS and OUTS instructions.
    pub io_exit_info: bool,
    /// If any VMX controls that default to 1 may be cleared to 0.
    pub vmx_flex_controls: bool,
}

impl MsrReadWrite for VmxBasic {
    const MSR: Msr = Msr::IA32_VMX_BASIC;
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    /// Read the current IA32_VMX_BASIC flags.
    pub fn read() -> Self {
        Self::decode(Self::read_raw())
    }

    /// Decodes a raw IA32_VMX_BASIC value.
    pub fn decode(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }
}

/// Returns true if a control register value satisfies the fixed-bit MSR pair
/// for VMX operation. (SDM Vol. 3D, Appendix A.7, A.8)
pub fn cr_is_valid(value: u64, fixed0: u64, fixed1: u64) -> bool {
    (value & fixed0) == fixed0 && (value & !fixed1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmx_basic_fields_decode() {
        let raw: u64 = 0x12 | (0x1000 << 32) | (6 << 50) | (1 << 54) | (1 << 55);
        let basic = VmxBasic::decode(raw);
        assert_eq!(basic.revision_id, 0x12);
        assert_eq!(basic.region_size, 0x1000);
        assert!(!basic.is_32bit_address);
        assert_eq!(basic.mem_type, VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK);
        assert!(basic.io_exit_info);
        assert!(basic.vmx_flex_controls);
    }

    #[test]
    fn cr_fixed_bits() {
        let fixed0 = 0b0001;
        let fixed1 = 0b0111;
        assert!(cr_is_valid(0b0011, fixed0, fixed1));
        assert!(!cr_is_valid(0b0010, fixed0, fixed1));
        assert!(!cr_is_valid(0b1001, fixed0, fixed1));
    }
}
