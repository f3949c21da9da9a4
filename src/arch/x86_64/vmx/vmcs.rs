//! VMCS field encodings. (SDM Vol. 3D, Appendix B)

/// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl16 {
    /// Virtual-processor identifier (VPID).
    VPID = 0x0,
}

/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl32 {
    /// Pin-based VM-execution controls.
    PINBASED_EXEC_CONTROLS = 0x4000,
    /// Primary processor-based VM-execution controls.
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    /// Exception bitmap.
    EXCEPTION_BITMAP = 0x4004,
    /// VM-exit controls.
    VMEXIT_CONTROLS = 0x400c,
    /// VM-entry controls.
    VMENTRY_CONTROLS = 0x4012,
    /// VM-entry interruption-information field.
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    /// Secondary processor-based VM-execution controls.
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401e,
}

/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest16 {
    /// Guest CS selector.
    CS_SELECTOR = 0x802,
}

/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest64 {
    /// VMCS link pointer.
    LINK_PTR = 0x2800,
    /// Guest IA32_EFER.
    IA32_EFER = 0x2806,
}

/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuestNW {
    /// Guest CR0.
    CR0 = 0x6800,
    /// Guest CR3.
    CR3 = 0x6802,
    /// Guest CR4.
    CR4 = 0x6804,
    /// Guest RSP.
    RSP = 0x681c,
    /// Guest RIP.
    RIP = 0x681e,
    /// Guest RFLAGS.
    RFLAGS = 0x6820,
}

/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost16 {
    /// Host ES selector.
    ES_SELECTOR = 0xc00,
    /// Host CS selector.
    CS_SELECTOR = 0xc02,
    /// Host SS selector.
    SS_SELECTOR = 0xc04,
    /// Host DS selector.
    DS_SELECTOR = 0xc06,
    /// Host FS selector.
    FS_SELECTOR = 0xc08,
    /// Host GS selector.
    GS_SELECTOR = 0xc0a,
    /// Host TR selector.
    TR_SELECTOR = 0xc0c,
}

/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost64 {
    /// Host IA32_PAT.
    IA32_PAT = 0x2c00,
    /// Host IA32_EFER.
    IA32_EFER = 0x2c02,
}

/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsHostNW {
    /// Host CR0.
    CR0 = 0x6c00,
    /// Host CR3.
    CR3 = 0x6c02,
    /// Host CR4.
    CR4 = 0x6c04,
    /// Host FS base.
    FS_BASE = 0x6c06,
    /// Host GS base.
    GS_BASE = 0x6c08,
    /// Host TR base.
    TR_BASE = 0x6c0a,
    /// Host GDTR base.
    GDTR_BASE = 0x6c0c,
    /// Host IDTR base.
    IDTR_BASE = 0x6c0e,
    /// Host RSP.
    RSP = 0x6c14,
    /// Host RIP.
    RIP = 0x6c16,
}

/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnly32 {
    /// VM-instruction error.
    VM_INSTRUCTION_ERROR = 0x4400,
    /// Exit reason.
    EXIT_REASON = 0x4402,
    /// VM-exit instruction length.
    VMEXIT_INSTRUCTION_LEN = 0x440c,
}

/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnlyNW {
    /// Exit qualification.
    EXIT_QUALIFICATION = 0x6400,
    /// Guest-linear address.
    GUEST_LINEAR_ADDR = 0x640a,
}

/// Basic exit reasons. (SDM Vol. 3D, Appendix C)
pub mod exit_reason {
    pub const EXCEPTION_NMI: u64 = 0;
    pub const EXTERNAL_INTERRUPT: u64 = 1;
    pub const TRIPLE_FAULT: u64 = 2;
    pub const INIT: u64 = 3;
    pub const SIPI: u64 = 4;
    pub const INTERRUPT_WINDOW: u64 = 7;
    pub const NMI_WINDOW: u64 = 8;
    pub const CPUID: u64 = 10;
    pub const HLT: u64 = 12;
    pub const VMCALL: u64 = 18;
    pub const CR_ACCESS: u64 = 28;
    pub const IO_INSTRUCTION: u64 = 30;
    pub const MSR_READ: u64 = 31;
    pub const MSR_WRITE: u64 = 32;
    pub const EPT_VIOLATION: u64 = 48;
    pub const PREEMPTION_TIMER: u64 = 52;
    pub const XSETBV: u64 = 55;

    /// Short name of a basic exit reason, for logs.
    pub fn name(reason: u64) -> &'static str {
        match reason & 0xffff {
            EXCEPTION_NMI => "exception or nmi",
            EXTERNAL_INTERRUPT => "external interrupt",
            TRIPLE_FAULT => "triple fault",
            INIT => "init",
            SIPI => "sipi",
            INTERRUPT_WINDOW => "interrupt window",
            NMI_WINDOW => "nmi window",
            CPUID => "cpuid",
            HLT => "hlt",
            VMCALL => "vmcall",
            CR_ACCESS => "cr access",
            IO_INSTRUCTION => "io instruction",
            MSR_READ => "rdmsr",
            MSR_WRITE => "wrmsr",
            EPT_VIOLATION => "ept violation",
            PREEMPTION_TIMER => "preemption timer",
            XSETBV => "xsetbv",
            _ => "unknown",
        }
    }
}

/// Where a `bf_reg_t` register lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegLocation {
    /// Index into the general-purpose register save area.
    Gpr(usize),
    /// A VMCS field encoding.
    Vmcs(u32),
}

/// Maps an ABI register number (`bf_reg_t`) to its storage.
///
/// Zero is `bf_reg_t_unsupported`. Registers the microkernel does not expose
/// return `None`.
pub fn reg_location(reg: u64) -> Option<RegLocation> {
    let loc = match reg {
        1..=15 => RegLocation::Gpr((reg - 1) as usize),
        23 => RegLocation::Vmcs(VmcsControl16::VPID as u32),
        27 => RegLocation::Vmcs(VmcsGuest16::CS_SELECTOR as u32),
        63 => RegLocation::Vmcs(VmcsGuest64::LINK_PTR as u32),
        66 => RegLocation::Vmcs(VmcsGuest64::IA32_EFER as u32),
        74 => RegLocation::Vmcs(VmcsControl32::PINBASED_EXEC_CONTROLS as u32),
        75 => RegLocation::Vmcs(VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS as u32),
        76 => RegLocation::Vmcs(VmcsControl32::EXCEPTION_BITMAP as u32),
        80 => RegLocation::Vmcs(VmcsControl32::VMEXIT_CONTROLS as u32),
        83 => RegLocation::Vmcs(VmcsControl32::VMENTRY_CONTROLS as u32),
        85 => RegLocation::Vmcs(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32),
        89 => RegLocation::Vmcs(VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS as u32),
        92 => RegLocation::Vmcs(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32),
        93 => RegLocation::Vmcs(VmcsReadOnly32::EXIT_REASON as u32),
        98 => RegLocation::Vmcs(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN as u32),
        131 => RegLocation::Vmcs(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32),
        136 => RegLocation::Vmcs(VmcsReadOnlyNW::GUEST_LINEAR_ADDR as u32),
        137 => RegLocation::Vmcs(VmcsGuestNW::CR0 as u32),
        138 => RegLocation::Vmcs(VmcsGuestNW::CR3 as u32),
        139 => RegLocation::Vmcs(VmcsGuestNW::CR4 as u32),
        151 => RegLocation::Vmcs(VmcsGuestNW::RSP as u32),
        152 => RegLocation::Vmcs(VmcsGuestNW::RIP as u32),
        153 => RegLocation::Vmcs(VmcsGuestNW::RFLAGS as u32),
        _ => return None,
    };
    Some(loc)
}

/// Builds a VM-entry interruption-information value. (SDM Vol. 3C, Section 24.8.3)
pub fn interruption_info(vector: u8, int_type: u8, has_error_code: bool) -> u64 {
    let mut info = vector as u64 | ((int_type as u64 & 0x7) << 8);
    if has_error_code {
        info |= 1 << 11;
    }
    info | (1 << 31)
}

/// Interruption type of a non-maskable interrupt.
pub const INTERRUPTION_TYPE_NMI: u8 = 2;
