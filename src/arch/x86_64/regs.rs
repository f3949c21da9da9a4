/// General-purpose registers of a guest that are not held in the VMCS.
///
/// The layout matches the save area used by the VM entry trampoline, so
/// fields must not be reordered.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    /// Number of registers in the save area.
    pub const COUNT: usize = 15;

    /// Returns the register at `index` in save-area order (`rax` is 0).
    pub fn get(&self, index: usize) -> Option<u64> {
        self.as_array().get(index).copied()
    }

    /// Sets the register at `index` in save-area order (`rax` is 0).
    pub fn set(&mut self, index: usize, value: u64) -> Option<()> {
        let mut regs = self.as_array();
        *regs.get_mut(index)? = value;
        *self = Self::from_array(regs);
        Some(())
    }

    /// Copies the registers out in save-area order.
    pub fn as_array(&self) -> [u64; Self::COUNT] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rbp, self.rsi, self.rdi, self.r8,
            self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ]
    }

    /// Builds the registers from an array in save-area order.
    pub fn from_array(regs: [u64; Self::COUNT]) -> Self {
        let [rax, rbx, rcx, rdx, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15] = regs;
        Self {
            rax,
            rbx,
            rcx,
            rdx,
            rbp,
            rsi,
            rdi,
            r8,
            r9,
            r10,
            r11,
            r12,
            r13,
            r14,
            r15,
        }
    }
}

/// Architectural state of a core captured by the loader before the
/// microkernel took over, and restored on promotion.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StateSave {
    pub gprs: GeneralRegisters,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}
