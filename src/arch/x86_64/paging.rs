use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::memory::{HostPhysAddr, MemFlags};
use crate::paging::{PageTableEntry, PagingMetaData};

register_bitfields![u64,
    X64PTE [
        PRESENT OFFSET(0) NUMBITS(1) [],
        WRITABLE OFFSET(1) NUMBITS(1) [],
        USER OFFSET(2) NUMBITS(1) [],
        /// Block mapping at the PDPT or PD level.
        HUGE OFFSET(7) NUMBITS(1) [],
        /// Software bit: the frame belongs to the table.
        AUTO_RELEASE OFFSET(9) NUMBITS(1) [],
        /// Software bit: copied from another root table.
        ALIAS OFFSET(10) NUMBITS(1) [],
        /// Software bit: slot may never be mapped.
        RESERVED OFFSET(11) NUMBITS(1) [],
        PHYS OFFSET(12) NUMBITS(40) [],
        NO_EXECUTE OFFSET(63) NUMBITS(1) []
    ]
];

type PteReg = LocalRegisterCopy<u64, X64PTE::Register>;

/// 4-level x86_64 paging. (SDM Vol. 3A, Section 4.5)
pub struct X64PagingMetaData;

impl PagingMetaData for X64PagingMetaData {
    const LEVELS: usize = 4;
    const PA_MAX_BITS: usize = 52;
    const VA_MAX_BITS: usize = 48;
}

/// An x86_64 page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct X64Entry(u64);

impl X64Entry {
    fn reg(&self) -> PteReg {
        PteReg::new(self.0)
    }

    fn update(&mut self, f: impl FnOnce(&mut PteReg)) {
        let mut reg = self.reg();
        f(&mut reg);
        self.0 = reg.get();
    }
}

impl PageTableEntry for X64Entry {
    fn empty() -> Self {
        Self(0)
    }

    fn bits(&self) -> u64 {
        self.0
    }

    fn is_present(&self) -> bool {
        self.reg().is_set(X64PTE::PRESENT)
    }

    fn is_reserved(&self) -> bool {
        !self.is_present() && self.reg().is_set(X64PTE::RESERVED)
    }

    fn set_reserved(&mut self) {
        self.update(|r| r.modify(X64PTE::PRESENT::CLEAR + X64PTE::RESERVED::SET));
    }

    fn is_block(&self) -> bool {
        self.reg().is_set(X64PTE::HUGE)
    }

    fn configure_as_table(&mut self, table: HostPhysAddr) {
        // Leaves carry the real permissions.
        self.0 = (X64PTE::PRESENT::SET
            + X64PTE::WRITABLE::SET
            + X64PTE::USER::SET
            + X64PTE::PHYS.val(table as u64 >> 12))
        .value;
    }

    fn configure_as_block(&mut self, paddr: HostPhysAddr, flags: MemFlags, huge: bool) {
        let mut value = X64PTE::PRESENT::SET + X64PTE::PHYS.val(paddr as u64 >> 12);
        if flags.contains(MemFlags::WRITE) {
            value += X64PTE::WRITABLE::SET;
        }
        if flags.contains(MemFlags::USER) {
            value += X64PTE::USER::SET;
        }
        if !flags.contains(MemFlags::EXECUTE) {
            value += X64PTE::NO_EXECUTE::SET;
        }
        if huge {
            value += X64PTE::HUGE::SET;
        }
        self.0 = value.value;
    }

    fn paddr(&self) -> HostPhysAddr {
        (self.reg().read(X64PTE::PHYS) << 12) as HostPhysAddr
    }

    fn flags(&self) -> MemFlags {
        let reg = self.reg();
        let mut flags = MemFlags::empty();
        if !reg.is_set(X64PTE::PRESENT) {
            return flags;
        }
        flags |= MemFlags::READ;
        if reg.is_set(X64PTE::WRITABLE) {
            flags |= MemFlags::WRITE;
        }
        if reg.is_set(X64PTE::USER) {
            flags |= MemFlags::USER;
        }
        if !reg.is_set(X64PTE::NO_EXECUTE) {
            flags |= MemFlags::EXECUTE;
        }
        flags
    }

    fn auto_release(&self) -> bool {
        self.reg().is_set(X64PTE::AUTO_RELEASE)
    }

    fn set_auto_release(&mut self, release: bool) {
        let field = if release {
            X64PTE::AUTO_RELEASE::SET
        } else {
            X64PTE::AUTO_RELEASE::CLEAR
        };
        self.update(|r| r.modify(field));
    }

    fn is_alias(&self) -> bool {
        self.reg().is_set(X64PTE::ALIAS)
    }

    fn set_alias(&mut self) {
        self.update(|r| r.modify(X64PTE::ALIAS::SET));
    }
}

impl core::fmt::Debug for X64Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("X64Entry")
            .field("raw", &self.0)
            .field("paddr", &self.paddr())
            .field("flags", &self.flags())
            .field("huge", &self.is_block())
            .finish()
    }
}
