//! The extension side of the syscall ABI.

use super::*;
use crate::ExtTlsBlock;

/// Typed syscalls for extension code, made through a [`SyscallPort`] with
/// the handle the extension opened.
pub struct BfSyscall<'a> {
    port: &'a mut dyn SyscallPort,
    handle: u64,
}

impl<'a> BfSyscall<'a> {
    /// Opens a handle for ABI `version`.
    pub fn initialize(port: &'a mut dyn SyscallPort, version: u64) -> Result<Self, BfStatus> {
        let mut regs = [version, 0, 0, 0, 0, 0];
        match port.syscall(BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, &mut regs) {
            BF_STATUS_SUCCESS => Ok(Self {
                port,
                handle: regs[0],
            }),
            status => Err(status),
        }
    }

    /// Wraps a handle opened earlier.
    pub fn with_handle(port: &'a mut dyn SyscallPort, handle: u64) -> Self {
        Self { port, handle }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Closes the handle.
    pub fn release(self) -> BfStatus {
        let mut regs = [self.handle, 0, 0, 0, 0, 0];
        self.port
            .syscall(BF_HANDLE_OP_VAL | BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL, &mut regs)
    }

    fn call(&mut self, syscall: u64, args: &[u64]) -> Result<[u64; 6], BfStatus> {
        let mut regs = [self.handle, 0, 0, 0, 0, 0];
        regs[1..=args.len()].copy_from_slice(args);
        match self.port.syscall(syscall, &mut regs) {
            BF_STATUS_SUCCESS => Ok(regs),
            status => Err(status),
        }
    }

    fn call_id(&mut self, syscall: u64, args: &[u64]) -> Result<u16, BfStatus> {
        self.call(syscall, args).map(|regs| regs[0] as u16)
    }

    fn call_unit(&mut self, syscall: u64, args: &[u64]) -> Result<(), BfStatus> {
        self.call(syscall, args).map(|_| ())
    }

    /// The TLS block of the calling core.
    pub fn tls(&mut self) -> &mut ExtTlsBlock {
        self.port.tls_block()
    }

    pub fn tls_vmid(&mut self) -> u16 {
        self.tls().active_vmid
    }

    pub fn tls_vpid(&mut self) -> u16 {
        self.tls().active_vpid
    }

    pub fn tls_vsid(&mut self) -> u16 {
        self.tls().active_vsid
    }

    pub fn tls_ppid(&mut self) -> u16 {
        self.tls().active_ppid
    }

    pub fn tls_online_pps(&mut self) -> u16 {
        self.tls().online_pps
    }

    pub fn control_exit(&mut self) -> Result<(), BfStatus> {
        self.call_unit(BF_CONTROL_OP_VAL | BF_CONTROL_OP_EXIT_IDX_VAL, &[])
    }

    pub fn control_wait(&mut self) -> Result<(), BfStatus> {
        self.call_unit(BF_CONTROL_OP_VAL | BF_CONTROL_OP_WAIT_IDX_VAL, &[])
    }

    pub fn debug_out(&mut self, val1: u64, val2: u64) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_OUT_IDX_VAL, &[val1, val2])
    }

    pub fn dump_vm(&mut self, vmid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_DUMP_VM_IDX_VAL, &[vmid as u64])
    }

    pub fn dump_vp(&mut self, vpid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_DUMP_VP_IDX_VAL, &[vpid as u64])
    }

    pub fn dump_vs(&mut self, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_DUMP_VS_IDX_VAL, &[vsid as u64])
    }

    pub fn dump_vmexit_log(&mut self, ppid: u16) -> Result<(), BfStatus> {
        self.call_unit(
            BF_DEBUG_OP_VAL | BF_DEBUG_OP_DUMP_VMEXIT_LOG_IDX_VAL,
            &[ppid as u64],
        )
    }

    pub fn write_c(&mut self, c: u8) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_WRITE_C_IDX_VAL, &[c as u64])
    }

    /// Logs the NUL-terminated string at `addr` in the extension's address
    /// space.
    pub fn write_str(&mut self, addr: u64) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_WRITE_STR_IDX_VAL, &[addr])
    }

    pub fn dump_ext(&mut self, extid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_DUMP_EXT_IDX_VAL, &[extid as u64])
    }

    pub fn dump_page_pool(&mut self) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_DUMP_PAGE_POOL_IDX_VAL, &[])
    }

    pub fn dump_huge_pool(&mut self) -> Result<(), BfStatus> {
        self.call_unit(BF_DEBUG_OP_VAL | BF_DEBUG_OP_DUMP_HUGE_POOL_IDX_VAL, &[])
    }

    pub fn register_bootstrap(&mut self, ip: u64) -> Result<(), BfStatus> {
        self.call_unit(
            BF_CALLBACK_OP_VAL | BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL,
            &[ip],
        )
    }

    pub fn register_vmexit(&mut self, ip: u64) -> Result<(), BfStatus> {
        self.call_unit(BF_CALLBACK_OP_VAL | BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL, &[ip])
    }

    pub fn register_fail(&mut self, ip: u64) -> Result<(), BfStatus> {
        self.call_unit(BF_CALLBACK_OP_VAL | BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL, &[ip])
    }

    pub fn create_vm(&mut self) -> Result<u16, BfStatus> {
        self.call_id(BF_VM_OP_VAL | BF_VM_OP_CREATE_VM_IDX_VAL, &[])
    }

    pub fn destroy_vm(&mut self, vmid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_VM_OP_VAL | BF_VM_OP_DESTROY_VM_IDX_VAL, &[vmid as u64])
    }

    /// Maps guest physical page `phys` of `vmid` and returns its address.
    pub fn map_direct(&mut self, vmid: u16, phys: u64) -> Result<u64, BfStatus> {
        self.call(BF_VM_OP_VAL | BF_VM_OP_MAP_DIRECT_IDX_VAL, &[vmid as u64, phys])
            .map(|regs| regs[0])
    }

    pub fn unmap_direct(&mut self, vmid: u16, virt: u64) -> Result<(), BfStatus> {
        self.call_unit(
            BF_VM_OP_VAL | BF_VM_OP_UNMAP_DIRECT_IDX_VAL,
            &[vmid as u64, virt],
        )
    }

    pub fn unmap_direct_broadcast(&mut self, vmid: u16, virt: u64) -> Result<(), BfStatus> {
        self.call_unit(
            BF_VM_OP_VAL | BF_VM_OP_UNMAP_DIRECT_BROADCAST_IDX_VAL,
            &[vmid as u64, virt],
        )
    }

    pub fn create_vp(&mut self, vmid: u16) -> Result<u16, BfStatus> {
        self.call_id(BF_VP_OP_VAL | BF_VP_OP_CREATE_VP_IDX_VAL, &[vmid as u64])
    }

    pub fn destroy_vp(&mut self, vpid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_VP_OP_VAL | BF_VP_OP_DESTROY_VP_IDX_VAL, &[vpid as u64])
    }

    pub fn create_vs(&mut self, vpid: u16, ppid: u16) -> Result<u16, BfStatus> {
        self.call_id(
            BF_VS_OP_VAL | BF_VS_OP_CREATE_VS_IDX_VAL,
            &[vpid as u64, ppid as u64],
        )
    }

    pub fn destroy_vs(&mut self, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_VS_OP_VAL | BF_VS_OP_DESTROY_VS_IDX_VAL, &[vsid as u64])
    }

    pub fn init_as_root(&mut self, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_VS_OP_VAL | BF_VS_OP_INIT_AS_ROOT_IDX_VAL, &[vsid as u64])
    }

    pub fn read(&mut self, vsid: u16, reg: u64) -> Result<u64, BfStatus> {
        self.call(BF_VS_OP_VAL | BF_VS_OP_READ_IDX_VAL, &[vsid as u64, reg])
            .map(|regs| regs[0])
    }

    pub fn write(&mut self, vsid: u16, reg: u64, val: u64) -> Result<(), BfStatus> {
        self.call_unit(BF_VS_OP_VAL | BF_VS_OP_WRITE_IDX_VAL, &[vsid as u64, reg, val])
    }

    pub fn run(&mut self, vmid: u16, vpid: u16, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(
            BF_VS_OP_VAL | BF_VS_OP_RUN_IDX_VAL,
            &[vmid as u64, vpid as u64, vsid as u64],
        )
    }

    pub fn run_current(&mut self) -> Result<(), BfStatus> {
        self.call_unit(BF_VS_OP_VAL | BF_VS_OP_RUN_CURRENT_IDX_VAL, &[])
    }

    pub fn advance_ip_and_run(&mut self, vmid: u16, vpid: u16, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(
            BF_VS_OP_VAL | BF_VS_OP_ADVANCE_IP_AND_RUN_IDX_VAL,
            &[vmid as u64, vpid as u64, vsid as u64],
        )
    }

    pub fn advance_ip_and_run_current(&mut self) -> Result<(), BfStatus> {
        self.call_unit(BF_VS_OP_VAL | BF_VS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL, &[])
    }

    pub fn promote(&mut self, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_VS_OP_VAL | BF_VS_OP_PROMOTE_IDX_VAL, &[vsid as u64])
    }

    pub fn clear(&mut self, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(BF_VS_OP_VAL | BF_VS_OP_CLEAR_IDX_VAL, &[vsid as u64])
    }

    pub fn migrate(&mut self, ppid: u16, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(
            BF_VS_OP_VAL | BF_VS_OP_MIGRATE_IDX_VAL,
            &[ppid as u64, vsid as u64],
        )
    }

    pub fn set_active(&mut self, vmid: u16, vpid: u16, vsid: u16) -> Result<(), BfStatus> {
        self.call_unit(
            BF_VS_OP_VAL | BF_VS_OP_SET_ACTIVE_IDX_VAL,
            &[vmid as u64, vpid as u64, vsid as u64],
        )
    }

    pub fn advance_ip_and_set_active(
        &mut self,
        vmid: u16,
        vpid: u16,
        vsid: u16,
    ) -> Result<(), BfStatus> {
        self.call_unit(
            BF_VS_OP_VAL | BF_VS_OP_ADVANCE_IP_AND_SET_ACTIVE_IDX_VAL,
            &[vmid as u64, vpid as u64, vsid as u64],
        )
    }

    pub fn rdmsr(&mut self, msr: u32) -> Result<u64, BfStatus> {
        self.call(BF_INTRINSIC_OP_VAL | BF_INTRINSIC_OP_RDMSR_IDX_VAL, &[msr as u64])
            .map(|regs| regs[0])
    }

    pub fn wrmsr(&mut self, msr: u32, val: u64) -> Result<(), BfStatus> {
        self.call_unit(
            BF_INTRINSIC_OP_VAL | BF_INTRINSIC_OP_WRMSR_IDX_VAL,
            &[msr as u64, val],
        )
    }

    /// Allocates a zeroed page. Returns `(virt, phys)`.
    pub fn alloc_page(&mut self) -> Result<(u64, u64), BfStatus> {
        self.call(BF_MEM_OP_VAL | BF_MEM_OP_ALLOC_PAGE_IDX_VAL, &[])
            .map(|regs| (regs[0], regs[1]))
    }

    pub fn free_page(&mut self, virt: u64) -> Result<(), BfStatus> {
        self.call_unit(BF_MEM_OP_VAL | BF_MEM_OP_FREE_PAGE_IDX_VAL, &[virt])
    }

    /// Allocates `size` physically contiguous bytes. Returns `(virt, phys)`.
    pub fn alloc_huge(&mut self, size: u64) -> Result<(u64, u64), BfStatus> {
        self.call(BF_MEM_OP_VAL | BF_MEM_OP_ALLOC_HUGE_IDX_VAL, &[size])
            .map(|regs| (regs[0], regs[1]))
    }

    pub fn free_huge(&mut self, virt: u64) -> Result<(), BfStatus> {
        self.call_unit(BF_MEM_OP_VAL | BF_MEM_OP_FREE_HUGE_IDX_VAL, &[virt])
    }
}
