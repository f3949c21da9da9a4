//! The syscall dispatcher.
//!
//! Extensions request work by loading a syscall number and up to six input
//! registers and trapping into the microkernel. Every request is checked in
//! the same order: signature, then handle, then capability. Only then does
//! it reach the pools.

mod callback_op;
mod client;
mod constants;
mod control_op;
mod debug_op;
mod handle_op;
mod helpers;
mod intrinsic_op;
mod mem_op;
mod vm_op;
mod vp_op;
mod vs_op;

pub use client::BfSyscall;
pub use constants::*;

use crate::ext::ExtTlsBlock;
use crate::{Extension, HyperError, HyperResult, Intrinsic, MkCraftHal, Microkernel};
use crate::{PendingAction, Tls};

/// The path from extension code back into the microkernel.
pub trait SyscallPort {
    /// Makes syscall `syscall` with input registers `regs`. Outputs are
    /// written back into `regs`.
    fn syscall(&mut self, syscall: u64, regs: &mut [u64; 6]) -> BfStatus;

    /// The TLS block of the calling core.
    fn tls_block(&mut self) -> &mut ExtTlsBlock;
}

/// Translates an internal error to the status an extension sees.
pub fn status_of(err: HyperError) -> BfStatus {
    match err {
        HyperError::InvalidInput(n) => invalid_input_reg(n),
        HyperError::InvalidHandle => BF_STATUS_FAILURE_INVALID_HANDLE,
        HyperError::NotSupported => BF_STATUS_FAILURE_UNSUPPORTED,
        HyperError::PermissionDenied => BF_STATUS_INVALID_PERM_DENIED,
        _ => BF_STATUS_FAILURE_UNKNOWN,
    }
}

fn unknown_syscall(tls: &Tls) -> HyperResult {
    error!("[MK] unknown syscall {:#018x}", tls.ext_syscall);
    Err(HyperError::NotFound)
}

/// Whether ops of `family` may only be made by the VMExit extension.
fn needs_vmexit_capability(family: u64) -> bool {
    matches!(
        family,
        BF_VM_OP_NOSIG_VAL | BF_VP_OP_NOSIG_VAL | BF_VS_OP_NOSIG_VAL | BF_INTRINSIC_OP_NOSIG_VAL
    )
}

/// Executes the syscall held in `tls` for the active extension and returns
/// its status. Outputs are left in `tls.ext_reg0..`.
pub fn dispatch_syscall<H: MkCraftHal, I: Intrinsic>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    intrinsic: &mut I,
) -> BfStatus {
    let syscall = tls.ext_syscall;
    let Some(ext) = mk.ext(tls.active_extid) else {
        error!("[MK] syscall {:#018x} from unknown ext {:#x}", syscall, tls.active_extid);
        return BF_STATUS_FAILURE_UNKNOWN;
    };
    tls.ext_vmexit = mk.vmexit_ext();
    tls.ext_fail = mk.fail_ext();

    if syscall & BF_SYSCALL_SIG_MASK != BF_SYSCALL_SIG_VAL {
        error!("[MK] syscall {:#018x} has a bad signature", syscall);
        return BF_STATUS_FAILURE_UNKNOWN;
    }
    let family = syscall & BF_SYSCALL_OPCODE_NOSIG_MASK;
    let index = syscall & BF_SYSCALL_INDEX_MASK;

    if family == BF_HANDLE_OP_NOSIG_VAL && index == BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL {
        return to_status(handle_op::open_handle(tls, ext));
    }
    if !ext.is_handle_valid(tls.ext_reg0) {
        error!(
            "[MK] syscall {:#018x} from ext {:#x} with invalid handle {:#018x}",
            syscall, ext.id(), tls.ext_reg0
        );
        return BF_STATUS_FAILURE_INVALID_HANDLE;
    }
    if needs_vmexit_capability(family) && !tls.active_ext_is_vmexit_ext() {
        error!(
            "[MK] ext {:#x} is not allowed to make syscall {:#018x}",
            ext.id(),
            syscall
        );
        return BF_STATUS_FAILURE_UNKNOWN;
    }

    let ret = match family {
        BF_CONTROL_OP_NOSIG_VAL => control_op::dispatch(tls),
        BF_HANDLE_OP_NOSIG_VAL => handle_op::dispatch(tls, ext),
        BF_DEBUG_OP_NOSIG_VAL => debug_op::dispatch(mk, tls, ext),
        BF_CALLBACK_OP_NOSIG_VAL => callback_op::dispatch(mk, tls, ext),
        BF_VM_OP_NOSIG_VAL => vm_op::dispatch(mk, tls, intrinsic, ext),
        BF_VP_OP_NOSIG_VAL => vp_op::dispatch(mk, tls),
        BF_VS_OP_NOSIG_VAL => vs_op::dispatch(mk, tls, intrinsic),
        BF_INTRINSIC_OP_NOSIG_VAL => intrinsic_op::dispatch(tls, intrinsic),
        BF_MEM_OP_NOSIG_VAL => mem_op::dispatch(tls, ext),
        _ => unknown_syscall(tls),
    };
    if let Err(err) = ret {
        debug!("[MK] syscall {:#018x} failed: {:?}", syscall, err);
    }
    to_status(ret)
}

fn to_status(ret: HyperResult) -> BfStatus {
    match ret {
        Ok(()) => BF_STATUS_SUCCESS,
        Err(err) => status_of(err),
    }
}

/// The [`SyscallPort`] an extension gets while it runs on a core.
///
/// Keeps the extension's TLS block and the core's [`Tls`] in step around
/// every syscall.
pub struct SyscallGate<'a, H: MkCraftHal, I: Intrinsic> {
    mk: &'a Microkernel<H>,
    tls: &'a mut Tls,
    intrinsic: &'a mut I,
    block: &'a mut ExtTlsBlock,
}

impl<'a, H: MkCraftHal, I: Intrinsic> SyscallGate<'a, H, I> {
    /// Opens the gate for `tls.active_extid` and publishes the core's state
    /// into its TLS block.
    pub fn new(mk: &'a Microkernel<H>, tls: &'a mut Tls, intrinsic: &'a mut I) -> HyperResult<Self> {
        let ext = mk.ext(tls.active_extid).ok_or(HyperError::NotFound)?;
        let block = ext.tls_block(tls.ppid)?;
        block.publish(tls);
        Ok(Self {
            mk,
            tls,
            intrinsic,
            block,
        })
    }

    /// Takes back the register state the extension left in its TLS block.
    pub fn finish(self) {
        self.block.read_back(self.tls);
    }
}

impl<'a, H: MkCraftHal, I: Intrinsic> SyscallPort for SyscallGate<'a, H, I> {
    fn syscall(&mut self, syscall: u64, regs: &mut [u64; 6]) -> BfStatus {
        self.block.read_back(self.tls);
        self.tls.set_input_regs(syscall, *regs);
        let status = dispatch_syscall(self.mk, self.tls, self.intrinsic);
        *regs = self.tls.input_regs();
        self.block.publish(self.tls);
        status
    }

    fn tls_block(&mut self) -> &mut ExtTlsBlock {
        &mut *self.block
    }
}
