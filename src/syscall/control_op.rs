use super::*;

pub(super) fn dispatch(tls: &mut Tls) -> HyperResult {
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_CONTROL_OP_EXIT_IDX_VAL => {
            info!("[MK] ext {:#x} asked to exit on pp {:#x}", tls.active_extid, tls.ppid);
            tls.pending = Some(PendingAction::Exit);
            Ok(())
        }
        // Callbacks are delivered by returning to the microkernel, so there
        // is nothing to wait for here.
        BF_CONTROL_OP_WAIT_IDX_VAL => Ok(()),
        _ => unknown_syscall(tls),
    }
}
