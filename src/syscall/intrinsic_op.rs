use super::*;

fn get_msr(reg: u64) -> HyperResult<u32> {
    u32::try_from(reg).map_err(|_| HyperError::InvalidInput(1))
}

pub(super) fn dispatch<I: Intrinsic>(tls: &mut Tls, intrinsic: &mut I) -> HyperResult {
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_INTRINSIC_OP_RDMSR_IDX_VAL => {
            tls.ext_reg0 = intrinsic.rdmsr(get_msr(tls.ext_reg1)?);
        }
        BF_INTRINSIC_OP_WRMSR_IDX_VAL => {
            let msr = get_msr(tls.ext_reg1)?;
            trace!("[MK] wrmsr {:#x} <- {:#x}", msr, tls.ext_reg2);
            intrinsic.wrmsr(msr, tls.ext_reg2);
        }
        _ => return unknown_syscall(tls),
    }
    Ok(())
}
