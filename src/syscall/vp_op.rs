use super::*;
use helpers::*;

pub(super) fn dispatch<H: MkCraftHal>(mk: &Microkernel<H>, tls: &mut Tls) -> HyperResult {
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_VP_OP_CREATE_VP_IDX_VAL => {
            let vmid = get_vmid(tls.ext_reg1, 1)?;
            let vpid = mk
                .vp_pool()
                .allocate(mk.vm_pool(), vmid, tls.ppid)
                .map_err(|err| input_error(err, HyperError::NotFound, 1))?;
            tls.ext_reg0 = vpid as u64;
        }
        BF_VP_OP_DESTROY_VP_IDX_VAL => {
            let vpid = get_allocated_vpid(mk, tls.ext_reg1, 1)?;
            mk.vp_pool().deallocate(mk.vs_pool(), vpid)?;
        }
        _ => return unknown_syscall(tls),
    }
    Ok(())
}
