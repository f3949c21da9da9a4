use super::*;
use helpers::*;

pub(super) fn dispatch<H: MkCraftHal, I: Intrinsic>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    intrinsic: &mut I,
    ext: &Extension<H>,
) -> HyperResult {
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_VM_OP_CREATE_VM_IDX_VAL => {
            tls.ext_reg0 = mk.vm_pool().allocate()? as u64;
        }
        BF_VM_OP_DESTROY_VM_IDX_VAL => {
            let vmid = get_allocated_vmid(mk, tls.ext_reg1, 1)?;
            if tls.is_root_vm(vmid) {
                error!("[MK] the root vm cannot be destroyed");
                return Err(HyperError::InvalidInput(1));
            }
            mk.vm_pool().deallocate(mk.vp_pool(), vmid)?;
        }
        BF_VM_OP_MAP_DIRECT_IDX_VAL => {
            let vmid = get_allocated_vmid(mk, tls.ext_reg1, 1)?;
            let virt = ext
                .map_direct(vmid, tls.ext_reg2 as usize)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 2))?;
            tls.ext_reg0 = virt as u64;
        }
        BF_VM_OP_UNMAP_DIRECT_IDX_VAL => {
            let vmid = get_allocated_vmid(mk, tls.ext_reg1, 1)?;
            ext.unmap_direct(vmid, tls.ext_reg2 as usize)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 2))?;
        }
        // Other cores pick up the change on their next address-space switch,
        // which happens before every extension call.
        BF_VM_OP_UNMAP_DIRECT_BROADCAST_IDX_VAL => {
            let vmid = get_allocated_vmid(mk, tls.ext_reg1, 1)?;
            let virt = tls.ext_reg2 as usize;
            ext.unmap_direct(vmid, virt)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 2))?;
            intrinsic.invlpg(virt);
        }
        _ => return unknown_syscall(tls),
    }
    Ok(())
}
