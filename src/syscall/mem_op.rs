use super::*;
use helpers::input_error;

pub(super) fn dispatch<H: MkCraftHal>(tls: &mut Tls, ext: &Extension<H>) -> HyperResult {
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_MEM_OP_ALLOC_PAGE_IDX_VAL => {
            let (virt, phys) = ext.alloc_page()?;
            tls.ext_reg0 = virt as u64;
            tls.ext_reg1 = phys as u64;
        }
        BF_MEM_OP_FREE_PAGE_IDX_VAL => {
            ext.free_page(tls.ext_reg1 as usize)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 1))?;
        }
        BF_MEM_OP_ALLOC_HUGE_IDX_VAL => {
            let (virt, phys) = ext
                .alloc_huge(tls.ext_reg1 as usize)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 1))?;
            tls.ext_reg0 = virt as u64;
            tls.ext_reg1 = phys as u64;
        }
        BF_MEM_OP_FREE_HUGE_IDX_VAL => {
            error!("[MK] free_huge is not supported");
            return Err(HyperError::NotSupported);
        }
        _ => return unknown_syscall(tls),
    }
    Ok(())
}
