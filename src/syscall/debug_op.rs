use super::*;
use helpers::*;

/// Longest string `write_str` copies out of an extension.
const MAX_STR_LEN: usize = 0x1000;

pub(super) fn dispatch<H: MkCraftHal>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    ext: &Extension<H>,
) -> HyperResult {
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_DEBUG_OP_OUT_IDX_VAL => {
            info!("[EXT {:#x}] {:#018x} {:#018x}", ext.id(), tls.ext_reg1, tls.ext_reg2);
        }
        BF_DEBUG_OP_DUMP_VM_IDX_VAL => mk.vm_pool().dump(get_vmid(tls.ext_reg1, 1)?),
        BF_DEBUG_OP_DUMP_VP_IDX_VAL => mk.vp_pool().dump(get_vpid(tls.ext_reg1, 1)?),
        BF_DEBUG_OP_DUMP_VS_IDX_VAL => mk.vs_pool().dump(get_vsid(tls.ext_reg1, 1)?),
        BF_DEBUG_OP_DUMP_VMEXIT_LOG_IDX_VAL => {
            mk.dump_vmexit_log(get_ppid(tls, tls.ext_reg1, 1)?)?;
        }
        BF_DEBUG_OP_WRITE_C_IDX_VAL => {
            info!("[EXT {:#x}] {}", ext.id(), tls.ext_reg1 as u8 as char);
        }
        BF_DEBUG_OP_WRITE_STR_IDX_VAL => {
            let s = ext
                .read_str(tls.ext_reg1 as usize, MAX_STR_LEN)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 1))?;
            info!("[EXT {:#x}] {}", ext.id(), s);
        }
        BF_DEBUG_OP_DUMP_EXT_IDX_VAL => {
            let extid = u16::try_from(tls.ext_reg1).map_err(|_| HyperError::InvalidInput(1))?;
            mk.ext(extid).ok_or(HyperError::InvalidInput(1))?.dump();
        }
        BF_DEBUG_OP_DUMP_PAGE_POOL_IDX_VAL => ext.dump_page_pool(),
        BF_DEBUG_OP_DUMP_HUGE_POOL_IDX_VAL => ext.dump_huge_pool(),
        _ => return unknown_syscall(tls),
    }
    Ok(())
}
