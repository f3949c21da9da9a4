use super::*;

pub(super) fn open_handle<H: MkCraftHal>(tls: &mut Tls, ext: &Extension<H>) -> HyperResult {
    let version = tls.ext_reg0;
    tls.ext_reg0 = ext.open_handle(version)?;
    info!("[MK] ext {:#x} opened handle {:#018x}", ext.id(), tls.ext_reg0);
    Ok(())
}

pub(super) fn dispatch<H: MkCraftHal>(tls: &mut Tls, ext: &Extension<H>) -> HyperResult {
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL => open_handle(tls, ext),
        BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL => {
            ext.close_handle();
            Ok(())
        }
        _ => unknown_syscall(tls),
    }
}
