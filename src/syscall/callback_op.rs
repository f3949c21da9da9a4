use super::*;
use helpers::input_error;

pub(super) fn dispatch<H: MkCraftHal>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    ext: &Extension<H>,
) -> HyperResult {
    let ip = tls.ext_reg1;
    let ret = match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL => ext.register_bootstrap(ip),
        BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL => mk.register_vmexit(ext, ip),
        BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL => mk.register_fail(ext, ip),
        _ => return unknown_syscall(tls),
    };
    ret.map_err(|err| input_error(err, HyperError::InvalidParam, 1))?;
    tls.ext_vmexit = mk.vmexit_ext();
    tls.ext_fail = mk.fail_ext();
    Ok(())
}
