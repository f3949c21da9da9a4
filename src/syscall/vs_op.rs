use super::*;
use helpers::*;

/// Makes `vmid`/`vpid`/`vsid` the active set on this core.
///
/// The VP follows the core if it is inactive elsewhere. The VS must already
/// be assigned to this core. Every check runs before the active set changes,
/// so a rejected switch leaves the core as it was.
fn switch_active<H: MkCraftHal>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    regs: (u64, u64, u64),
) -> HyperResult {
    let vmid = get_allocated_vmid(mk, regs.0, 1)?;
    let vpid = get_allocated_vpid(mk, regs.1, 2)?;
    let vsid = get_allocated_vsid(mk, regs.2, 3)?;

    let (vms, vps, vss) = (mk.vm_pool(), mk.vp_pool(), mk.vs_pool());
    if vps.assigned_vm(vpid) != vmid {
        error!("[MK] vp {:#x} is not assigned to vm {:#x}", vpid, vmid);
        return Err(HyperError::InvalidInput(2));
    }
    if vss.assigned_vp(vsid) != vpid {
        error!("[MK] vs {:#x} is not assigned to vp {:#x}", vsid, vpid);
        return Err(HyperError::InvalidInput(3));
    }
    if vss.assigned_pp(vsid) != tls.ppid {
        error!("[MK] vs {:#x} is not assigned to pp {:#x}", vsid, tls.ppid);
        return Err(HyperError::InvalidInput(3));
    }
    let vp_moves = vps.assigned_pp(vpid) != tls.ppid;
    if vp_moves && vps.is_active(vpid) != BF_INVALID_ID {
        error!(
            "[MK] vp {:#x} is active on pp {:#x} and cannot move to pp {:#x}",
            vpid,
            vps.is_active(vpid),
            tls.ppid
        );
        return Err(HyperError::InvalidInput(2));
    }

    let (old_vmid, old_vpid, old_vsid) = (tls.active_vmid, tls.active_vpid, tls.active_vsid);
    if old_vmid != vmid {
        vms.set_inactive(tls, old_vmid)?;
        vms.set_active(tls, vmid)?;
    }
    if old_vpid != vpid {
        vps.set_inactive(tls, old_vpid)?;
        if vp_moves {
            vps.migrate(tls.ppid, vpid)?;
        }
        vps.set_active(tls, vpid)?;
    }
    if old_vsid != vsid {
        vss.set_inactive(tls, old_vsid)?;
        vss.set_active(tls, vsid)?;
    }
    Ok(())
}

fn active_vsid(tls: &Tls) -> HyperResult<u16> {
    if tls.active_vsid == BF_INVALID_ID {
        error!("[MK] pp {:#x} has no active vs", tls.ppid);
        return Err(HyperError::BadState);
    }
    Ok(tls.active_vsid)
}

fn set_active_regs(tls: &Tls) -> (u64, u64, u64) {
    (tls.ext_reg1, tls.ext_reg2, tls.ext_reg3)
}

pub(super) fn dispatch<H: MkCraftHal, I: Intrinsic>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    intrinsic: &mut I,
) -> HyperResult {
    let vss = mk.vs_pool();
    match tls.ext_syscall & BF_SYSCALL_INDEX_MASK {
        BF_VS_OP_CREATE_VS_IDX_VAL => {
            let vpid = get_vpid(tls.ext_reg1, 1)?;
            let ppid = get_ppid(tls, tls.ext_reg2, 2)?;
            let vsid = vss
                .allocate(tls, intrinsic, mk.vp_pool(), vpid, ppid)
                .map_err(|err| input_error(err, HyperError::NotFound, 1))?;
            tls.ext_reg0 = vsid as u64;
        }
        BF_VS_OP_DESTROY_VS_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg1, 1)?;
            vss.deallocate(tls, intrinsic, vsid)?;
        }
        BF_VS_OP_INIT_AS_ROOT_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg1, 1)?;
            if !tls.is_root_vm(vss.assigned_vm(vsid)) {
                error!("[MK] vs {:#x} does not belong to the root vm", vsid);
                return Err(HyperError::InvalidInput(1));
            }
            vss.init_as_root(tls, intrinsic, vsid)?;
        }
        BF_VS_OP_READ_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg1, 1)?;
            let reg = tls.ext_reg2;
            tls.ext_reg0 = vss
                .read_reg(tls, intrinsic, vsid, reg)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 2))?;
        }
        BF_VS_OP_WRITE_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg1, 1)?;
            let (reg, val) = (tls.ext_reg2, tls.ext_reg3);
            vss.write_reg(tls, intrinsic, vsid, reg, val)
                .map_err(|err| input_error(err, HyperError::InvalidParam, 2))?;
        }
        BF_VS_OP_RUN_IDX_VAL => {
            let regs = set_active_regs(tls);
            switch_active(mk, tls, regs)?;
            tls.pending = Some(PendingAction::Run);
        }
        BF_VS_OP_RUN_CURRENT_IDX_VAL => {
            active_vsid(tls)?;
            tls.pending = Some(PendingAction::Run);
        }
        BF_VS_OP_ADVANCE_IP_AND_RUN_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg3, 3)?;
            vss.advance_ip(tls, intrinsic, vsid)?;
            let regs = set_active_regs(tls);
            switch_active(mk, tls, regs)?;
            tls.pending = Some(PendingAction::Run);
        }
        BF_VS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL => {
            let vsid = active_vsid(tls)?;
            vss.advance_ip(tls, intrinsic, vsid)?;
            tls.pending = Some(PendingAction::Run);
        }
        BF_VS_OP_PROMOTE_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg1, 1)?;
            if vss.assigned_pp(vsid) != tls.ppid {
                return Err(HyperError::InvalidInput(1));
            }
            info!("[MK] pp {:#x} will promote vs {:#x}", tls.ppid, vsid);
            tls.pending = Some(PendingAction::Promote(vsid));
        }
        BF_VS_OP_CLEAR_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg1, 1)?;
            vss.clear(tls, intrinsic, vsid)?;
        }
        BF_VS_OP_MIGRATE_IDX_VAL => {
            let ppid = get_ppid(tls, tls.ext_reg1, 1)?;
            let vsid = get_allocated_vsid(mk, tls.ext_reg2, 2)?;
            vss.migrate(tls, intrinsic, ppid, vsid)?;
        }
        BF_VS_OP_SET_ACTIVE_IDX_VAL => {
            let regs = set_active_regs(tls);
            switch_active(mk, tls, regs)?;
        }
        BF_VS_OP_ADVANCE_IP_AND_SET_ACTIVE_IDX_VAL => {
            let vsid = get_allocated_vsid(mk, tls.ext_reg3, 3)?;
            vss.advance_ip(tls, intrinsic, vsid)?;
            let regs = set_active_regs(tls);
            switch_active(mk, tls, regs)?;
        }
        _ => return unknown_syscall(tls),
    }
    Ok(())
}
