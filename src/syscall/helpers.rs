//! Validation of syscall input registers.
//!
//! Each helper reports a bad value as `InvalidInput(n)`, where `n` is the
//! input register it came from.

use crate::config::{MAX_VMS, MAX_VPS, MAX_VSS};
use crate::syscall::BF_INVALID_ID;
use crate::{HyperError, HyperResult, MkCraftHal, Microkernel, Tls};

fn get_id(reg: u64, max: usize, n: u8) -> HyperResult<u16> {
    if reg >= max as u64 || reg == BF_INVALID_ID as u64 {
        error!("[MK] id {:#018x} in reg{} is out of range", reg, n);
        return Err(HyperError::InvalidInput(n));
    }
    Ok(reg as u16)
}

pub(super) fn get_vmid(reg: u64, n: u8) -> HyperResult<u16> {
    get_id(reg, MAX_VMS, n)
}

pub(super) fn get_vpid(reg: u64, n: u8) -> HyperResult<u16> {
    get_id(reg, MAX_VPS, n)
}

pub(super) fn get_vsid(reg: u64, n: u8) -> HyperResult<u16> {
    get_id(reg, MAX_VSS, n)
}

/// A core id below the number of online cores.
pub(super) fn get_ppid(tls: &Tls, reg: u64, n: u8) -> HyperResult<u16> {
    get_id(reg, tls.online_pps as usize, n)
}

pub(super) fn get_allocated_vmid<H: MkCraftHal>(
    mk: &Microkernel<H>,
    reg: u64,
    n: u8,
) -> HyperResult<u16> {
    let vmid = get_vmid(reg, n)?;
    if !mk.vm_pool().is_allocated(vmid) {
        error!("[MK] vm {:#x} in reg{} is not allocated", vmid, n);
        return Err(HyperError::InvalidInput(n));
    }
    Ok(vmid)
}

pub(super) fn get_allocated_vpid<H: MkCraftHal>(
    mk: &Microkernel<H>,
    reg: u64,
    n: u8,
) -> HyperResult<u16> {
    let vpid = get_vpid(reg, n)?;
    if !mk.vp_pool().is_allocated(vpid) {
        error!("[MK] vp {:#x} in reg{} is not allocated", vpid, n);
        return Err(HyperError::InvalidInput(n));
    }
    Ok(vpid)
}

pub(super) fn get_allocated_vsid<H: MkCraftHal>(
    mk: &Microkernel<H>,
    reg: u64,
    n: u8,
) -> HyperResult<u16> {
    let vsid = get_vsid(reg, n)?;
    if !mk.vs_pool().is_allocated(vsid) {
        error!("[MK] vs {:#x} in reg{} is not allocated", vsid, n);
        return Err(HyperError::InvalidInput(n));
    }
    Ok(vsid)
}

/// Rewrites one error kind as a bad input register.
pub(super) fn input_error(err: HyperError, kind: HyperError, n: u8) -> HyperError {
    if err == kind {
        HyperError::InvalidInput(n)
    } else {
        err
    }
}
