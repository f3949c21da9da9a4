//! Exception handling for faults taken in extension code, and the fast-fail
//! path every unrecoverable error on a core ends in.

use crate::syscall::BF_STATUS_SUCCESS;
use crate::tls::EsrState;
use crate::{ExtFault, Intrinsic, MkCraftHal, Microkernel, Tls};

/// Vector of the non-maskable interrupt.
pub const NMI_VECTOR: u64 = 2;

/// What a core does after an exception or a failure was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsrOutcome {
    /// Nothing to escalate. Carry on where the core left off.
    Return,
    /// The fail extension handled the failure.
    Recovered,
    /// The core cannot continue.
    Halted,
}

/// Name of exception `vector`, for logs.
pub fn esr_vector_to_name(vector: u64) -> &'static str {
    match vector {
        0 => "divide error",
        1 => "debug exception",
        NMI_VECTOR => "nmi",
        3 => "breakpoint",
        4 => "overflow",
        5 => "bound range exceeded",
        6 => "invalid opcode",
        7 => "device not available",
        8 => "double fault",
        10 => "invalid tss",
        11 => "segment not present",
        12 => "stack-segment fault",
        13 => "general protection",
        14 => "page fault",
        16 => "x87 fpu floating-point error",
        17 => "alignment check",
        18 => "machine check",
        19 => "simd floating-point exception",
        _ => "unknown",
    }
}

fn dump_esr(esr: &EsrState) {
    error!("[MK]   rip    {:#018x}  rsp {:#018x}", esr.rip, esr.rsp);
    let regs = esr.gprs.as_array();
    const NAMES: [&str; 15] = [
        "rax", "rbx", "rcx", "rdx", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
        "r14", "r15",
    ];
    for (name, val) in NAMES.iter().zip(regs.iter()) {
        error!("[MK]   {:<6} {:#018x}", name, val);
    }
}

/// Handles an exception taken while extension code was running.
///
/// An NMI is remembered and injected into the guest on the next entry. Any
/// other vector is logged and escalated through [`fast_fail`].
pub fn dispatch_esr<H: MkCraftHal, I: Intrinsic>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    intrinsic: &mut I,
    fault: ExtFault,
) -> EsrOutcome {
    tls.esr = EsrState {
        vector: fault.vector,
        error_code: fault.error_code,
        rip: fault.rip,
        gprs: tls.gprs,
        ..EsrState::default()
    };
    if fault.vector == NMI_VECTOR {
        debug!("[MK] nmi on pp {:#x}, injecting on next entry", tls.ppid);
        tls.nmi_pending = true;
        return EsrOutcome::Return;
    }
    error!(
        "[MK] {} ({:#x}) in ext {:#x} on pp {:#x}, error code {:#x}",
        esr_vector_to_name(fault.vector),
        fault.vector,
        tls.active_extid,
        tls.ppid,
        fault.error_code
    );
    dump_esr(&tls.esr);
    fast_fail(mk, tls, intrinsic, fault.vector, fault.error_code)
}

/// Hands an unrecoverable failure on this core to the fail extension.
///
/// The fail callback runs at most once per failure and never for a failure
/// inside itself. Without a fail extension, or if its callback does not
/// return success, the core halts.
pub fn fast_fail<H: MkCraftHal, I: Intrinsic>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    intrinsic: &mut I,
    errc: u64,
    arg: u64,
) -> EsrOutcome {
    let Some(extid) = mk.fail_ext() else {
        error!("[MK] no fail handler registered, pp {:#x} halts", tls.ppid);
        return EsrOutcome::Halted;
    };
    if tls.in_fail_handler {
        error!("[MK] failure inside the fail handler of ext {:#x}", extid);
        return EsrOutcome::Halted;
    }
    let Some((ip, sp)) = mk
        .ext(extid)
        .and_then(|ext| Some((ext.fail_ip()?, ext.fail_stack_top(tls.ppid))))
    else {
        return EsrOutcome::Halted;
    };

    tls.in_fail_handler = true;
    tls.pending = None;
    let ret = mk.execute_ext(tls, intrinsic, extid, ip, sp, errc, arg);
    tls.in_fail_handler = false;

    match ret {
        Ok(Ok(BF_STATUS_SUCCESS)) => {
            info!("[MK] ext {:#x} recovered pp {:#x}", extid, tls.ppid);
            EsrOutcome::Recovered
        }
        Ok(Ok(status)) => {
            error!("[MK] fail handler returned {:#018x}", status);
            EsrOutcome::Halted
        }
        Ok(Err(fault)) => {
            error!(
                "[MK] {} ({:#x}) inside the fail handler at {:#018x}",
                esr_vector_to_name(fault.vector),
                fault.vector,
                fault.rip
            );
            EsrOutcome::Halted
        }
        Err(err) => {
            error!("[MK] fail handler could not run: {:?}", err);
            EsrOutcome::Halted
        }
    }
}
