//! The VMExit loop each core runs once its root VS is set up.

use arrayvec::ArrayVec;

use crate::arch::{exit_reason, GeneralRegisters, VmcsGuestNW, VmcsReadOnly32, VmcsReadOnlyNW};
use crate::config::VMEXIT_LOG_SIZE;
use crate::esr::{self, EsrOutcome};
use crate::syscall::{BF_STATUS_FAILURE_UNKNOWN, BF_STATUS_SUCCESS};
use crate::{CoreExit, CoreState, HyperError, HyperResult, Intrinsic, MkCraftHal, Microkernel};
use crate::{PendingAction, Tls};

/// One VMExit as seen by the microkernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmExitRecord {
    pub vmid: u16,
    pub vpid: u16,
    pub vsid: u16,
    pub exit_reason: u64,
    pub exit_qualification: u64,
    pub gprs: GeneralRegisters,
    pub rsp: u64,
    pub rip: u64,
}

impl VmExitRecord {
    fn capture<I: Intrinsic>(tls: &Tls, intrinsic: &I, exit_reason: u64) -> Self {
        let read = |field: u32| intrinsic.vmrd(field).unwrap_or(0);
        Self {
            vmid: tls.active_vmid,
            vpid: tls.active_vpid,
            vsid: tls.active_vsid,
            exit_reason,
            exit_qualification: read(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32),
            gprs: tls.gprs,
            rsp: read(VmcsGuestNW::RSP as u32),
            rip: read(VmcsGuestNW::RIP as u32),
        }
    }
}

/// The last [`VMEXIT_LOG_SIZE`] exits on one core.
#[derive(Debug, Default)]
pub struct VmExitLog {
    records: ArrayVec<VmExitRecord, VMEXIT_LOG_SIZE>,
    next: usize,
}

impl VmExitLog {
    pub const fn new() -> Self {
        Self {
            records: ArrayVec::new_const(),
            next: 0,
        }
    }

    /// Adds `record`, dropping the oldest one once the log is full.
    pub fn push(&mut self, record: VmExitRecord) {
        if self.records.is_full() {
            self.records[self.next] = record;
        } else {
            self.records.push(record);
        }
        self.next = (self.next + 1) % VMEXIT_LOG_SIZE;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &VmExitRecord> {
        let split = if self.records.is_full() { self.next } else { 0 };
        self.records[split..].iter().chain(self.records[..split].iter())
    }

    pub fn dump(&self, ppid: u16) {
        info!("[MK] vmexit log of pp {:#x} ({} entries):", ppid, self.len());
        for r in self.iter() {
            info!(
                "[MK]   vm {:#06x} vp {:#06x} vs {:#06x}: {:<18} qual {:#018x} rip {:#018x} rsp {:#018x}",
                r.vmid,
                r.vpid,
                r.vsid,
                exit_reason::name(r.exit_reason),
                r.exit_qualification,
                r.rip,
                r.rsp
            );
        }
    }
}

/// Acts on the outcome of a callback or of failure handling. Returns the
/// reason this core's session ended, or `None` to enter the guest again.
fn settle<H: MkCraftHal, I: Intrinsic>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    intrinsic: &mut I,
    outcome: EsrOutcome,
) -> Option<CoreExit> {
    if outcome == EsrOutcome::Halted {
        return Some(mk.halt(tls, intrinsic));
    }
    match tls.pending.take() {
        Some(PendingAction::Promote(vsid)) => match mk.promote(tls, intrinsic, vsid) {
            Ok(exit) => Some(exit),
            Err(err) => {
                error!("[MK] promotion of vs {:#x} failed: {:?}", vsid, err);
                Some(mk.halt(tls, intrinsic))
            }
        },
        Some(PendingAction::Exit) => Some(mk.halt(tls, intrinsic)),
        Some(PendingAction::Run) | None => None,
    }
}

/// Runs the active VS on this core and hands every exit to the VMExit
/// extension until the session ends.
///
/// Returns an error only if the very first entry on this core fails, so the
/// loader can carry on without the microkernel.
pub fn run_loop<H: MkCraftHal, I: Intrinsic>(
    mk: &Microkernel<H>,
    tls: &mut Tls,
    intrinsic: &mut I,
) -> HyperResult<CoreExit> {
    let extid = mk.vmexit_ext().ok_or(HyperError::NotFound)?;
    let ext = mk.ext(extid).ok_or(HyperError::NotFound)?;
    let ip = ext.vmexit_ip().ok_or(HyperError::NotFound)?;
    let sp = ext.stack_top(tls.ppid);

    loop {
        tls.transition(CoreState::Running)?;
        let entry = mk.vs_pool().run(tls, intrinsic);
        tls.transition(CoreState::VmExit)?;

        let reason = match entry {
            Ok(reason) => reason,
            Err(err) if !tls.first_launch_succeeded => {
                error!("[MK] first vm entry on pp {:#x} failed: {:?}", tls.ppid, err);
                tls.transition(CoreState::Halted)?;
                return Err(err);
            }
            Err(err) => {
                let insn_err = intrinsic
                    .vmrd(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32)
                    .unwrap_or(0);
                error!(
                    "[MK] vm entry of vs {:#x} failed: {:?}, instruction error {:#x}",
                    tls.active_vsid, err, insn_err
                );
                tls.pending = None;
                let outcome = esr::fast_fail(mk, tls, intrinsic, BF_STATUS_FAILURE_UNKNOWN, insn_err);
                match settle(mk, tls, intrinsic, outcome) {
                    Some(exit) => return Ok(exit),
                    None => continue,
                }
            }
        };
        tls.first_launch_succeeded = true;

        let vsid = tls.active_vsid;
        let record = VmExitRecord::capture(tls, intrinsic, reason);
        mk.log_vmexit(tls.ppid, record);
        trace!(
            "[MK] vmexit on pp {:#x} vs {:#x}: {} ({:#x})",
            tls.ppid,
            vsid,
            exit_reason::name(reason),
            reason
        );

        tls.pending = None;
        let outcome = match mk.execute_ext(tls, intrinsic, extid, ip, sp, vsid as u64, reason)? {
            Ok(BF_STATUS_SUCCESS) => EsrOutcome::Return,
            Ok(status) => {
                error!(
                    "[MK] vmexit handler returned {:#018x} for {}",
                    status,
                    exit_reason::name(reason)
                );
                tls.pending = None;
                esr::fast_fail(mk, tls, intrinsic, status, reason)
            }
            Err(fault) => {
                tls.pending = None;
                esr::dispatch_esr(mk, tls, intrinsic, fault)
            }
        };
        if let Some(exit) = settle(mk, tls, intrinsic, outcome) {
            return Ok(exit);
        }
    }
}
