//! Per physical core execution context.

use crate::arch::{GeneralRegisters, StateSave};
use crate::syscall::{BF_INVALID_ID, BF_ROOT_VMID};
use crate::{HyperError, HyperResult};

/// Where a physical core is in its hypervisor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    /// No VM entry has been attempted yet.
    NotLaunched,
    /// A VS is executing.
    Running,
    /// The VMExit extension is handling an exit.
    VmExit,
    /// The loader's state was restored. Terminal.
    Promoted,
    /// The core was stopped after an unrecoverable fault. Terminal.
    Halted,
}

impl CoreState {
    /// Returns the state after moving to `next`, or `BadState` if the
    /// transition is not legal.
    pub fn transition(self, next: CoreState) -> HyperResult<CoreState> {
        use CoreState::*;
        match (self, next) {
            (NotLaunched, Running)
            | (Running, VmExit)
            | (VmExit, Running)
            | (VmExit, Promoted)
            | (NotLaunched | Running | VmExit, Halted) => Ok(next),
            _ => {
                error!("[MK] illegal core transition {:?} -> {:?}", self, next);
                Err(HyperError::BadState)
            }
        }
    }

    /// Whether the session on this core is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, CoreState::Promoted | CoreState::Halted)
    }
}

/// Work requested by a syscall that the VMExit loop performs once the
/// extension returns to the microkernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    /// Enter the active VS.
    Run,
    /// Restore the given VS's state to the loader and end the session.
    Promote(u16),
    /// Stop this core.
    Exit,
}

/// Snapshot of the last exception taken on this core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EsrState {
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub gprs: GeneralRegisters,
}

/// The microkernel's per-core state.
///
/// Each core owns exactly one `Tls` and passes it by `&mut` through every
/// entry point. Extensions, VMs, VPs and VSs are referred to by id.
#[derive(Debug)]
pub struct Tls {
    /// This core's id.
    pub ppid: u16,
    /// Number of cores running the microkernel.
    pub online_pps: u16,

    /// The extension currently executing, or the last one that did.
    pub active_extid: u16,
    /// The extension holding the VMExit registration, once known on this core.
    pub ext_vmexit: Option<u16>,
    /// The extension holding the fail registration, once known on this core.
    pub ext_fail: Option<u16>,

    pub active_vmid: u16,
    pub active_vpid: u16,
    pub active_vsid: u16,
    /// The VS whose VMCS is current on this core.
    pub loaded_vsid: u16,

    /// Syscall register of the extension.
    pub ext_syscall: u64,
    pub ext_reg0: u64,
    pub ext_reg1: u64,
    pub ext_reg2: u64,
    pub ext_reg3: u64,
    pub ext_reg4: u64,
    pub ext_reg5: u64,

    /// General purpose registers of the active VS.
    pub gprs: GeneralRegisters,
    /// State the loader had before starting the microkernel on this core.
    pub root_state: StateSave,

    pub first_launch_succeeded: bool,
    state: CoreState,
    pub pending: Option<PendingAction>,

    pub esr: EsrState,
    pub nmi_pending: bool,
    /// Set while the fail extension's callback executes.
    pub in_fail_handler: bool,
}

impl Tls {
    /// Creates the context for core `ppid`.
    pub fn new(ppid: u16, online_pps: u16, root_state: StateSave) -> Self {
        Self {
            ppid,
            online_pps,
            active_extid: BF_INVALID_ID,
            ext_vmexit: None,
            ext_fail: None,
            active_vmid: BF_INVALID_ID,
            active_vpid: BF_INVALID_ID,
            active_vsid: BF_INVALID_ID,
            loaded_vsid: BF_INVALID_ID,
            ext_syscall: 0,
            ext_reg0: 0,
            ext_reg1: 0,
            ext_reg2: 0,
            ext_reg3: 0,
            ext_reg4: 0,
            ext_reg5: 0,
            gprs: GeneralRegisters::default(),
            root_state,
            first_launch_succeeded: false,
            state: CoreState::NotLaunched,
            pending: None,
            esr: EsrState::default(),
            nmi_pending: false,
            in_fail_handler: false,
        }
    }

    /// Current session state of this core.
    pub fn state(&self) -> CoreState {
        self.state
    }

    /// Moves this core to `next` if the transition is legal.
    pub fn transition(&mut self, next: CoreState) -> HyperResult {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    /// Whether the executing extension is the one that performs policy.
    pub fn active_ext_is_vmexit_ext(&self) -> bool {
        self.ext_vmexit == Some(self.active_extid)
    }

    /// Whether the executing extension is the fail extension.
    pub fn active_ext_is_fail_ext(&self) -> bool {
        self.ext_fail == Some(self.active_extid)
    }

    /// Whether `vmid` is the root VM.
    pub fn is_root_vm(&self, vmid: u16) -> bool {
        vmid == BF_ROOT_VMID
    }

    /// Input registers in order.
    pub fn input_regs(&self) -> [u64; 6] {
        [
            self.ext_reg0,
            self.ext_reg1,
            self.ext_reg2,
            self.ext_reg3,
            self.ext_reg4,
            self.ext_reg5,
        ]
    }

    /// Stores the syscall registers as the extension left them.
    pub fn set_input_regs(&mut self, syscall: u64, regs: [u64; 6]) {
        self.ext_syscall = syscall;
        [
            self.ext_reg0,
            self.ext_reg1,
            self.ext_reg2,
            self.ext_reg3,
            self.ext_reg4,
            self.ext_reg5,
        ] = regs;
    }
}
