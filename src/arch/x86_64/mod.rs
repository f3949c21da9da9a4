mod intrinsic;
mod msr;
mod paging;
mod regs;
pub(crate) mod vmx;

pub use intrinsic::VmxIntrinsic;
pub use paging::{X64Entry, X64PagingMetaData};
pub use regs::{GeneralRegisters, StateSave};
pub use vmx::vmcs::{
    interruption_info, VmcsControl32, VmcsGuest64, VmcsGuestNW, VmcsReadOnly32,
    VmcsReadOnlyNW, INTERRUPTION_TYPE_NMI,
};
pub use vmx::{
    exit_reason, has_hardware_support, reg_location, RegLocation, VmxPerCpuState, VmxRegion,
    VmxonState, VmxonStep,
};
