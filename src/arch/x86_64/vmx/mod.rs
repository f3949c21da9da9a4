mod detect;
mod percpu;
mod region;
pub(crate) mod vmcs;

pub use detect::has_hardware_support;
pub use percpu::{VmxPerCpuState, VmxonState, VmxonStep};
pub use region::VmxRegion;
pub use vmcs::{exit_reason, reg_location, RegLocation};
