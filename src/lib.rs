//! mkcraft is the resource, trust and dispatch core of a type-1 hypervisor
//! microkernel.
//!
//! The microkernel multiplexes Intel VMX among a small number of trusted
//! extensions. Extensions reach kernel state only through the syscall
//! dispatcher, which validates the caller's handle and capability before any
//! pool is touched.

#![cfg_attr(not(test), no_std)]
#![allow(
    clippy::upper_case_acronyms,
    clippy::single_component_path_imports,
    clippy::collapsible_match,
    clippy::default_constructed_unit_structs,
    clippy::new_without_default,
    dead_code,
    non_camel_case_types,
    non_upper_case_globals,
    unused_imports,
    unused_assignments
)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate alloc;

#[cfg(target_arch = "x86_64")]
#[path = "arch/x86_64/mod.rs"]
mod arch;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("mkcraft only supports x86_64 hosts");

pub mod config;
mod esr;
mod ext;
mod hal;
mod intrinsic;
mod memory;
mod mk_main;
pub mod paging;
pub mod pool;
pub mod syscall;
mod tls;
mod vmexit;

#[cfg(test)]
mod test_support;

/// mkcraft Result Define.
pub type HyperResult<T = ()> = Result<T, HyperError>;

pub use arch::{
    has_hardware_support, GeneralRegisters, StateSave, VmxIntrinsic, VmxPerCpuState, VmxonState,
};
pub use esr::{esr_vector_to_name, EsrOutcome};
pub use ext::{ExtFault, ExtTlsBlock, Extension, ExtensionImage, Segment};
pub use hal::MkCraftHal;
pub use intrinsic::Intrinsic;
pub use memory::{HostPhysAddr, HostVirtAddr, MemFlags, PhysFrame, PAGE_SIZE_2M, PAGE_SIZE_4K};
pub use mk_main::{CoreExit, MkArgs, Microkernel};
pub use tls::{CoreState, EsrState, PendingAction, Tls};
pub use vmexit::{VmExitLog, VmExitRecord};

/// The error type for microkernel operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HyperError {
    /// Internal error.
    Internal,
    /// No supported error.
    NotSupported,
    /// No memory error.
    NoMemory,
    /// Invalid parameter error.
    InvalidParam,
    /// A syscall input register held an invalid value. Carries the register
    /// index (0 through 5).
    InvalidInput(u8),
    /// Memory out of range error.
    OutOfRange,
    /// Bad state error.
    BadState,
    /// Not found error.
    NotFound,
    /// The target already exists with different contents.
    AlreadyExists,
    /// The caller lacks the capability for this operation.
    PermissionDenied,
    /// The caller presented a handle it does not own.
    InvalidHandle,
    /// Disabled.
    Disabled,
}
