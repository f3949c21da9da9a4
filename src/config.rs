//! Compile-time configuration of the microkernel.
//!
//! Pool capacities and the extension address-space layout are fixed when the
//! microkernel is built. Runtime values that the loader hands over on each
//! core live in [`crate::MkArgs`].

use crate::memory::PAGE_SIZE_4K;

/// The maximum number of physical cores we can support.
pub const MAX_PPS: usize = 8;

/// Capacity of the VM pool.
pub const MAX_VMS: usize = 16;

/// Capacity of the VP pool.
pub const MAX_VPS: usize = 64;

/// Capacity of the VS pool.
pub const MAX_VSS: usize = 64;

/// The maximum number of extensions that can be loaded at boot.
pub const MAX_EXTENSIONS: usize = 4;

/// Number of VMExits remembered per core for `dump_vmexit_log`.
pub const VMEXIT_LOG_SIZE: usize = 32;

/// Start of the window extension code segments must be linked into.
pub const EXT_CODE_ADDR: usize = 0x0000_0080_0000_0000;
/// Size of the extension code window.
pub const EXT_CODE_SIZE: usize = 0x0000_0080_0000_0000;

/// Base of the per-core extension stacks.
pub const EXT_STACK_ADDR: usize = 0x0000_0100_0000_0000;
/// Size of one per-core extension stack, excluding its guard page.
pub const EXT_STACK_SIZE: usize = 8 * PAGE_SIZE_4K;

/// Base of the per-core stacks used while running the fail callback.
pub const EXT_FAIL_STACK_ADDR: usize = 0x0000_0140_0000_0000;
/// Size of one per-core fail stack, excluding its guard page.
pub const EXT_FAIL_STACK_SIZE: usize = 4 * PAGE_SIZE_4K;

/// Base of the per-core extension TLS blocks.
pub const EXT_TLS_ADDR: usize = 0x0000_0180_0000_0000;
/// Size of one per-core TLS region. The second page holds the TLS block the
/// thread pointer refers to.
pub const EXT_TLS_SIZE: usize = 2 * PAGE_SIZE_4K;

/// Base of the page pool window. A page at physical address `p` is mapped at
/// `EXT_PAGE_POOL_ADDR + p`.
pub const EXT_PAGE_POOL_ADDR: usize = 0x0000_0200_0000_0000;
/// Size of the page pool window.
pub const EXT_PAGE_POOL_SIZE: usize = 0x0000_0080_0000_0000;

/// Base of the heap pool window, used for physically contiguous allocations.
pub const EXT_HEAP_POOL_ADDR: usize = 0x0000_0300_0000_0000;
/// Size of the heap pool window.
pub const EXT_HEAP_POOL_SIZE: usize = 0x0000_0080_0000_0000;
/// Largest single heap pool allocation.
pub const EXT_HEAP_POOL_MAX_ALLOC: usize = 0x0100_0000;

/// Base of the direct map window used by `vm_op_map_direct`.
pub const EXT_DIRECT_MAP_ADDR: usize = 0x0000_0400_0000_0000;
/// Size of the direct map window.
pub const EXT_DIRECT_MAP_SIZE: usize = 0x0000_0080_0000_0000;

/// The first root-table index that belongs to the microkernel. Everything at
/// or above this index is aliased into each extension's root page table.
pub const MK_ROOT_INDEX_START: usize = 256;
