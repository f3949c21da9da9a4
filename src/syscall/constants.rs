//! Syscall ABI values shared with extensions.
//!
//! These must stay bit-stable within a major ABI version.

/// Status returned by every syscall.
pub type BfStatus = u64;

pub const BF_STATUS_SUCCESS: BfStatus = 0;
pub const BF_STATUS_FAILURE_UNKNOWN: BfStatus = 0xDEAD_0000_0001_0001;
pub const BF_STATUS_FAILURE_INVALID_HANDLE: BfStatus = 0xDEAD_0000_0002_0001;
pub const BF_STATUS_FAILURE_UNSUPPORTED: BfStatus = 0xDEAD_0000_0004_0001;
pub const BF_STATUS_INVALID_PERM_DENIED: BfStatus = 0xDEAD_0000_0001_0002;
pub const BF_STATUS_INVALID_INPUT_REG0: BfStatus = 0xDEAD_0000_0001_0003;
pub const BF_STATUS_INVALID_INPUT_REG1: BfStatus = 0xDEAD_0000_0002_0003;
pub const BF_STATUS_INVALID_INPUT_REG2: BfStatus = 0xDEAD_0000_0004_0003;
pub const BF_STATUS_INVALID_INPUT_REG3: BfStatus = 0xDEAD_0000_0008_0003;
pub const BF_STATUS_INVALID_INPUT_REG4: BfStatus = 0xDEAD_0000_0010_0003;
pub const BF_STATUS_INVALID_INPUT_REG5: BfStatus = 0xDEAD_0000_0020_0003;

/// The only ABI version this microkernel speaks.
pub const BF_SPEC_ID1_VAL: u64 = 0x3123_6642;

/// Marks an id as "none". Never handed out by a pool.
pub const BF_INVALID_ID: u16 = 0xFFFF;
/// Never returned by `handle_op_open_handle`.
pub const BF_INVALID_HANDLE: u64 = u64::MAX;
/// Signature in the top 16 bits of every handle.
pub const BF_HANDLE_SIG: u64 = 0x6642 << 48;
/// The VM every core starts in.
pub const BF_ROOT_VMID: u16 = 0;
/// The bootstrap core.
pub const BF_BS_PPID: u16 = 0;

pub const BF_SYSCALL_SIG_VAL: u64 = 0x6642_0000_0000_0000;
pub const BF_SYSCALL_SIG_MASK: u64 = 0xFFFF_0000_0000_0000;
pub const BF_SYSCALL_OPCODE_MASK: u64 = 0xFFFF_0000_FFFF_0000;
pub const BF_SYSCALL_OPCODE_NOSIG_MASK: u64 = 0x0000_0000_FFFF_0000;
pub const BF_SYSCALL_INDEX_MASK: u64 = 0x0000_0000_0000_FFFF;

pub const BF_CONTROL_OP_VAL: u64 = 0x6642_0000_0000_0000;
pub const BF_HANDLE_OP_VAL: u64 = 0x6642_0000_0001_0000;
pub const BF_DEBUG_OP_VAL: u64 = 0x6642_0000_0002_0000;
pub const BF_CALLBACK_OP_VAL: u64 = 0x6642_0000_0003_0000;
pub const BF_VM_OP_VAL: u64 = 0x6642_0000_0004_0000;
pub const BF_VP_OP_VAL: u64 = 0x6642_0000_0005_0000;
pub const BF_VS_OP_VAL: u64 = 0x6642_0000_0006_0000;
pub const BF_INTRINSIC_OP_VAL: u64 = 0x6642_0000_0007_0000;
pub const BF_MEM_OP_VAL: u64 = 0x6642_0000_0008_0000;

pub const BF_CONTROL_OP_NOSIG_VAL: u64 = 0x0000_0000_0000_0000;
pub const BF_HANDLE_OP_NOSIG_VAL: u64 = 0x0000_0000_0001_0000;
pub const BF_DEBUG_OP_NOSIG_VAL: u64 = 0x0000_0000_0002_0000;
pub const BF_CALLBACK_OP_NOSIG_VAL: u64 = 0x0000_0000_0003_0000;
pub const BF_VM_OP_NOSIG_VAL: u64 = 0x0000_0000_0004_0000;
pub const BF_VP_OP_NOSIG_VAL: u64 = 0x0000_0000_0005_0000;
pub const BF_VS_OP_NOSIG_VAL: u64 = 0x0000_0000_0006_0000;
pub const BF_INTRINSIC_OP_NOSIG_VAL: u64 = 0x0000_0000_0007_0000;
pub const BF_MEM_OP_NOSIG_VAL: u64 = 0x0000_0000_0008_0000;

pub const BF_CONTROL_OP_EXIT_IDX_VAL: u64 = 0x0;
pub const BF_CONTROL_OP_WAIT_IDX_VAL: u64 = 0x1;

pub const BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL: u64 = 0x0;
pub const BF_HANDLE_OP_CLOSE_HANDLE_IDX_VAL: u64 = 0x1;

pub const BF_DEBUG_OP_OUT_IDX_VAL: u64 = 0x0;
pub const BF_DEBUG_OP_DUMP_VM_IDX_VAL: u64 = 0x1;
pub const BF_DEBUG_OP_DUMP_VP_IDX_VAL: u64 = 0x2;
pub const BF_DEBUG_OP_DUMP_VS_IDX_VAL: u64 = 0x3;
pub const BF_DEBUG_OP_DUMP_VMEXIT_LOG_IDX_VAL: u64 = 0x4;
pub const BF_DEBUG_OP_WRITE_C_IDX_VAL: u64 = 0x5;
pub const BF_DEBUG_OP_WRITE_STR_IDX_VAL: u64 = 0x6;
pub const BF_DEBUG_OP_DUMP_EXT_IDX_VAL: u64 = 0x7;
pub const BF_DEBUG_OP_DUMP_PAGE_POOL_IDX_VAL: u64 = 0x8;
pub const BF_DEBUG_OP_DUMP_HUGE_POOL_IDX_VAL: u64 = 0x9;

pub const BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL: u64 = 0x0;
pub const BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL: u64 = 0x1;
pub const BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL: u64 = 0x2;

pub const BF_VM_OP_CREATE_VM_IDX_VAL: u64 = 0x0;
pub const BF_VM_OP_DESTROY_VM_IDX_VAL: u64 = 0x1;
pub const BF_VM_OP_MAP_DIRECT_IDX_VAL: u64 = 0x2;
pub const BF_VM_OP_UNMAP_DIRECT_IDX_VAL: u64 = 0x3;
pub const BF_VM_OP_UNMAP_DIRECT_BROADCAST_IDX_VAL: u64 = 0x4;

pub const BF_VP_OP_CREATE_VP_IDX_VAL: u64 = 0x0;
pub const BF_VP_OP_DESTROY_VP_IDX_VAL: u64 = 0x1;

pub const BF_VS_OP_CREATE_VS_IDX_VAL: u64 = 0x0;
pub const BF_VS_OP_DESTROY_VS_IDX_VAL: u64 = 0x1;
pub const BF_VS_OP_INIT_AS_ROOT_IDX_VAL: u64 = 0x2;
pub const BF_VS_OP_READ_IDX_VAL: u64 = 0x3;
pub const BF_VS_OP_WRITE_IDX_VAL: u64 = 0x4;
pub const BF_VS_OP_RUN_IDX_VAL: u64 = 0x5;
pub const BF_VS_OP_RUN_CURRENT_IDX_VAL: u64 = 0x6;
pub const BF_VS_OP_ADVANCE_IP_AND_RUN_IDX_VAL: u64 = 0x7;
pub const BF_VS_OP_ADVANCE_IP_AND_RUN_CURRENT_IDX_VAL: u64 = 0x8;
pub const BF_VS_OP_PROMOTE_IDX_VAL: u64 = 0x9;
pub const BF_VS_OP_CLEAR_IDX_VAL: u64 = 0xA;
pub const BF_VS_OP_MIGRATE_IDX_VAL: u64 = 0xB;
pub const BF_VS_OP_SET_ACTIVE_IDX_VAL: u64 = 0xC;
pub const BF_VS_OP_ADVANCE_IP_AND_SET_ACTIVE_IDX_VAL: u64 = 0xD;

pub const BF_INTRINSIC_OP_RDMSR_IDX_VAL: u64 = 0x0;
pub const BF_INTRINSIC_OP_WRMSR_IDX_VAL: u64 = 0x1;

pub const BF_MEM_OP_ALLOC_PAGE_IDX_VAL: u64 = 0x0;
pub const BF_MEM_OP_FREE_PAGE_IDX_VAL: u64 = 0x1;
pub const BF_MEM_OP_ALLOC_HUGE_IDX_VAL: u64 = 0x2;
pub const BF_MEM_OP_FREE_HUGE_IDX_VAL: u64 = 0x3;

/// Offsets of the extension-visible TLS block. An extension finds it through
/// its thread pointer.
pub const TLS_OFFSET_RAX: usize = 0x800;
pub const TLS_OFFSET_ACTIVE_EXTID: usize = 0xFF0;
pub const TLS_OFFSET_ACTIVE_VMID: usize = 0xFF2;
pub const TLS_OFFSET_ACTIVE_VPID: usize = 0xFF4;
pub const TLS_OFFSET_ACTIVE_VSID: usize = 0xFF6;
pub const TLS_OFFSET_ACTIVE_PPID: usize = 0xFF8;
pub const TLS_OFFSET_ONLINE_PPS: usize = 0xFFA;

/// Builds a handle for extension `extid` from its open counter.
pub const fn make_handle(extid: u16, nonce: u32) -> u64 {
    BF_HANDLE_SIG | (nonce as u64) << 16 | (extid as u64 + 1)
}

/// Status reported when input register `n` holds a bad value.
pub const fn invalid_input_reg(n: u8) -> BfStatus {
    match n {
        0 => BF_STATUS_INVALID_INPUT_REG0,
        1 => BF_STATUS_INVALID_INPUT_REG1,
        2 => BF_STATUS_INVALID_INPUT_REG2,
        3 => BF_STATUS_INVALID_INPUT_REG3,
        4 => BF_STATUS_INVALID_INPUT_REG4,
        _ => BF_STATUS_INVALID_INPUT_REG5,
    }
}
