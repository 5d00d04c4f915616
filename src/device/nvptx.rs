//! NVPTX hardware surface: the special registers and barrier intrinsics the
//! emitter calls into, with the signatures the instruction-selection backend
//! expects.

use std::fmt;

/// The triple of every device module.
pub const TARGET_TRIPLE: &str = "nvptx64-nvidia-cuda";

/// `bar.sync 0`, waits for every thread of the CTA.
pub const BLOCK_BARRIER_INTRINSIC: &str = "llvm.nvvm.barrier0";

/// `bar.sync id, count`, waits for `count` threads (a multiple of the warp
/// size) on the named barrier `id`.
pub const NUMBERED_BARRIER_INTRINSIC: &str = "llvm.nvvm.barrier";

/// PTX provides sixteen named barriers per CTA.
pub const NAMED_BARRIER_COUNT: u32 = 16;

/// Read-only per-thread hardware registers.
///
/// Only the `x` dimension is used: blocks and grids are launched
/// one-dimensional.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpecialRegister {
    /// `%tid.x`, the thread id within the block.
    ThreadIdX,
    /// `%ctaid.x`, the block id within the grid.
    BlockIdX,
    /// `%ntid.x`, threads per block.
    BlockDimX,
    /// `%nctaid.x`, blocks per grid.
    GridDimX,
    /// `WARP_SZ`
    WarpSize,
    /// `%laneid`
    LaneId,
}

impl SpecialRegister {
    /// The intrinsic that reads the register.
    #[must_use]
    pub const fn intrinsic(self) -> &'static str {
        match self {
            Self::ThreadIdX => "llvm.nvvm.read.ptx.sreg.tid.x",
            Self::BlockIdX => "llvm.nvvm.read.ptx.sreg.ctaid.x",
            Self::BlockDimX => "llvm.nvvm.read.ptx.sreg.ntid.x",
            Self::GridDimX => "llvm.nvvm.read.ptx.sreg.nctaid.x",
            Self::WarpSize => "llvm.nvvm.read.ptx.sreg.warpsize",
            Self::LaneId => "llvm.nvvm.read.ptx.sreg.laneid",
        }
    }
}

impl fmt::Display for SpecialRegister {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.intrinsic())
    }
}
