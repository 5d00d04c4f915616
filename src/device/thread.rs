//! OpenMP identities derived from the hardware ones.
//!
//! The last warp of every block is reserved: its first lane directs the
//! target region, the other lanes idle. Every thread below it is a worker.
//! [`BlockShape`] does the arithmetic on known launch shapes, the `emit_*`
//! functions produce the same values at run time.

use crate::{
    error::Result,
    ir::{BinOp, FunctionBuilder, Operand, SpecialRegister},
};

/// The role a hardware thread takes in the master/worker protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    /// Below the master thread id: runs the worker loop.
    Worker,
    /// The first lane of the reserved warp: runs the target region body.
    Directing,
    /// The remaining lanes of the reserved warp: cross barriers, never work.
    Idle,
}

/// The one-dimensional shape of a launched block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockShape {
    /// Threads per block.
    pub threads: u32,
    /// Threads per warp, a power of two.
    pub warp_size: u32,
}

impl BlockShape {
    #[must_use]
    /// A block of `threads` threads in warps of `warp_size`.
    pub const fn new(threads: u32, warp_size: u32) -> Self {
        Self { threads, warp_size }
    }

    /// First thread id of the last (possibly partial) warp.
    ///
    /// Assumes `warp_size` is a power of two.
    #[must_use]
    pub const fn master_thread_id(&self) -> u32 {
        (self.threads.saturating_sub(1)) & !(self.warp_size.wrapping_sub(1))
    }

    /// Threads running the worker loop, all of them below the master.
    #[must_use]
    pub const fn worker_count(&self) -> u32 {
        self.master_thread_id()
    }

    /// Number of participants of a parallel region that is not serialized.
    #[must_use]
    pub const fn team_size(&self) -> u32 {
        self.worker_count() + 1
    }

    /// The role of thread `tid`.
    #[must_use]
    pub const fn route(&self, tid: u32) -> Route {
        let master = self.master_thread_id();
        if tid < master {
            Route::Worker
        } else if tid == master {
            Route::Directing
        } else {
            Route::Idle
        }
    }

    /// Team-local OpenMP thread id, `None` for idle lanes.
    #[must_use]
    pub const fn team_thread_id(&self, tid: u32) -> Option<u32> {
        match self.route(tid) {
            Route::Worker => Some(tid % self.worker_count()),
            Route::Directing => Some(self.worker_count()),
            Route::Idle => None,
        }
    }

    /// Flattened OpenMP thread id across all teams of the grid.
    #[must_use]
    pub const fn global_thread_id(&self, block: u32, tid: u32) -> Option<u64> {
        match self.team_thread_id(tid) {
            Some(team_tid) => Some(block as u64 * self.team_size() as u64 + team_tid as u64),
            None => None,
        }
    }
}

/// `%tid.x`
pub fn emit_hardware_thread_id(cgf: &mut FunctionBuilder) -> Result<Operand> {
    cgf.read_special(SpecialRegister::ThreadIdX)
}

/// `%ctaid.x`
pub fn emit_hardware_block_id(cgf: &mut FunctionBuilder) -> Result<Operand> {
    cgf.read_special(SpecialRegister::BlockIdX)
}

/// `WARP_SZ`
pub fn emit_warp_size(cgf: &mut FunctionBuilder) -> Result<Operand> {
    cgf.read_special(SpecialRegister::WarpSize)
}

/// `%ntid.x`
pub fn emit_block_thread_count(cgf: &mut FunctionBuilder) -> Result<Operand> {
    cgf.read_special(SpecialRegister::BlockDimX)
}

/// `%nctaid.x`, the number of teams.
pub fn emit_grid_block_count(cgf: &mut FunctionBuilder) -> Result<Operand> {
    cgf.read_special(SpecialRegister::GridDimX)
}

/// `(blockThreadCount - 1) & ~(warpSize - 1)`
pub fn emit_master_thread_id(cgf: &mut FunctionBuilder) -> Result<Operand> {
    let threads = emit_block_thread_count(cgf)?;
    let warp_size = emit_warp_size(cgf)?;

    let last = cgf.sub(threads, Operand::i64(1))?;
    let mask = cgf.sub(Operand::i64(0), warp_size)?;
    cgf.binary(BinOp::And, last, mask)
}

/// Every thread below the master is a worker.
pub fn emit_worker_count(cgf: &mut FunctionBuilder) -> Result<Operand> {
    emit_master_thread_id(cgf)
}

/// Team-local id of a worker thread.
///
/// Only valid for `tid < worker_count`, where it is the identity.
// TODO: replace the `urem` by a mask when the worker count is known to be a
//       power of two at compile time
pub fn emit_team_thread_id(
    cgf: &mut FunctionBuilder,
    tid: Operand,
    worker_count: Operand,
) -> Result<Operand> {
    cgf.binary(BinOp::URem, tid, worker_count)
}

/// `blockId * teamSize + teamThreadId`
pub fn emit_global_thread_id(
    cgf: &mut FunctionBuilder,
    block: Operand,
    team_size: Operand,
    team_thread_id: Operand,
) -> Result<Operand> {
    let base = cgf.mul(block, team_size)?;
    cgf.add(base, team_thread_id)
}

#[cfg(test)]
mod tests {
    use super::{BlockShape, Route};

    #[test]
    fn master_is_first_lane_of_last_warp() {
        for (threads, master) in [(1, 0), (32, 0), (33, 32), (64, 32), (96, 64), (1024, 992)] {
            assert_eq!(BlockShape::new(threads, 32).master_thread_id(), master, "{threads}");
        }
        assert_eq!(BlockShape::new(128, 64).master_thread_id(), 64);
    }

    #[test]
    fn multiples_of_the_warp_reserve_exactly_one_warp() {
        for warps in 1..=32 {
            let shape = BlockShape::new(warps * 32, 32);
            assert_eq!(shape.master_thread_id(), shape.threads - 32);
            assert_eq!(shape.worker_count(), shape.master_thread_id());
        }
    }

    #[test]
    fn routes_cover_the_block_without_overlap() {
        for threads in 1..=130 {
            let shape = BlockShape::new(threads, 32);
            let directing = (0..threads)
                .filter(|tid| shape.route(*tid) == Route::Directing)
                .count();
            assert_eq!(directing, 1);

            for tid in 0..threads {
                let is_worker = tid < shape.worker_count();
                assert_eq!(shape.route(tid) == Route::Worker, is_worker);
            }
        }
    }

    #[test]
    fn team_ids_are_distinct() {
        let shape = BlockShape::new(64, 32);
        let mut ids: Vec<_> = (0..64).filter_map(|tid| shape.team_thread_id(tid)).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..33).collect::<Vec<_>>());

        assert_eq!(shape.global_thread_id(2, 0), Some(66));
        assert_eq!(shape.global_thread_id(2, 32), Some(98));
        assert_eq!(shape.global_thread_id(2, 40), None);
    }
}
