//! Barrier primitives and the bookkeeping that keeps the master/worker
//! handshake balanced.

use crate::{
    error::{ErrorKind, Result},
    ir::{BarrierKind, BinOp, CmpPred, FunctionBuilder, Operand},
};

use super::thread::emit_warp_size;

/// Full block rendezvous, `bar.sync 0`.
pub fn emit_block_barrier(cgf: &mut FunctionBuilder) -> Result<()> {
    cgf.barrier(BarrierKind::Block)
}

/// Rendezvous of `participants` threads, a multiple of the warp size, on
/// the named barrier `id`.
pub fn emit_numbered_barrier(cgf: &mut FunctionBuilder, id: u32, participants: Operand) -> Result<()> {
    cgf.barrier(BarrierKind::Numbered { id, participants })
}

/// `((n + warpSize - 1) / warpSize) * warpSize`
pub fn emit_round_up_to_warp(cgf: &mut FunctionBuilder, n: Operand) -> Result<Operand> {
    let warp_size = emit_warp_size(cgf)?;
    let last = cgf.sub(warp_size, Operand::i64(1))?;
    let padded = cgf.add(n, last)?;
    let warps = cgf.binary(BinOp::UDiv, padded, warp_size)?;
    cgf.mul(warps, warp_size)
}

/// Barrier among the members of a parallel team on the named barrier `id`.
///
/// A team of one is a serialized region: the barrier is skipped since the
/// other threads of the block never arrive.
pub fn emit_team_barrier(cgf: &mut FunctionBuilder, id: u32, team_size: Operand) -> Result<()> {
    if team_size == Operand::i64(1) {
        return Ok(());
    }

    let sync = cgf.new_block("team.barrier");
    let cont = cgf.new_block("team.barrier.cont");

    let is_team = cgf.cmp(CmpPred::Sgt, team_size, Operand::i64(1))?;
    cgf.cond_br(is_team, sync, cont)?;

    cgf.switch_to(sync);
    let participants = emit_round_up_to_warp(cgf, team_size)?;
    emit_numbered_barrier(cgf, id, participants)?;
    cgf.br(cont)?;

    cgf.switch_to(cont);
    Ok(())
}

/// Counts the wake and completion barriers of one target region.
#[derive(Debug, Default)]
pub struct BarrierLedger {
    wakes: usize,
    completions: usize,
}

/// Obligation to emit the completion barrier matching a wake barrier.
#[derive(Debug)]
#[must_use = "every wake barrier must be paired with a completion barrier"]
pub struct PendingCompletion {
    _private: (),
}

impl BarrierLedger {
    #[must_use]
    /// A ledger with no barriers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits the barrier that releases the workers into the published work.
    pub fn wake(&mut self, cgf: &mut FunctionBuilder) -> Result<PendingCompletion> {
        emit_block_barrier(cgf)?;
        self.wakes += 1;
        Ok(PendingCompletion { _private: () })
    }

    /// Emits the barrier at which the directing thread waits for the workers.
    pub fn complete(&mut self, cgf: &mut FunctionBuilder, pending: PendingCompletion) -> Result<()> {
        let PendingCompletion { _private: () } = pending;
        emit_block_barrier(cgf)?;
        self.completions += 1;
        Ok(())
    }

    /// Wake barriers emitted so far.
    #[must_use]
    pub const fn wakes(&self) -> usize {
        self.wakes
    }

    /// Fails with an internal error unless every wake has been completed.
    pub fn check(&self, function: &str) -> Result<()> {
        if self.wakes != self.completions {
            crate::bail!(ErrorKind::UnpairedBarrier {
                function: function.to_owned(),
                wakes: self.wakes,
                completions: self.completions,
            });
        }

        Ok(())
    }
}
