//! The kernel entry state machine:
//! `Start → Dispatch → {MasterPath, WorkerPath} → Join → Terminated`.

use crate::{
    device::{
        sync::{emit_block_barrier, BarrierLedger},
        thread::{emit_hardware_thread_id, emit_master_thread_id},
    },
    error::Result,
    ir::{BlockId, Callee, CmpPred, FunctionBuilder, RuntimeFunction},
};

use super::{dispatch::DispatchSlot, worker::WorkerFunctionState};

/// Threads the exit block of a kernel from its header to its footer.
#[derive(Debug)]
#[must_use = "the entry footer must be emitted"]
pub struct EntryFunctionState {
    exit: BlockId,
}

/// Routes threads below the master thread id into the worker loop and
/// leaves the builder on the directing thread's path.
///
/// The other lanes of the reserved warp run the worker loop too, where
/// they only ever cross barriers.
pub fn emit_entry_header(
    cgf: &mut FunctionBuilder,
    worker: &WorkerFunctionState,
) -> Result<EntryFunctionState> {
    let worker_block = cgf.new_block(".worker");
    let master_check = cgf.new_block(".mastercheck");
    let master_block = cgf.new_block(".master");
    let exit = cgf.new_block(".exit");

    let tid = emit_hardware_thread_id(cgf)?;
    let master_tid = emit_master_thread_id(cgf)?;
    let is_worker = cgf.cmp(CmpPred::Ult, tid, master_tid)?;
    cgf.cond_br(is_worker, worker_block, master_check)?;

    cgf.switch_to(worker_block);
    cgf.call(Callee::Direct(worker.function), Vec::new())?;
    cgf.br(exit)?;

    cgf.switch_to(master_check);
    let is_master = cgf.cmp(CmpPred::Eq, tid, master_tid)?;
    cgf.cond_br(is_master, master_block, worker_block)?;

    cgf.switch_to(exit);
    cgf.ret()?;

    cgf.switch_to(master_block);
    // the master thread id is also the number of workers
    cgf.call_runtime(RuntimeFunction::KernelInit, vec![master_tid])?;

    Ok(EntryFunctionState { exit })
}

/// Releases the workers waiting for their next work item into
/// termination and joins the exit block.
///
/// Fails if a wake barrier of the region was left without its completion.
pub fn emit_entry_footer(
    cgf: &mut FunctionBuilder,
    state: EntryFunctionState,
    slot: DispatchSlot,
    ledger: &BarrierLedger,
) -> Result<()> {
    ledger.check(cgf.name())?;

    cgf.call_runtime(RuntimeFunction::KernelDeinit, Vec::new())?;
    slot.emit_terminate(cgf)?;
    emit_block_barrier(cgf)?;
    cgf.br(state.exit)
}
