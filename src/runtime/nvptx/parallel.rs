//! Parallel-call emission on the directing thread.

use crate::{
    device::{
        sync::BarrierLedger,
        thread::{emit_hardware_block_id, emit_worker_count},
    },
    error::Result,
    ir::{Callee, FuncId, FunctionBuilder, Operand},
    outline::ContextLayout,
};

use super::{dispatch::DispatchSlot, work::WorkRegistry};

/// Compile-time state of one target region on the NVPTX target.
#[derive(Debug)]
pub struct NvptxRegionState {
    /// Outlined functions published by the region.
    pub work: WorkRegistry,
    /// Wake and completion barriers emitted so far.
    pub ledger: BarrierLedger,
    /// The dispatch slot of the module.
    pub slot: DispatchSlot,
}

impl NvptxRegionState {
    /// Fresh state publishing through `slot`.
    #[must_use]
    pub fn new(slot: DispatchSlot) -> Self {
        Self {
            work: WorkRegistry::new(),
            ledger: BarrierLedger::new(),
            slot,
        }
    }
}

fn emit_invoke(
    cgf: &mut FunctionBuilder,
    outlined: FuncId,
    context: Operand,
    team_size: Operand,
    team_thread_id: Operand,
) -> Result<()> {
    let slot = cgf.field_addr(context, Operand::i64(ContextLayout::TEAM_SIZE_SLOT))?;
    cgf.store(slot, team_size)?;

    let tid_slot = cgf.alloca(1)?;
    cgf.store(tid_slot, team_thread_id)?;

    let block = emit_hardware_block_id(cgf)?;
    cgf.call(Callee::Direct(outlined), vec![tid_slot, block, context])
}

/// Runs `outlined` once on the encountering thread as a team of one.
///
/// Neither the dispatch slot nor any block barrier is touched, so the
/// workers stay parked in their wait.
pub fn emit_serial_call(cgf: &mut FunctionBuilder, outlined: FuncId, context: Operand) -> Result<()> {
    emit_invoke(cgf, outlined, context, Operand::i64(1), Operand::i64(0))
}

/// Publishes `outlined` to the workers and joins them as the last member
/// of a team of `workerCount() + 1`.
pub fn emit_team_call(
    cgf: &mut FunctionBuilder,
    state: &mut NvptxRegionState,
    outlined: FuncId,
    context: Operand,
) -> Result<()> {
    let index = state.work.register(outlined);

    let worker_count = emit_worker_count(cgf)?;
    let team_size = cgf.add(worker_count, Operand::i64(1))?;
    let slot = cgf.field_addr(context, Operand::i64(ContextLayout::TEAM_SIZE_SLOT))?;
    cgf.store(slot, team_size)?;

    state
        .slot
        .emit_publish(cgf, Operand::Function(outlined), context)?;
    let pending = state.ledger.wake(cgf)?;

    let tid_slot = cgf.alloca(1)?;
    cgf.store(tid_slot, worker_count)?;
    let block = emit_hardware_block_id(cgf)?;
    cgf.call(Callee::Direct(outlined), vec![tid_slot, block, context])?;

    state.ledger.complete(cgf, pending)?;

    tracing::debug!(kernel = cgf.name(), work = index, "emitted parallel call");

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{emit_serial_call, emit_team_call, NvptxRegionState};
    use crate::{
        ir::{BarrierKind, FuncId, FunctionBuilder, FunctionKind, Inst, Linkage, Module},
        runtime::nvptx::dispatch::DispatchSlot,
    };

    fn setup() -> (Module, FunctionBuilder, FuncId, NvptxRegionState) {
        let mut module = Module::new("m", "nvptx64-nvidia-cuda");
        let slot = DispatchSlot::get_or_create(&mut module).unwrap();
        let outlined = module
            .declare_function("k__omp_outlined__0", FunctionKind::Outlined, Linkage::Internal, Vec::new())
            .unwrap();
        let kernel = module
            .declare_function("k", FunctionKind::Kernel, Linkage::External, Vec::new())
            .unwrap();
        (module, FunctionBuilder::new(kernel, "k"), outlined, NvptxRegionState::new(slot))
    }

    fn block_barriers(mut cgf: FunctionBuilder) -> usize {
        cgf.ret().unwrap();
        cgf.finish()
            .unwrap()
            .blocks
            .iter()
            .flat_map(|block| &block.insts)
            .filter(|inst| matches!(inst, Inst::Barrier(BarrierKind::Block)))
            .count()
    }

    #[test]
    fn team_call_registers_and_pairs_its_barriers() {
        let (_module, mut cgf, outlined, mut state) = setup();
        let context = cgf.alloca(1).unwrap();

        emit_team_call(&mut cgf, &mut state, outlined, context).unwrap();
        emit_team_call(&mut cgf, &mut state, outlined, context).unwrap();

        assert_eq!(state.work.entries(), [outlined]);
        assert_eq!(state.ledger.wakes(), 2);
        state.ledger.check("k").unwrap();
        assert_eq!(block_barriers(cgf), 4);
    }

    #[test]
    fn serial_call_stays_off_the_dispatch_protocol() {
        let (_module, mut cgf, outlined, state) = setup();
        let context = cgf.alloca(1).unwrap();

        emit_serial_call(&mut cgf, outlined, context).unwrap();

        assert!(state.work.is_empty());
        assert_eq!(state.ledger.wakes(), 0);
        assert_eq!(block_barriers(cgf), 0);
    }
}
