//! The worker loop: the single generic dispatch loop run by every thread of
//! a block that does not direct the target region.

use crate::{
    codegen::CodeGenModule,
    device::{
        sync::emit_block_barrier,
        thread::{
            emit_hardware_block_id, emit_hardware_thread_id, emit_team_thread_id,
            emit_worker_count,
        },
    },
    error::{ErrorKind, Result},
    ir::{Callee, CmpPred, FuncId, FunctionBuilder, FunctionKind, Linkage, Module, Operand, Signature},
};

use super::{dispatch::DispatchSlot, work::WorkRegistry};

/// The worker function of one target region and its signature.
#[derive(Debug)]
pub struct WorkerFunctionState {
    /// The declared `{kernel}_worker` function.
    pub function: FuncId,
    /// Its signature, which takes no parameters.
    pub sig: Signature,
}

impl WorkerFunctionState {
    /// Declares `{kernel}_worker`.
    pub fn new(cgm: &mut CodeGenModule, kernel: &str) -> Result<Self> {
        let sig = Signature { params: Vec::new() };
        let function = cgm.module.declare_function(
            format!("{kernel}_worker"),
            FunctionKind::Worker,
            Linkage::Internal,
            sig.params.clone(),
        )?;

        Ok(Self { function, sig })
    }

    /// Recovers the state of an already declared worker function.
    pub fn from_declared(module: &Module, function: FuncId) -> Result<Self> {
        match module.function(function) {
            Some(declared) if declared.kind == FunctionKind::Worker => Ok(Self {
                function,
                sig: declared.sig.clone(),
            }),
            _ => Err(ErrorKind::InternalError(format!(
                "function #{} is not a worker function",
                function.index()
            ))
            .into()),
        }
    }
}

/// Emits the body of the worker function:
///
/// ```text
/// loop {
///     blockBarrier();
///     (function, context, terminate) = slot;
///     if terminate { return; }
///     if active { function(teamThreadId, blockId, context); }
///     blockBarrier();
/// }
/// ```
///
/// `function` is matched against the registered outlined functions and
/// called directly; an unregistered reference traps. Idle lanes of the
/// reserved warp are never active.
pub fn emit_worker_function(
    cgm: &mut CodeGenModule,
    state: WorkerFunctionState,
    work: &WorkRegistry,
    slot: DispatchSlot,
) -> Result<()> {
    let name = cgm.module.function_name(state.function).to_owned();
    let mut cgf = FunctionBuilder::new(state.function, name.as_str());

    let await_work = cgf.new_block(".await.work");
    let select_workers = cgf.new_block(".select.workers");
    let execute = cgf.new_block(".execute.parallel");
    let join = cgf.new_block(".terminate.parallel");
    let exit = cgf.new_block(".exit");

    let tid = emit_hardware_thread_id(&mut cgf)?;
    let worker_count = emit_worker_count(&mut cgf)?;
    let block = emit_hardware_block_id(&mut cgf)?;
    let tid_slot = cgf.alloca(1)?;
    let is_active = cgf.cmp(CmpPred::Ult, tid, worker_count)?;
    cgf.br(await_work)?;

    cgf.switch_to(await_work);
    emit_block_barrier(&mut cgf)?;
    let (function, context, terminate) = slot.emit_read(&mut cgf)?;
    let should_terminate = cgf.cmp(CmpPred::Ne, terminate, Operand::i64(0))?;
    cgf.cond_br(should_terminate, exit, select_workers)?;

    cgf.switch_to(select_workers);
    cgf.cond_br(is_active, execute, join)?;

    cgf.switch_to(execute);
    let team_tid = emit_team_thread_id(&mut cgf, tid, worker_count)?;
    cgf.store(tid_slot, team_tid)?;

    for (index, outlined) in work.entries().iter().enumerate() {
        let call = cgf.new_block(&format!(".execute.fn{index}"));
        let next = cgf.new_block(&format!(".check.next{index}"));

        let matches = cgf.cmp(CmpPred::Eq, function, Operand::Function(*outlined))?;
        cgf.cond_br(matches, call, next)?;

        cgf.switch_to(call);
        cgf.call(Callee::Direct(*outlined), vec![tid_slot, block, context])?;
        cgf.br(join)?;

        cgf.switch_to(next);
    }
    cgf.unreachable()?;

    cgf.switch_to(join);
    emit_block_barrier(&mut cgf)?;
    cgf.br(await_work)?;

    cgf.switch_to(exit);
    cgf.ret()?;

    tracing::debug!(worker = %name, work = work.len(), "emitted worker loop");

    cgm.module.define_function(state.function, cgf.finish()?)
}
