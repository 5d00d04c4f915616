//! The NVPTX runtime variant: target regions run as kernels whose blocks
//! follow the master/worker protocol.

use crate::{
    codegen::CodeGenModule,
    config::{CodegenOptions, OffloadTarget},
    device::{
        sync::emit_team_barrier,
        thread::{
            emit_global_thread_id, emit_grid_block_count, emit_hardware_block_id,
            emit_hardware_thread_id, emit_team_thread_id, emit_worker_count,
        },
    },
    directive::{ExecutableDirective, ScheduleKind, TargetRegion},
    error::Result,
    ir::{Annotation, BinOp, CmpPred, FuncId, FunctionBuilder, FunctionKind, Linkage, Operand, Ty},
    lower::{ExecContext, RegionLowering, Scope},
    offload::offload_entry_name,
    schedule::{choose_static_coalesced, DeviceCapabilities},
};

use super::OpenMpRuntime;

pub mod dispatch;
pub mod entry;
pub mod parallel;
pub mod work;
pub mod worker;

use self::{
    dispatch::DispatchSlot,
    entry::{emit_entry_footer, emit_entry_header},
    parallel::{emit_serial_call, emit_team_call, NvptxRegionState},
    worker::{emit_worker_function, WorkerFunctionState},
};

/// Device code generation for NVPTX kernels.
#[derive(Clone, Debug)]
pub struct NvptxRuntime {
    barrier_id: u32,
    capabilities: DeviceCapabilities,
}

impl NvptxRuntime {
    /// Takes the barrier id and device capabilities from `options`.
    #[must_use]
    pub fn new(options: &CodegenOptions) -> Self {
        Self {
            barrier_id: options.parallel_barrier_id(),
            capabilities: options.capabilities().clone(),
        }
    }
}

impl OpenMpRuntime for NvptxRuntime {
    type RegionState = NvptxRegionState;

    fn target(&self) -> OffloadTarget {
        OffloadTarget::Nvptx64
    }

    fn emit_target_outlined_function(
        &self,
        cgm: &mut CodeGenModule,
        region: &TargetRegion,
        is_offload_entry: bool,
    ) -> Result<FuncId> {
        let name = offload_entry_name(
            cgm.options().device_id(),
            &region.file,
            &region.parent_name,
            region.line,
        );

        let kernel = cgm.module.declare_function(
            name.as_str(),
            FunctionKind::Kernel,
            Linkage::External,
            vec![Ty::Ptr; region.vars.len()],
        )?;
        let worker = WorkerFunctionState::new(cgm, &name)?;
        let mut state = NvptxRegionState::new(DispatchSlot::get_or_create(&mut cgm.module)?);

        let mut cgf = FunctionBuilder::new(kernel, name.as_str());
        let entry = emit_entry_header(&mut cgf, &worker)?;

        let team_num = emit_hardware_block_id(&mut cgf)?;
        let num_teams = emit_grid_block_count(&mut cgf)?;
        let mut scope = Scope::sequential(team_num, num_teams);
        let addresses = (0..)
            .zip(&region.vars)
            .map(|(index, _)| Operand::Param(index))
            .collect::<Vec<_>>();

        RegionLowering::new(cgm, self, &mut state, region, &name).lower_target_body(
            &mut cgf,
            &mut scope,
            &addresses,
        )?;

        emit_entry_footer(&mut cgf, entry, state.slot, &state.ledger)?;
        cgm.module.define_function(kernel, cgf.finish()?)?;

        state
            .work
            .verify_published(&cgm.module, kernel, state.slot)?;
        emit_worker_function(cgm, worker, &state.work, state.slot)?;

        if is_offload_entry {
            self.create_offload_entry(cgm, &name, kernel)?;
        }

        tracing::debug!(
            kernel = %name,
            work = state.work.len(),
            offload_entry = is_offload_entry,
            "emitted target region"
        );

        Ok(kernel)
    }

    /// `blockId * (workerCount() + 1) + teamThreadId`, where the directing
    /// thread and the idle lanes of its warp take `workerCount()`.
    fn compute_thread_id(&self, cgf: &mut FunctionBuilder) -> Result<Operand> {
        let tid = emit_hardware_thread_id(cgf)?;
        let worker_count = emit_worker_count(cgf)?;

        // a block of a single warp has no workers
        let divisor = cgf.binary(BinOp::SMax, worker_count, Operand::i64(1))?;
        let worker_tid = emit_team_thread_id(cgf, tid, divisor)?;
        let is_worker = cgf.cmp(CmpPred::Ult, tid, worker_count)?;
        let team_tid = cgf.select(is_worker, worker_tid, worker_count)?;

        let block = emit_hardware_block_id(cgf)?;
        let team_size = cgf.add(worker_count, Operand::i64(1))?;
        emit_global_thread_id(cgf, block, team_size, team_tid)
    }

    fn emit_team_num(&self, cgf: &mut FunctionBuilder) -> Result<Operand> {
        emit_hardware_block_id(cgf)
    }

    fn emit_num_teams(&self, cgf: &mut FunctionBuilder) -> Result<Operand> {
        emit_grid_block_count(cgf)
    }

    fn emit_parallel_call(
        &self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        state: &mut NvptxRegionState,
        outlined: FuncId,
        context: Operand,
        if_cond: Option<Operand>,
    ) -> Result<()> {
        // parallel regions nested in a team are serialized
        if scope.exec == ExecContext::Team {
            return emit_serial_call(cgf, outlined, context);
        }

        let Some(condition) = if_cond else {
            return emit_team_call(cgf, state, outlined, context);
        };

        match condition.as_const() {
            Some(0) => emit_serial_call(cgf, outlined, context),
            Some(_) => emit_team_call(cgf, state, outlined, context),
            None => {
                let then_block = cgf.new_block("omp_if.then");
                let else_block = cgf.new_block("omp_if.else");
                let end_block = cgf.new_block("omp_if.end");
                cgf.cond_br(condition, then_block, else_block)?;

                cgf.switch_to(then_block);
                emit_team_call(cgf, state, outlined, context)?;
                cgf.br(end_block)?;

                cgf.switch_to(else_block);
                emit_serial_call(cgf, outlined, context)?;
                cgf.br(end_block)?;

                cgf.switch_to(end_block);
                Ok(())
            },
        }
    }

    fn emit_barrier(&self, cgf: &mut FunctionBuilder, scope: &Scope) -> Result<()> {
        match scope.exec {
            ExecContext::Sequential => Ok(()),
            ExecContext::Team => emit_team_barrier(cgf, self.barrier_id, scope.num_threads),
        }
    }

    fn create_offload_entry(
        &self,
        cgm: &mut CodeGenModule,
        name: &str,
        function: FuncId,
    ) -> Result<()> {
        cgm.module.annotate(Annotation::Kernel(function));
        cgm.register_offload_entry(name, function)
    }

    fn generate_coalesced_schedule(
        &self,
        kind: ScheduleKind,
        chunk_size_is_one: bool,
        ordered: bool,
    ) -> bool {
        choose_static_coalesced(kind, chunk_size_is_one, ordered)
    }

    fn requires_barrier(&self, directive: &ExecutableDirective) -> bool {
        self.capabilities.requires_barrier(directive)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::NvptxRuntime;
    use crate::{
        codegen::compile_with,
        config::CodegenOptions,
        directive::{
            Clause, DirectiveKind, ExecutableDirective, Expr, LeafConstruct, Place, Stmt,
            TargetRegion, VarDecl, VarId,
        },
        ir::{Annotation, FunctionKind},
        offload::offload_entry_name,
    };

    fn region(directive: ExecutableDirective) -> TargetRegion {
        TargetRegion {
            parent_name: String::from("saxpy"),
            file: String::from("saxpy.c"),
            line: 12,
            vars: vec![VarDecl {
                id: VarId(0),
                name: String::from("x"),
                len: 1,
            }],
            directive,
        }
    }

    fn store_one() -> Vec<Stmt> {
        vec![Stmt::Assign {
            place: Place::scalar(VarId(0)),
            value: Expr::Int(1),
        }]
    }

    #[test]
    fn kernel_worker_and_outlined_function_are_emitted() {
        let options = CodegenOptions::default();
        let rt = NvptxRuntime::new(&options);
        let compiled = compile_with(
            &rt,
            &options,
            &[region(
                ExecutableDirective::new(DirectiveKind::TargetParallel).with_body(store_one()),
            )],
        )
        .unwrap();

        let name = offload_entry_name(0, "saxpy.c", "saxpy", 12);
        let kernel = compiled.kernel(&name).unwrap();
        assert!(kernel.offload_entry);

        let module = &compiled.module;
        let kinds = |kind: FunctionKind| module.functions().filter(|(_, f)| f.kind == kind).count();
        assert_eq!(kinds(FunctionKind::Kernel), 1);
        assert_eq!(kinds(FunctionKind::Worker), 1);
        assert_eq!(kinds(FunctionKind::Outlined), 1);

        assert!(module
            .function_by_name(&format!("{name}_worker"))
            .is_some());
        assert!(module
            .function_by_name(&format!("{name}__omp_outlined__0"))
            .is_some());
        assert_eq!(module.annotations(), [Annotation::Kernel(kernel.function)]);
        assert_eq!(compiled.offload_entries.len(), 1);
    }

    #[test]
    fn constant_false_target_if_is_not_registered() {
        let options = CodegenOptions::default();
        let rt = NvptxRuntime::new(&options);
        let directive = ExecutableDirective::new(DirectiveKind::Target)
            .with_clause(Clause::If {
                modifier: Some(LeafConstruct::Target),
                condition: Expr::Int(0),
            })
            .with_body(store_one());

        let compiled = compile_with(&rt, &options, &[region(directive)]).unwrap();

        assert!(!compiled.kernels[0].offload_entry);
        assert!(compiled.offload_entries.is_empty());
        assert!(compiled.module.annotations().is_empty());
    }

    #[test]
    fn duplicate_regions_are_internal_errors() {
        let options = CodegenOptions::default();
        let rt = NvptxRuntime::new(&options);
        let directive = ExecutableDirective::new(DirectiveKind::Target).with_body(store_one());

        let err = compile_with(&rt, &options, &[region(directive.clone()), region(directive)])
            .unwrap_err();
        assert!(err.is_internal());
    }
}
