//! The host runtime variant: target regions become host fallback functions
//! that fork their parallel regions through the host OpenMP runtime.

use crate::{
    codegen::CodeGenModule,
    config::{CodegenOptions, OffloadTarget},
    directive::{ExecutableDirective, ScheduleKind, TargetRegion},
    error::{ErrorKind, Result},
    ir::{Callee, CmpPred, FuncId, FunctionBuilder, FunctionKind, Linkage, Operand, Ty},
    lower::{ExecContext, RegionLowering, Scope},
    offload::offload_entry_name,
    outline::ContextLayout,
    schedule::DeviceCapabilities,
};

use super::{OpenMpRuntime, RuntimeFunction};

/// Host fallback code generation.
#[derive(Clone, Debug)]
pub struct HostRuntime {
    capabilities: DeviceCapabilities,
}

impl HostRuntime {
    #[must_use]
    /// Takes the device capabilities from `options`.
    pub fn new(options: &CodegenOptions) -> Self {
        Self {
            capabilities: options.capabilities().clone(),
        }
    }
}

fn emit_runtime_value(
    cgf: &mut FunctionBuilder,
    function: RuntimeFunction,
    args: Vec<Operand>,
) -> Result<Operand> {
    cgf.call_runtime(function, args)?.ok_or_else(|| {
        ErrorKind::InternalError(format!("{function} does not return a value")).into()
    })
}

fn emit_team_size(cgf: &mut FunctionBuilder, context: Operand, team_size: Operand) -> Result<()> {
    let slot = cgf.field_addr(context, Operand::i64(ContextLayout::TEAM_SIZE_SLOT))?;
    cgf.store(slot, team_size)
}

impl HostRuntime {
    fn emit_serialized_call(
        &self,
        cgf: &mut FunctionBuilder,
        outlined: FuncId,
        context: Operand,
    ) -> Result<()> {
        let gtid = self.compute_thread_id(cgf)?;
        cgf.call_runtime(RuntimeFunction::SerializedParallel, vec![gtid])?;

        emit_team_size(cgf, context, Operand::i64(1))?;
        let tid_slot = cgf.alloca(1)?;
        cgf.store(tid_slot, Operand::i64(0))?;
        cgf.call(
            Callee::Direct(outlined),
            vec![tid_slot, Operand::i32(0), context],
        )?;

        cgf.call_runtime(RuntimeFunction::EndSerializedParallel, vec![gtid])
            .map(drop)
    }

    fn emit_fork_call(cgf: &mut FunctionBuilder, outlined: FuncId, context: Operand) -> Result<()> {
        let team_size = emit_runtime_value(cgf, RuntimeFunction::MaxThreads, Vec::new())?;
        emit_team_size(cgf, context, team_size)?;

        tracing::debug!(function = cgf.name(), "emitted fork call");

        cgf.call_runtime(
            RuntimeFunction::ForkCall,
            vec![Operand::Function(outlined), context],
        )
        .map(drop)
    }
}

impl OpenMpRuntime for HostRuntime {
    type RegionState = ();

    fn target(&self) -> OffloadTarget {
        OffloadTarget::Host
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

        let function = cgm.module.declare_function(
            name.as_str(),
            FunctionKind::HostEntry,
            Linkage::External,
            vec![Ty::Ptr; region.vars.len()],
        )?;

        let mut cgf = FunctionBuilder::new(function, name.as_str());
        let mut scope = Scope::sequential(Operand::i64(0), Operand::i64(1));
        let addresses = (0..)
            .zip(&region.vars)
            .map(|(index, _)| Operand::Param(index))
            .collect::<Vec<_>>();

        RegionLowering::new(cgm, self, &mut (), region, &name).lower_target_body(
            &mut cgf,
            &mut scope,
            &addresses,
        )?;

        cgf.ret()?;
        cgm.module.define_function(function, cgf.finish()?)?;

        if is_offload_entry {
            self.create_offload_entry(cgm, &name, function)?;
        }

        tracing::debug!(function = %name, offload_entry = is_offload_entry, "emitted host fallback");

        Ok(function)
    }

    fn compute_thread_id(&self, cgf: &mut FunctionBuilder) -> Result<Operand> {
        emit_runtime_value(cgf, RuntimeFunction::GlobalThreadNum, Vec::new())
    }

    fn emit_team_num(&self, _cgf: &mut FunctionBuilder) -> Result<Operand> {
        Ok(Operand::i64(0))
    }

    fn emit_num_teams(&self, _cgf: &mut FunctionBuilder) -> Result<Operand> {
        Ok(Operand::i64(1))
    }

    fn emit_parallel_call(
        &self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        _state: &mut (),
        outlined: FuncId,
        context: Operand,
        if_cond: Option<Operand>,
    ) -> Result<()> {
        if scope.exec == ExecContext::Team {
            return self.emit_serialized_call(cgf, outlined, context);
        }

        let Some(condition) = if_cond else {
            return Self::emit_fork_call(cgf, outlined, context);
        };

        match condition.as_const() {
            Some(0) => self.emit_serialized_call(cgf, outlined, context),
            Some(_) => Self::emit_fork_call(cgf, outlined, context),
            None => {
                let then_block = cgf.new_block("omp_if.then");
                let else_block = cgf.new_block("omp_if.else");
                let end_block = cgf.new_block("omp_if.end");
                cgf.cond_br(condition, then_block, else_block)?;

                cgf.switch_to(then_block);
                Self::emit_fork_call(cgf, outlined, context)?;
                cgf.br(end_block)?;

                cgf.switch_to(else_block);
                self.emit_serialized_call(cgf, outlined, context)?;
                cgf.br(end_block)?;

                cgf.switch_to(end_block);
                Ok(())
            },
        }
    }

    /// Team barriers of serialized regions are skipped like on the device.
    fn emit_barrier(&self, cgf: &mut FunctionBuilder, scope: &Scope) -> Result<()> {
        if scope.exec == ExecContext::Sequential || scope.num_threads == Operand::i64(1) {
            return Ok(());
        }

        let sync = cgf.new_block("team.barrier");
        let cont = cgf.new_block("team.barrier.cont");

        let is_team = cgf.cmp(CmpPred::Sgt, scope.num_threads, Operand::i64(1))?;
        cgf.cond_br(is_team, sync, cont)?;

        cgf.switch_to(sync);
        let gtid = self.compute_thread_id(cgf)?;
        cgf.call_runtime(RuntimeFunction::Barrier, vec![gtid])?;
        cgf.br(cont)?;

        cgf.switch_to(cont);
        Ok(())
    }

    fn create_offload_entry(
        &self,
        cgm: &mut CodeGenModule,
        name: &str,
        function: FuncId,
    ) -> Result<()> {
        cgm.register_offload_entry(name, function)
    }

    fn generate_coalesced_schedule(
        &self,
        _kind: ScheduleKind,
        _chunk_size_is_one: bool,
        _ordered: bool,
    ) -> bool {
        false
    }

    fn requires_barrier(&self, directive: &ExecutableDirective) -> bool {
        self.capabilities.requires_barrier(directive)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::HostRuntime;
    use crate::{
        codegen::compile_with,
        config::{CodegenOptions, OffloadTarget},
        directive::{DirectiveKind, ExecutableDirective, Expr, Place, Stmt, TargetRegion, VarDecl, VarId},
        ir::{Callee, FunctionKind, Inst, RuntimeFunction},
    };

    fn compile(directive: ExecutableDirective) -> crate::codegen::CompiledModule {
        let options = CodegenOptions::new(OffloadTarget::Host);
        let region = TargetRegion {
            parent_name: String::from("main"),
            file: String::from("main.c"),
            line: 3,
            vars: vec![VarDecl {
                id: VarId(0),
                name: String::from("x"),
                len: 1,
            }],
            directive,
        };
        compile_with(&HostRuntime::new(&options), &options, &[region]).unwrap()
    }

    fn runtime_calls(compiled: &crate::codegen::CompiledModule) -> Vec<RuntimeFunction> {
        compiled
            .module
            .functions()
            .flat_map(|(_, function)| function.blocks())
            .flat_map(|block| &block.insts)
            .filter_map(|inst| match inst {
                Inst::Call {
                    callee: Callee::Runtime(function),
                    ..
                } => Some(*function),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn parallel_regions_are_forked() {
        let compiled = compile(
            ExecutableDirective::new(DirectiveKind::TargetParallel).with_body(vec![Stmt::Assign {
                place: Place::scalar(VarId(0)),
                value: Expr::ThreadNum,
            }]),
        );

        let calls = runtime_calls(&compiled);
        assert!(calls.contains(&RuntimeFunction::ForkCall));
        assert!(calls.contains(&RuntimeFunction::MaxThreads));
        assert!(!calls.contains(&RuntimeFunction::KernelInit));

        let entries = compiled
            .module
            .functions()
            .filter(|(_, function)| function.kind == FunctionKind::HostEntry)
            .count();
        assert_eq!(entries, 1);
        assert!(compiled.module.annotations().is_empty());
        assert_eq!(compiled.offload_entries.len(), 1);
    }

    #[test]
    fn nested_parallel_regions_are_serialized() {
        let inner = ExecutableDirective::new(DirectiveKind::Parallel).with_body(vec![Stmt::Assign {
            place: Place::scalar(VarId(0)),
            value: Expr::Int(1),
        }]);
        let compiled = compile(
            ExecutableDirective::new(DirectiveKind::TargetParallel)
                .with_body(vec![Stmt::Directive(Box::new(inner))]),
        );

        let calls = runtime_calls(&compiled);
        assert_eq!(
            calls
                .iter()
                .filter(|call| **call == RuntimeFunction::ForkCall)
                .count(),
            1
        );
        assert!(calls.contains(&RuntimeFunction::SerializedParallel));
        assert!(calls.contains(&RuntimeFunction::EndSerializedParallel));
    }
}
