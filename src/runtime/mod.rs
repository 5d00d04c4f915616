//! The OpenMP runtime code generator capability set and its two variants.
//!
//! A variant is selected once per compilation target; generated code never
//! dispatches between them.

use crate::{
    codegen::CodeGenModule,
    config::OffloadTarget,
    directive::{ExecutableDirective, ScheduleKind, TargetRegion},
    error::Result,
    ir::{FuncId, FunctionBuilder, Operand},
    lower::Scope,
    outline::{self, ContextLayout, OutlinedFunction},
};

mod functions;
pub mod host;
pub mod nvptx;

pub use functions::RuntimeFunction;

/// Everything region lowering asks of the OpenMP runtime of a target.
///
/// The provided methods are shared by both variants; the required ones
/// are where the host fork/join runtime and the device master/worker
/// protocol differ.
pub trait OpenMpRuntime: Sized {
    /// Compile-time state of one target region, created fresh for every
    /// region and discarded once it has been emitted.
    type RegionState;

    /// The target this runtime generates code for.
    fn target(&self) -> OffloadTarget;

    /// Emits the function executing a whole target region and, when
    /// `is_offload_entry`, registers it with the host offload table.
    fn emit_target_outlined_function(
        &self,
        cgm: &mut CodeGenModule,
        region: &TargetRegion,
        is_offload_entry: bool,
    ) -> Result<FuncId>;

    /// The flattened OpenMP global thread id of the executing thread.
    fn compute_thread_id(&self, cgf: &mut FunctionBuilder) -> Result<Operand>;

    /// `omp_get_team_num()` of the executing thread.
    fn emit_team_num(&self, cgf: &mut FunctionBuilder) -> Result<Operand>;

    /// `omp_get_num_teams()`.
    fn emit_num_teams(&self, cgf: &mut FunctionBuilder) -> Result<Operand>;

    /// Builds the captured context of a parallel call from the storage the
    /// encountering thread sees for every capture.
    fn emit_captured_vars(
        &self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        layout: &ContextLayout,
        bounds: Option<(Operand, Operand)>,
    ) -> Result<Operand> {
        let addresses = layout
            .captures()
            .iter()
            .map(|capture| scope.address(capture.var))
            .collect::<Result<Vec<_>>>()?;

        outline::emit_context(cgf, layout, bounds, &addresses)
    }

    /// Declares the function a parallel region of `parent` is outlined
    /// into.
    fn emit_outlined_function(
        &self,
        cgm: &mut CodeGenModule,
        parent: &str,
    ) -> Result<OutlinedFunction> {
        outline::declare_outlined_function(cgm, parent)
    }

    /// Runs `outlined` on the team of the parallel construct reached by the
    /// encountering thread, or serially on that thread when `if_cond` is
    /// false.
    fn emit_parallel_call(
        &self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        state: &mut Self::RegionState,
        outlined: FuncId,
        context: Operand,
        if_cond: Option<Operand>,
    ) -> Result<()>;

    /// `#pragma omp barrier` and the implicit barriers of worksharing loops.
    fn emit_barrier(&self, cgf: &mut FunctionBuilder, scope: &Scope) -> Result<()>;

    /// Registers `function` under `name` with the host offload table and
    /// marks it as an entry point of the target.
    fn create_offload_entry(
        &self,
        cgm: &mut CodeGenModule,
        name: &str,
        function: FuncId,
    ) -> Result<()>;

    /// Whether a loop with this schedule runs as one contiguous slice per
    /// thread.
    fn generate_coalesced_schedule(
        &self,
        kind: ScheduleKind,
        chunk_size_is_one: bool,
        ordered: bool,
    ) -> bool;

    /// Whether the end-of-construct barrier of `directive` must be kept
    /// even under `nowait`.
    fn requires_barrier(&self, directive: &ExecutableDirective) -> bool;
}
