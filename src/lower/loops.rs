use crate::{
    directive::{ClauseKind, ExecutableDirective, Expr, LeafConstruct, ScheduleKind},
    error::{ErrorKind, Result},
    ir::{BinOp, CountedLoop, FunctionBuilder, Operand},
    runtime::OpenMpRuntime,
};

use super::{RegionLowering, Scope};

/// How a worksharing loop splits its iterations among the team.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopSchedule<'a> {
    /// One contiguous slice per participant.
    Coalesced,
    /// Round-robin chunks of the given size, one when absent.
    Chunked(Option<&'a Expr>),
}

/// Picks the schedule of a worksharing loop.
///
/// The runtime is consulted only when no chunk size or the literal chunk
/// size one is given; any other chunk size needs the chunked loop.
pub fn select_loop_schedule<'a, R: OpenMpRuntime>(
    rt: &R,
    directive: &'a ExecutableDirective,
) -> LoopSchedule<'a> {
    let (kind, chunk) = directive
        .schedule()
        .unwrap_or((ScheduleKind::Static, None));
    let ordered = directive.has_clause(ClauseKind::Ordered);

    match chunk {
        None | Some(Expr::Int(1)) => {
            let chunk_size_is_one = chunk.is_some();
            if rt.generate_coalesced_schedule(kind, chunk_size_is_one, ordered) {
                LoopSchedule::Coalesced
            } else {
                LoopSchedule::Chunked(chunk)
            }
        },
        Some(chunk) => LoopSchedule::Chunked(Some(chunk)),
    }
}

/// `(n + d - 1) / d`
fn emit_ceil_div(cgf: &mut FunctionBuilder, n: Operand, d: Operand) -> Result<Operand> {
    let last = cgf.sub(d, Operand::i64(1))?;
    let padded = cgf.add(n, last)?;
    cgf.binary(BinOp::SDiv, padded, d)
}

impl<R: OpenMpRuntime> RegionLowering<'_, R> {
    fn loop_range(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &Scope,
        directive: &ExecutableDirective,
        range: Option<(Operand, Operand)>,
    ) -> Result<(Operand, Operand)> {
        if let Some(range) = range {
            return Ok(range);
        }

        let Some(bounds) = &directive.bounds else {
            crate::bail!(ErrorKind::UnsupportedConstruct(format!(
                "a {:?} construct without an associated loop",
                directive.kind
            )));
        };

        let lower = self.lower_expr(cgf, scope, &bounds.lower)?;
        let upper = self.lower_expr(cgf, scope, &bounds.upper)?;
        Ok((lower, upper))
    }

    /// Lowers the iterations `[lower, upper)` assigned to this thread:
    /// either directly, or by handing them to the remaining leaves.
    fn lower_chunk(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &mut Scope,
        directive: &ExecutableDirective,
        rest: &[LeafConstruct],
        lower: Operand,
        upper: Operand,
    ) -> Result<()> {
        if !rest.iter().all(|leaf| *leaf == LeafConstruct::Simd) {
            return self.lower_leaves(cgf, scope, directive, rest, Some((lower, upper)));
        }

        let (lp, index) = CountedLoop::begin(cgf, "omp.inner", lower, upper, Operand::i64(1))?;
        let outer = scope.loop_index.replace(index);
        self.lower_stmts(cgf, scope, &directive.body)?;
        scope.loop_index = outer;
        lp.end(cgf)
    }

    /// Splits the iterations across the teams of the league in chunks of
    /// the `dist_schedule` size, `ceil(n / numTeams)` by default.
    pub(super) fn lower_distribute(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &mut Scope,
        directive: &ExecutableDirective,
        rest: &[LeafConstruct],
        range: Option<(Operand, Operand)>,
    ) -> Result<()> {
        let (lower, upper) = self.loop_range(cgf, scope, directive, range)?;

        let chunk = match directive.dist_schedule_chunk() {
            Some(chunk) => self.lower_expr(cgf, scope, chunk)?,
            None => {
                let trip_count = cgf.sub(upper, lower)?;
                emit_ceil_div(cgf, trip_count, scope.num_teams)?
            },
        };
        let chunk = cgf.binary(BinOp::SMax, chunk, Operand::i64(1))?;

        let offset = cgf.mul(scope.team_num, chunk)?;
        let first = cgf.add(lower, offset)?;
        let stride = cgf.mul(scope.num_teams, chunk)?;

        let (lp, chunk_lower) = CountedLoop::begin(cgf, "omp.distribute", first, upper, stride)?;
        let chunk_end = cgf.add(chunk_lower, chunk)?;
        let chunk_upper = cgf.binary(BinOp::SMin, chunk_end, upper)?;
        self.lower_chunk(cgf, scope, directive, rest, chunk_lower, chunk_upper)?;
        lp.end(cgf)
    }

    /// Splits the iterations among the members of the current team.
    pub(super) fn lower_for(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &mut Scope,
        directive: &ExecutableDirective,
        rest: &[LeafConstruct],
        range: Option<(Operand, Operand)>,
    ) -> Result<()> {
        let (lower, upper) = self.loop_range(cgf, scope, directive, range)?;
        let schedule = select_loop_schedule(self.rt, directive);

        tracing::debug!(?schedule, kind = ?directive.kind, "lowering worksharing loop");

        match schedule {
            LoopSchedule::Coalesced => {
                let trip_count = cgf.sub(upper, lower)?;
                let slice = emit_ceil_div(cgf, trip_count, scope.num_threads)?;

                let offset = cgf.mul(scope.thread_num, slice)?;
                let slice_lower = cgf.add(lower, offset)?;
                let slice_end = cgf.add(slice_lower, slice)?;
                let slice_upper = cgf.binary(BinOp::SMin, slice_end, upper)?;

                self.lower_chunk(cgf, scope, directive, rest, slice_lower, slice_upper)?;
            },
            LoopSchedule::Chunked(chunk) => {
                let chunk = match chunk {
                    Some(chunk) => {
                        let chunk = self.lower_expr(cgf, scope, chunk)?;
                        cgf.binary(BinOp::SMax, chunk, Operand::i64(1))?
                    },
                    None => Operand::i64(1),
                };

                let offset = cgf.mul(scope.thread_num, chunk)?;
                let first = cgf.add(lower, offset)?;
                let stride = cgf.mul(scope.num_threads, chunk)?;

                let (lp, chunk_lower) = CountedLoop::begin(cgf, "omp.chunk", first, upper, stride)?;
                let chunk_end = cgf.add(chunk_lower, chunk)?;
                let chunk_upper = cgf.binary(BinOp::SMin, chunk_end, upper)?;
                self.lower_chunk(cgf, scope, directive, rest, chunk_lower, chunk_upper)?;
                lp.end(cgf)?;
            },
        }

        if !directive.has_clause(ClauseKind::Nowait) || self.rt.requires_barrier(directive) {
            self.rt.emit_barrier(cgf, scope)?;
        }

        Ok(())
    }

    /// Every thread reaching a `simd` loop runs all of its iterations.
    pub(super) fn lower_simd(
        &mut self,
        cgf: &mut FunctionBuilder,
        scope: &mut Scope,
        directive: &ExecutableDirective,
        rest: &[LeafConstruct],
        range: Option<(Operand, Operand)>,
    ) -> Result<()> {
        let (lower, upper) = self.loop_range(cgf, scope, directive, range)?;
        self.lower_chunk(cgf, scope, directive, rest, lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::{select_loop_schedule, LoopSchedule};
    use crate::{
        config::CodegenOptions,
        directive::{Clause, DirectiveKind, ExecutableDirective, Expr, ScheduleKind},
        runtime::{host::HostRuntime, nvptx::NvptxRuntime},
    };

    fn scheduled(kind: ScheduleKind, chunk: Option<Expr>) -> ExecutableDirective {
        ExecutableDirective::new(DirectiveKind::ParallelFor)
            .with_clause(Clause::Schedule { kind, chunk })
    }

    #[test]
    fn nvptx_coalesces_plain_static_loops() {
        let rt = NvptxRuntime::new(&CodegenOptions::default());

        let plain = ExecutableDirective::new(DirectiveKind::ParallelFor);
        assert_eq!(select_loop_schedule(&rt, &plain), LoopSchedule::Coalesced);

        let one = scheduled(ScheduleKind::Static, Some(Expr::Int(1)));
        assert_eq!(
            select_loop_schedule(&rt, &one),
            LoopSchedule::Chunked(Some(&Expr::Int(1)))
        );

        let four = scheduled(ScheduleKind::Static, Some(Expr::Int(4)));
        assert_eq!(
            select_loop_schedule(&rt, &four),
            LoopSchedule::Chunked(Some(&Expr::Int(4)))
        );

        let dynamic = scheduled(ScheduleKind::Dynamic, None);
        assert_eq!(select_loop_schedule(&rt, &dynamic), LoopSchedule::Chunked(None));

        let ordered = ExecutableDirective::new(DirectiveKind::ParallelFor).with_clause(Clause::Ordered);
        assert_eq!(select_loop_schedule(&rt, &ordered), LoopSchedule::Chunked(None));
    }

    #[test]
    fn host_never_coalesces() {
        let rt = HostRuntime::new(&CodegenOptions::default());
        let plain = ExecutableDirective::new(DirectiveKind::ParallelFor);
        assert_eq!(select_loop_schedule(&rt, &plain), LoopSchedule::Chunked(None));
    }
}
