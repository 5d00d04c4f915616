use crate::{
    directive::{ExecutableDirective, LeafConstruct, ReductionOp, VarId},
    error::Result,
    ir::{AtomicOp, CountedLoop, FunctionBuilder, Operand},
};

use super::Scope;

/// The leaf of a combined construct at which its reduction variables are
/// privatized: `parallel` if present, else `for`, else `distribute`, else
/// the first leaf after `target`.
#[must_use]
pub fn reduction_leaf(directive: &ExecutableDirective) -> Option<LeafConstruct> {
    let leaves = directive.kind.leaves();

    [
        LeafConstruct::Parallel,
        LeafConstruct::For,
        LeafConstruct::Distribute,
    ]
    .into_iter()
    .find(|leaf| leaves.contains(leaf))
    .or_else(|| {
        leaves
            .iter()
            .copied()
            .find(|leaf| *leaf != LeafConstruct::Target)
    })
}

pub(super) const fn atomic_op(op: ReductionOp) -> AtomicOp {
    match op {
        ReductionOp::Add => AtomicOp::Add,
        ReductionOp::Min => AtomicOp::SMin,
        ReductionOp::Max => AtomicOp::SMax,
    }
}

#[derive(Debug)]
struct PrivateCopy {
    op: ReductionOp,
    var: VarId,
    original: Operand,
    private: Operand,
    len: u32,
}

/// Reduction variables redirected to private storage, to be combined back
/// into their original storage.
#[derive(Debug)]
#[must_use = "private reduction copies must be combined"]
pub struct PrivateReductions {
    copies: Vec<PrivateCopy>,
}

/// Gives every reduction variable of `directive` private storage filled
/// with the identity of its operator, and rebinds it in `scope`.
pub fn privatize(
    cgf: &mut FunctionBuilder,
    scope: &mut Scope,
    directive: &ExecutableDirective,
    len_of: impl Fn(VarId) -> u32,
) -> Result<PrivateReductions> {
    let mut copies = Vec::new();

    for (op, var) in directive.reductions() {
        let original = scope.address(var)?;
        let len = len_of(var);
        let private = cgf.alloca(len)?;

        let (init, slot) = CountedLoop::begin(
            cgf,
            "red.init",
            Operand::i64(0),
            Operand::i64(i64::from(len)),
            Operand::i64(1),
        )?;
        let element = cgf.field_addr(private, slot)?;
        cgf.store(element, Operand::i64(op.identity()))?;
        init.end(cgf)?;

        scope.bind(var, private);
        copies.push(PrivateCopy {
            op,
            var,
            original,
            private,
            len,
        });
    }

    Ok(PrivateReductions { copies })
}

impl PrivateReductions {
    /// One atomic update of the original storage per slot, then the
    /// original bindings are restored.
    pub fn combine(self, cgf: &mut FunctionBuilder, scope: &mut Scope) -> Result<()> {
        for copy in self.copies {
            let (combine, slot) = CountedLoop::begin(
                cgf,
                "red.combine",
                Operand::i64(0),
                Operand::i64(i64::from(copy.len)),
                Operand::i64(1),
            )?;
            let element = cgf.field_addr(copy.private, slot)?;
            let partial = cgf.load(element)?;
            let target = cgf.field_addr(copy.original, slot)?;
            cgf.atomic_rmw(atomic_op(copy.op), target, partial)?;
            combine.end(cgf)?;

            scope.bind(copy.var, copy.original);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::reduction_leaf;
    use crate::directive::{DirectiveKind, ExecutableDirective, LeafConstruct};

    #[test]
    fn reductions_are_privatized_at_the_innermost_team() {
        for (kind, leaf) in [
            (DirectiveKind::TargetTeamsDistributeParallelForSimd, LeafConstruct::Parallel),
            (DirectiveKind::TargetTeamsDistribute, LeafConstruct::Distribute),
            (DirectiveKind::For, LeafConstruct::For),
            (DirectiveKind::TargetTeams, LeafConstruct::Teams),
            (DirectiveKind::Simd, LeafConstruct::Simd),
        ] {
            assert_eq!(reduction_leaf(&ExecutableDirective::new(kind)), Some(leaf), "{kind:?}");
        }
        assert_eq!(reduction_leaf(&ExecutableDirective::new(DirectiveKind::Target)), None);
    }
}
