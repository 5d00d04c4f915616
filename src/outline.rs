//! The outlining engine: turns the body of a parallel region into a
//! standalone function `void fn(ptr tid, i32 bound_tid, ptr context)`.
//!
//! The captured context is an array of 64-bit slots:
//!
//! | slot            | contents                                      |
//! |-----------------|-----------------------------------------------|
//! | `0`             | team size of this invocation                  |
//! | `1`, `2`        | loop bounds, when an enclosing `distribute`   |
//! |                 | narrowed the iteration space                  |
//! | then, per var   | address of the captured variable              |

use crate::{
    codegen::CodeGenModule,
    directive::{CapturedVar, DataSharing, VarId},
    error::Result,
    ir::{CountedLoop, FuncId, FunctionBuilder, FunctionKind, Linkage, Operand, Ty},
};

/// `(ptr tid, i32 bound_tid, ptr context)`
pub const OUTLINED_PARAMS: [Ty; 3] = [Ty::Ptr, Ty::I32, Ty::Ptr];

/// Address of the caller's global thread id.
pub const TID_PARAM: Operand = Operand::Param(0);
/// Team-local thread id.
pub const BOUND_TID_PARAM: Operand = Operand::Param(1);
/// Address of the captured context.
pub const CONTEXT_PARAM: Operand = Operand::Param(2);

/// Slot assignment of a captured context, see the module docs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextLayout {
    captures: Vec<CapturedVar>,
    has_bounds: bool,
}

impl ContextLayout {
    /// Slot holding the size of the team running the invocation.
    pub const TEAM_SIZE_SLOT: i64 = 0;

    /// `has_bounds` reserves the two slots of narrowed loop bounds.
    #[must_use]
    pub const fn new(captures: Vec<CapturedVar>, has_bounds: bool) -> Self {
        Self {
            captures,
            has_bounds,
        }
    }

    #[must_use]
    /// Captured variables in slot order.
    pub fn captures(&self) -> &[CapturedVar] {
        &self.captures
    }

    /// Slots of the lower and upper loop bound.
    #[must_use]
    pub const fn bounds_slots(&self) -> Option<(i64, i64)> {
        if self.has_bounds {
            Some((1, 2))
        } else {
            None
        }
    }

    /// Slot of the `index`-th capture.
    #[must_use]
    #[expect(clippy::cast_possible_wrap)]
    pub const fn capture_slot(&self, index: usize) -> i64 {
        1 + if self.has_bounds { 2 } else { 0 } + index as i64
    }

    /// Size of the context.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn slots(&self) -> u32 {
        self.capture_slot(self.captures.len()) as u32
    }
}

/// An outlined function under construction.
#[derive(Debug)]
pub struct OutlinedFunction {
    /// The declared function.
    pub id: FuncId,
    /// Builder positioned in the entry block.
    pub cgf: FunctionBuilder,
}

/// Declares the next outlined function of `parent` and starts its body.
pub fn declare_outlined_function(cgm: &mut CodeGenModule, parent: &str) -> Result<OutlinedFunction> {
    let name = cgm.next_outlined_name(parent);
    let id = cgm.module.declare_function(
        name.as_str(),
        FunctionKind::Outlined,
        Linkage::Internal,
        OUTLINED_PARAMS.to_vec(),
    )?;

    tracing::debug!(function = %name, "outlined parallel region");

    Ok(OutlinedFunction {
        id,
        cgf: FunctionBuilder::new(id, name),
    })
}

/// Call-site half: fills every slot of a fresh context but the team size,
/// which is written by the parallel call once the path is known.
pub fn emit_context(
    cgf: &mut FunctionBuilder,
    layout: &ContextLayout,
    bounds: Option<(Operand, Operand)>,
    addresses: &[Operand],
) -> Result<Operand> {
    let context = cgf.alloca(layout.slots())?;

    if let (Some((lower_slot, upper_slot)), Some((lower, upper))) = (layout.bounds_slots(), bounds) {
        let slot = cgf.field_addr(context, Operand::i64(lower_slot))?;
        cgf.store(slot, lower)?;
        let slot = cgf.field_addr(context, Operand::i64(upper_slot))?;
        cgf.store(slot, upper)?;
    }

    for (index, address) in addresses.iter().enumerate() {
        let slot = cgf.field_addr(context, Operand::i64(layout.capture_slot(index)))?;
        cgf.store(slot, *address)?;
    }

    Ok(context)
}

/// Values an outlined function derives from its parameters.
#[derive(Clone, Debug)]
pub struct Prologue {
    /// `omp_get_thread_num()` inside the region.
    pub thread_num: Operand,
    /// `omp_get_num_threads()` inside the region.
    pub num_threads: Operand,
    /// Narrowed loop bounds, read from the context.
    pub bounds: Option<(Operand, Operand)>,
    /// The storage each captured variable is accessed through.
    pub vars: Vec<(VarId, Operand)>,
}

/// Callee half: reads the identity and bounds, then gives every capture
/// its storage according to its data-sharing attribute.
pub fn emit_prologue(
    cgf: &mut FunctionBuilder,
    layout: &ContextLayout,
    len_of: impl Fn(VarId) -> u32,
) -> Result<Prologue> {
    let thread_num = cgf.load(TID_PARAM)?;
    let num_threads = cgf.load(CONTEXT_PARAM)?;

    let bounds = match layout.bounds_slots() {
        Some((lower_slot, upper_slot)) => {
            let slot = cgf.field_addr(CONTEXT_PARAM, Operand::i64(lower_slot))?;
            let lower = cgf.load(slot)?;
            let slot = cgf.field_addr(CONTEXT_PARAM, Operand::i64(upper_slot))?;
            let upper = cgf.load(slot)?;
            Some((lower, upper))
        },
        None => None,
    };

    let mut vars = Vec::with_capacity(layout.captures().len());
    for (index, capture) in layout.captures().iter().enumerate() {
        let slot = cgf.field_addr(CONTEXT_PARAM, Operand::i64(layout.capture_slot(index)))?;
        let shared = cgf.load(slot)?;

        let storage = match capture.sharing {
            DataSharing::Shared => shared,
            DataSharing::Private => cgf.alloca(len_of(capture.var))?,
            DataSharing::FirstPrivate => {
                let len = len_of(capture.var);
                let private = cgf.alloca(len)?;

                let (copy, i) = CountedLoop::begin(
                    cgf,
                    "firstprivate",
                    Operand::i64(0),
                    Operand::i64(i64::from(len)),
                    Operand::i64(1),
                )?;
                let from = cgf.field_addr(shared, i)?;
                let value = cgf.load(from)?;
                let to = cgf.field_addr(private, i)?;
                cgf.store(to, value)?;
                copy.end(cgf)?;

                private
            },
        };

        vars.push((capture.var, storage));
    }

    Ok(Prologue {
        thread_num,
        num_threads,
        bounds,
        vars,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{emit_context, emit_prologue, ContextLayout};
    use crate::{
        directive::{CapturedVar, DataSharing, VarId},
        ir::{FuncId, FunctionBuilder, Inst, Operand},
    };

    fn layout(has_bounds: bool) -> ContextLayout {
        ContextLayout::new(
            vec![
                CapturedVar {
                    var: VarId(0),
                    sharing: DataSharing::Shared,
                },
                CapturedVar {
                    var: VarId(1),
                    sharing: DataSharing::FirstPrivate,
                },
            ],
            has_bounds,
        )
    }

    #[test]
    fn bounds_precede_the_captures() {
        assert_eq!(layout(false).slots(), 3);
        assert_eq!(layout(false).capture_slot(0), 1);
        assert_eq!(layout(true).bounds_slots(), Some((1, 2)));
        assert_eq!(layout(true).capture_slot(0), 3);
        assert_eq!(layout(true).slots(), 5);
    }

    #[test]
    fn context_is_sized_by_its_layout() {
        let mut cgf = FunctionBuilder::new(FuncId::from_index(0), "caller");
        let layout = layout(true);
        emit_context(
            &mut cgf,
            &layout,
            Some((Operand::i64(0), Operand::i64(8))),
            &[Operand::Param(0), Operand::Param(1)],
        )
        .unwrap();
        cgf.ret().unwrap();

        let body = cgf.finish().unwrap();
        let entry = &body.blocks[0];
        assert!(matches!(entry.insts[0], Inst::Alloca { slots: 5, .. }));
        let stores = entry
            .insts
            .iter()
            .filter(|inst| matches!(inst, Inst::Store { .. }))
            .count();
        assert_eq!(stores, 4);
    }

    #[test]
    fn firstprivate_captures_get_private_storage() {
        let mut cgf = FunctionBuilder::new(FuncId::from_index(0), "callee");
        let prologue = emit_prologue(&mut cgf, &layout(false), |_| 2).unwrap();
        cgf.ret().unwrap();

        assert_eq!(prologue.vars.len(), 2);
        assert!(prologue.bounds.is_none());
        // the shared capture is the loaded address, the firstprivate one a
        // fresh alloca
        assert_ne!(prologue.vars[0].1, prologue.vars[1].1);

        let body = cgf.finish().unwrap();
        let allocas = body
            .blocks
            .iter()
            .flat_map(|block| &block.insts)
            .filter(|inst| matches!(inst, Inst::Alloca { slots: 2, .. }))
            .count();
        assert_eq!(allocas, 1);
    }
}
