//! The registry of outlined functions the worker loop can dispatch to.

use crate::{
    error::{ErrorKind, Result},
    ir::{FuncId, Inst, Module, Operand},
};

use super::dispatch::DispatchSlot;

/// The outlined functions that may be published to the workers of one
/// target region, in discovery order.
///
/// Indices are stable once assigned and every function appears once.
#[derive(Debug, Default)]
pub struct WorkRegistry {
    entries: Vec<FuncId>,
}

impl WorkRegistry {
    #[must_use]
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `function`, registering it when first seen.
    pub fn register(&mut self, function: FuncId) -> usize {
        if let Some(index) = self.index_of(function) {
            return index;
        }
        self.entries.push(function);
        self.entries.len() - 1
    }

    /// Index of `function` if it is registered.
    #[must_use]
    pub fn index_of(&self, function: FuncId) -> Option<usize> {
        self.entries.iter().position(|entry| *entry == function)
    }

    /// Registered functions in index order.
    #[must_use]
    pub fn entries(&self) -> &[FuncId] {
        &self.entries
    }

    #[must_use]
    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that every function `kernel` publishes to `slot` is
    /// registered, so that the worker loop can dispatch to it.
    pub fn verify_published(&self, module: &Module, kernel: FuncId, slot: DispatchSlot) -> Result<()> {
        let Some(function) = module.function(kernel) else {
            crate::bail!(ErrorKind::InternalError(format!(
                "cannot verify unknown kernel #{}",
                kernel.index()
            )));
        };

        let published = function
            .blocks()
            .iter()
            .flat_map(|block| &block.insts)
            .filter_map(|inst| match inst {
                Inst::Store {
                    ptr: Operand::Global(global),
                    value,
                } if *global == slot.global() => Some(*value),
                _ => None,
            });

        for value in published {
            match value {
                Operand::Function(published) if self.index_of(published).is_some() => (),
                Operand::Function(published) => crate::bail!(ErrorKind::UnregisteredWork {
                    kernel: function.name.clone(),
                    function: module.function_name(published).to_owned(),
                }),
                other => crate::bail!(ErrorKind::MalformedIr {
                    function: function.name.clone(),
                    reason: format!("{other:?} published as work is not a function reference"),
                }),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::WorkRegistry;
    use crate::{
        error::ErrorKind,
        ir::{FuncId, FunctionBuilder, FunctionKind, Linkage, Module, Operand},
        runtime::nvptx::dispatch::DispatchSlot,
    };

    #[test]
    fn registration_is_deduplicated_in_discovery_order() {
        let mut work = WorkRegistry::new();
        let (a, b) = (FuncId::from_index(4), FuncId::from_index(2));

        assert_eq!(work.register(a), 0);
        assert_eq!(work.register(b), 1);
        assert_eq!(work.register(a), 0);
        assert_eq!(work.entries(), [a, b]);
    }

    #[test]
    fn unregistered_publication_is_an_internal_error() {
        let mut module = Module::new("m", "nvptx64-nvidia-cuda");
        let slot = DispatchSlot::get_or_create(&mut module).unwrap();
        let outlined = module
            .declare_function("k__omp_outlined__0", FunctionKind::Outlined, Linkage::Internal, Vec::new())
            .unwrap();
        let kernel = module
            .declare_function("k", FunctionKind::Kernel, Linkage::External, Vec::new())
            .unwrap();

        let mut cgf = FunctionBuilder::new(kernel, "k");
        slot.emit_publish(&mut cgf, Operand::Function(outlined), Operand::Null)
            .unwrap();
        cgf.ret().unwrap();
        module.define_function(kernel, cgf.finish().unwrap()).unwrap();

        let mut work = WorkRegistry::new();
        let err = work.verify_published(&module, kernel, slot).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnregisteredWork { .. }));

        work.register(outlined);
        work.verify_published(&module, kernel, slot).unwrap();
    }
}
