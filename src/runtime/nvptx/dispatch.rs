//! The block-shared slot through which the master publishes work.

use crate::{
    error::{ErrorKind, Result},
    ir::{AddressSpace, FunctionBuilder, Global, GlobalId, Linkage, Module, Operand},
};

/// Name of the block-shared dispatch slot global.
pub const DISPATCH_SLOT_SYMBOL: &str = "__omp_nvptx_work";

/// The block-shared slot through which the directing thread publishes work.
///
/// It is written only by the directing thread and read only by workers,
/// with the wake and completion barriers ordering every access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchSlot {
    global: GlobalId,
}

impl DispatchSlot {
    /// Slot of the published outlined function.
    pub const FUNCTION: i64 = 0;
    /// Slot of the captured context passed to it.
    pub const CONTEXT: i64 = 1;
    /// Slot of the flag that sends the workers home.
    pub const TERMINATE: i64 = 2;

    /// The slot of `module`, created on first use and shared by every
    /// target region of the module.
    pub fn get_or_create(module: &mut Module) -> Result<Self> {
        if let Some(global) = module.global_by_name(DISPATCH_SLOT_SYMBOL) {
            let is_shared = module
                .global(global)
                .is_some_and(|global| global.space == AddressSpace::Shared && global.slots == 3);
            if !is_shared {
                crate::bail!(ErrorKind::InternalError(format!(
                    "'{DISPATCH_SLOT_SYMBOL}' exists but is not a block-shared dispatch slot"
                )));
            }
            return Ok(Self { global });
        }

        let global = module.add_global(Global {
            name: String::from(DISPATCH_SLOT_SYMBOL),
            space: AddressSpace::Shared,
            linkage: Linkage::Internal,
            slots: 3,
            init: Vec::new(),
            section: None,
        })?;

        Ok(Self { global })
    }

    #[must_use]
    /// The backing global, three slots wide.
    pub const fn global(&self) -> GlobalId {
        self.global
    }

    fn field(self, cgf: &mut FunctionBuilder, slot: i64) -> Result<Operand> {
        cgf.field_addr(Operand::Global(self.global), Operand::i64(slot))
    }

    /// Publishes `function` with its `context` and clears the termination
    /// flag.
    pub fn emit_publish(
        self,
        cgf: &mut FunctionBuilder,
        function: Operand,
        context: Operand,
    ) -> Result<()> {
        let field = self.field(cgf, Self::FUNCTION)?;
        cgf.store(field, function)?;
        let field = self.field(cgf, Self::CONTEXT)?;
        cgf.store(field, context)?;
        let field = self.field(cgf, Self::TERMINATE)?;
        cgf.store(field, Operand::i64(0))
    }

    /// Raises the termination flag, read after the final wake.
    pub fn emit_terminate(self, cgf: &mut FunctionBuilder) -> Result<()> {
        let field = self.field(cgf, Self::TERMINATE)?;
        cgf.store(field, Operand::i64(1))
    }

    /// Reads `(function, context, terminate)`.
    pub fn emit_read(self, cgf: &mut FunctionBuilder) -> Result<(Operand, Operand, Operand)> {
        let field = self.field(cgf, Self::FUNCTION)?;
        let function = cgf.load(field)?;
        let field = self.field(cgf, Self::CONTEXT)?;
        let context = cgf.load(field)?;
        let field = self.field(cgf, Self::TERMINATE)?;
        let terminate = cgf.load(field)?;
        Ok((function, context, terminate))
    }
}
