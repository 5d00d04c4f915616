//! Module-level driver: compiles the target regions of a translation unit
//! with the runtime variant of the configured offload target.

use std::collections::HashMap;

use crate::{
    config::{CodegenOptions, OffloadTarget},
    directive::{Expr, LeafConstruct, TargetRegion, VarDecl},
    error::{Result, ResultExt},
    ir::{verify_module, FuncId, Module},
    offload::OffloadEntryRegistry,
    runtime::{host::HostRuntime, nvptx::NvptxRuntime, OpenMpRuntime},
};

/// State shared by every target region of one module.
#[derive(Debug)]
pub struct CodeGenModule {
    /// The module being emitted.
    pub module: Module,
    options: CodegenOptions,
    offload: OffloadEntryRegistry,
    outlined_counters: HashMap<String, u32>,
}

impl CodeGenModule {
    /// An empty module for the target of `options`.
    #[must_use]
    pub fn new(options: CodegenOptions) -> Self {
        let target = options.target();
        Self {
            module: Module::new(format!("omp_offload.{target}"), target.triple()),
            options,
            offload: OffloadEntryRegistry::new(),
            outlined_counters: HashMap::new(),
        }
    }

    #[must_use]
    /// Options of the compilation.
    pub const fn options(&self) -> &CodegenOptions {
        &self.options
    }

    /// `{parent}__omp_outlined__{n}`, numbered per parent from zero.
    pub fn next_outlined_name(&mut self, parent: &str) -> String {
        let counter = self.outlined_counters.entry(parent.to_owned()).or_insert(0);
        let name = format!("{parent}__omp_outlined__{counter}");
        *counter += 1;
        name
    }

    /// Functions are registered with a size of zero.
    pub fn register_offload_entry(&mut self, name: &str, function: FuncId) -> Result<()> {
        self.offload
            .register_entry(&mut self.module, name, function, 0)
    }

    /// Entries registered so far.
    #[must_use]
    pub const fn offload_entries(&self) -> &OffloadEntryRegistry {
        &self.offload
    }
}

/// The function compiled for one target region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelInfo {
    /// The offload entry name, also the symbol of the function.
    pub name: String,
    /// The kernel, or the host fallback function.
    pub function: FuncId,
    /// Function containing the region.
    pub parent_name: String,
    /// Line of the `target` pragma.
    pub line: u32,
    /// The kernel parameters: one address per mapped variable.
    pub vars: Vec<VarDecl>,
    /// False for regions that can only run on the host, which get no
    /// offload entry.
    pub offload_entry: bool,
}

/// The result of a compilation.
#[derive(Debug)]
pub struct CompiledModule {
    /// The verified module.
    pub module: Module,
    /// The offload entry table of the module.
    pub offload_entries: OffloadEntryRegistry,
    /// One kernel per target region, in input order.
    pub kernels: Vec<KernelInfo>,
}

impl CompiledModule {
    /// Looks up a kernel by entry name.
    #[must_use]
    pub fn kernel(&self, name: &str) -> Option<&KernelInfo> {
        self.kernels.iter().find(|kernel| kernel.name == name)
    }
}

/// Compiles `regions` for the target selected by `options`.
pub fn compile(options: &CodegenOptions, regions: &[TargetRegion]) -> Result<CompiledModule> {
    match options.target() {
        OffloadTarget::Nvptx64 => compile_with(&NvptxRuntime::new(options), options, regions),
        OffloadTarget::Host => compile_with(&HostRuntime::new(options), options, regions),
    }
}

/// Compiles `regions` with an explicit runtime, whose target overrides
/// the one in `options`.
pub fn compile_with<R: OpenMpRuntime>(
    rt: &R,
    options: &CodegenOptions,
    regions: &[TargetRegion],
) -> Result<CompiledModule> {
    let mut cgm = CodeGenModule::new(options.clone().set_target(rt.target()));
    let mut kernels = Vec::with_capacity(regions.len());

    for region in regions {
        // `if(target: 0)` regions only ever run on the host
        let is_offload_entry = !matches!(
            region.directive.if_condition(LeafConstruct::Target),
            Some(Expr::Int(0))
        );

        let function = rt
            .emit_target_outlined_function(&mut cgm, region, is_offload_entry)
            .with_context(|| {
                format!(
                    "emitting the target region of '{}' at {}:{}",
                    region.parent_name, region.file, region.line
                )
            })?;

        kernels.push(KernelInfo {
            name: cgm.module.function_name(function).to_owned(),
            function,
            parent_name: region.parent_name.clone(),
            line: region.line,
            vars: region.vars.clone(),
            offload_entry: is_offload_entry,
        });
    }

    verify_module(&cgm.module).context("verifying the emitted module")?;

    Ok(CompiledModule {
        module: cgm.module,
        offload_entries: cgm.offload,
        kernels,
    })
}

#[cfg(test)]
mod tests {
    use super::CodeGenModule;
    use crate::config::CodegenOptions;

    #[test]
    fn outlined_names_are_numbered_per_parent() {
        let mut cgm = CodeGenModule::new(CodegenOptions::default());
        assert_eq!(cgm.next_outlined_name("k"), "k__omp_outlined__0");
        assert_eq!(cgm.next_outlined_name("k"), "k__omp_outlined__1");
        assert_eq!(cgm.next_outlined_name("j"), "j__omp_outlined__0");
    }
}
