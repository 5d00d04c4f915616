#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use omp_nvptx::{
    codegen::CompiledModule,
    compile,
    directive::{ExecutableDirective, TargetRegion, VarDecl, VarId},
    CodegenOptions, OffloadTarget,
};
use omp_nvptx_sim::{LaunchConfig, Machine, Stats};

pub const FILE: &str = "kernels.c";
pub const PARENT: &str = "compute";

/// A region of `compute` mapping one variable of `len` slots per entry.
pub fn region(lens: &[u32], directive: ExecutableDirective) -> TargetRegion {
    TargetRegion {
        parent_name: String::from(PARENT),
        file: String::from(FILE),
        line: 1,
        vars: (0..)
            .zip(lens)
            .map(|(id, len)| VarDecl {
                id: VarId(id),
                name: format!("v{id}"),
                len: *len,
            })
            .collect(),
        directive,
    }
}

pub fn compile_for(target: OffloadTarget, region: &TargetRegion) -> CompiledModule {
    compile(&CodegenOptions::new(target), std::slice::from_ref(region)).unwrap()
}

/// Runs `region` and returns the final contents of its variables.
pub fn run(
    target: OffloadTarget,
    config: LaunchConfig,
    region: &TargetRegion,
) -> (Vec<Vec<i64>>, Stats, Vec<i64>) {
    let compiled = compile_for(target, region);
    let kernel = compiled.kernels.first().unwrap();

    let mut machine = Machine::new(&compiled.module, config).unwrap();
    let addresses = region
        .vars
        .iter()
        .map(|var| machine.alloc(var.len))
        .collect::<Vec<_>>();

    let stats = match target {
        OffloadTarget::Nvptx64 => machine.launch(&kernel.name, &addresses).unwrap(),
        OffloadTarget::Host => machine.run_host(&kernel.name, &addresses).unwrap(),
    };

    let values = region
        .vars
        .iter()
        .zip(&addresses)
        .map(|(var, address)| machine.read_slice(*address, var.len).unwrap())
        .collect();

    (values, stats, addresses)
}

pub fn device(grid: u32, block_threads: u32) -> LaunchConfig {
    LaunchConfig::new(grid, block_threads).unwrap()
}

/// Name of the kernel compiled for [`region`].
pub fn kernel_name() -> String {
    omp_nvptx::offload::offload_entry_name(0, FILE, PARENT, 1)
}

pub fn is_outlined(name: &str) -> bool {
    name.contains("__omp_outlined__")
}
