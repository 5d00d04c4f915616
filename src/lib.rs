//! Device code generation for OpenMP `target` regions on NVPTX.
//!
//! Every target region becomes a kernel whose thread blocks follow a
//! master/worker protocol: the last warp of a block directs the region and
//! publishes the outlined functions of its `parallel` constructs to the
//! remaining warps, which wait for work in a generic dispatch loop.
//!
//! ```
//! use omp_nvptx::{
//!     compile,
//!     directive::{DirectiveKind, ExecutableDirective, Expr, Place, Stmt, TargetRegion, VarDecl, VarId},
//!     CodegenOptions,
//! };
//!
//! let region = TargetRegion {
//!     parent_name: String::from("main"),
//!     file: String::from("main.c"),
//!     line: 7,
//!     vars: vec![VarDecl { id: VarId(0), name: String::from("x"), len: 1 }],
//!     directive: ExecutableDirective::new(DirectiveKind::TargetParallel).with_body(vec![
//!         Stmt::Assign { place: Place::scalar(VarId(0)), value: Expr::ThreadNum },
//!     ]),
//! };
//!
//! let compiled = compile(&CodegenOptions::default(), &[region])?;
//! assert_eq!(compiled.offload_entries.len(), 1);
//! # Ok::<(), omp_nvptx::Error>(())
//! ```

pub mod codegen;
pub mod config;
pub mod device;
pub mod directive;
pub mod error;
pub mod ir;
pub mod lower;
pub mod offload;
pub mod outline;
pub mod runtime;
pub mod schedule;

pub use codegen::{compile, CompiledModule};
pub use config::{CodegenOptions, OffloadTarget};
pub use error::{Error, ErrorKind, Result};
