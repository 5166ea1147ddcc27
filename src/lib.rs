//! lirasm - assembly support for a method-at-a-time compiler back end.
//!
//! Takes the instruction list produced by an instruction selector and turns
//! it into a compiled method: code image with its literal pools and tables,
//! the native PC mapping table, the native reference map and the vmap
//! table. Machine-code encoding is delegated to an [`InstructionEncoder`].

pub mod assemble;
pub mod codegen;
pub mod compiled;
pub mod config;
pub mod error;
pub mod leb128;
pub mod lir;
pub mod logging;
pub mod maps;
pub mod method;
pub mod patch;

// Re-export commonly used types
pub use assemble::{FixedWidthEncoder, InstructionEncoder};
pub use codegen::CodegenUnit;
pub use compiled::{CompiledMethod, FrameLayout};
pub use config::{AssemblerConfig, BranchOrigin, InstructionSet};
pub use error::{AssembleError, Result};
pub use maps::Diagnostic;
pub use patch::{CodePatch, CodePatchSink, MethodContext, MethodPatchSink, PatchRecorder};
