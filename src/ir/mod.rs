//! Hunter Intermediate Representation
//!
//! A small register-based IR the code generator targets. It exposes the
//! primitives a native backend needs: typed functions and linkage, basic
//! blocks, stack and heap storage, integer arithmetic, comparisons, branches,
//! calls (including the C library primitives) and aggregate layouts. The
//! textual dump produced by `print_module` is the compilation artifact
//! boundary; translating it into an object file is a separate concern.

// Note: instr must come before types to avoid circular deps
mod instr;
mod types;
mod builder;
mod lower;

// Re-export in logical order
pub use instr::*;
pub use types::*;
pub use builder::*;
pub use lower::*;
