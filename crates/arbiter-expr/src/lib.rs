//! # arbiter-expr
//!
//! The condition-expression language for ARBITER policies.
//!
//! Conditions are written in a small CEL-like language. The pipeline is:
//!
//! ```text
//! source → lexer → parser (AST) → program (opcodes) → vm (stack interpreter)
//!                           │
//!                           └────→ partial (planner residuals)
//! ```
//!
//! The opcode set is closed and documented in [`program::Opcode`]; the VM in
//! [`vm`] executes it deterministically over an [`vm::Environment`]. The
//! planner path in [`partial`] re-walks the retained AST instead of the
//! opcodes, folding everything that does not depend on unknown resource
//! attributes.

pub mod lexer;
pub mod parser;
pub mod partial;
pub mod program;
pub mod vm;

pub use parser::{parse, BinOp, Expr, UnaryOp};
pub use partial::{partial_eval, simplify, Partial, PartialEnvironment};
pub use program::{compile, compile_ast, CompileContext, Opcode, Program, RESERVED_NAMES};
pub use vm::{evaluate, evaluate_bool, Environment};
