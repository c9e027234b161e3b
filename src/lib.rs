//! Module-level obfuscation passes over a typed SSA intermediate
//! representation.
//!
//! Chakravyuha rewrites an IR [`Module`](ir::Module) in place. The host hands
//! one module at a time to an [`Obfuscator`](context::Obfuscator), which maps
//! literal pass names to the transformations:
//!
//! - `chakravyuha-string-encrypt` replaces constant string globals with
//!   ciphertext plus lazily-decrypting dispatch trampolines.
//! - `chakravyuha-control-flow-flatten` rebuilds function bodies as
//!   switch-dispatched state machines.
//! - `chakravyuha-fake-code-insertion` splices never-executed junk blocks
//!   behind opaque-false predicates.
//! - `chakravyuha-emit-report` serializes a JSON summary of the pipeline.
//! - `chakravyuha-all` runs the passes above in that order.
//!
//! Each pass consults the [`SafetyOracle`](safety::SafetyOracle) before
//! touching a function: inline assembly, `setjmp`/`longjmp`, and untracked
//! control flow disqualify a function, transitively over the call graph.
//! Failures inside a pass are contained at function granularity; a module is
//! never left half-rewritten.

#![warn(missing_docs)]

pub use cranelift_entity as entity;

pub mod cipher;
pub mod context;
pub mod cursor;
pub mod demote;
pub mod fake_code;
pub mod flatten;
pub mod flowgraph;
pub mod interp;
pub mod ir;
pub mod report;
pub mod result;
pub mod rng;
pub mod safety;
pub mod string_encrypt;
pub mod verifier;
pub mod write;

mod fx;

pub use crate::context::{
    Config, Obfuscator, PreservedAnalyses, ALL_PASSES, CONTROL_FLOW_FLATTEN_PASS,
    EMIT_REPORT_PASS, FAKE_CODE_INSERTION_PASS, STRING_ENCRYPT_PASS,
};
pub use crate::result::{ChakravyuhaError, ChakravyuhaResult};
