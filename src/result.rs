//! Result and error types for the pass suite.
//!
//! Per-function skips are not errors; they are counted by the report
//! aggregator and the function is left untouched. The variants here cover
//! the conditions that must surface to the host instead.

use thiserror::Error;

use crate::verifier::VerifierErrors;

/// An error that terminates processing of the current module.
#[derive(Error, Debug)]
pub enum ChakravyuhaError {
    /// The input module is ill-formed and cannot be transformed.
    #[error("malformed module: {0}")]
    MalformedModule(String),

    /// The verifier rejected a function.
    #[error("verifier errors")]
    Verifier(#[from] VerifierErrors),

    /// An implementation limit was exceeded (e.g. block-id space).
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(&'static str),

    /// The host asked for a pass name this suite does not provide.
    #[error("unknown pass name: {0}")]
    UnknownPass(String),
}

/// A convenient alias for a `Result` that uses `ChakravyuhaError`.
pub type ChakravyuhaResult<T> = Result<T, ChakravyuhaError>;
