//! Execution error types

use thiserror::Error;

/// Exceptional conditions raised by the stack-guard dispatch path.
///
/// Neither variant is an internal fault: both are conditions the engine's
/// invocation machinery is expected to unwind with and surface to the
/// embedder.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionError {
    /// The thread's stack crossed its real limit (or the synthetic
    /// stack-check interrupt fired).
    #[error("RangeError: Maximum call stack size exceeded")]
    StackOverflow,

    /// Termination of the active computation was requested. The request
    /// stays pending until `cancel_terminate_execution` is called.
    #[error("execution terminated")]
    TerminationRequested,
}

/// Result alias for dispatch-path operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;
