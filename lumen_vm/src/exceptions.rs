//! The exception bridge.
//!
//! Errors raised inside a runtime entry unwind to the nearest managed
//! handler; they never return through the entry's normal return path. The
//! unwind is modeled as the error arm of every entry's result: throw sites
//! build an `Unwind` and return it immediately, so control provably does
//! not continue past them.

use lumen_core::error::{TypeErrorInfo, VmError};
use lumen_core::ids::TokenPos;
use lumen_runtime::Value;

/// An in-flight unwind: either a managed exception or a VM error being
/// propagated to the embedder.
#[derive(Debug, Clone)]
pub enum Unwind {
    /// A managed exception object, with the stack trace when rethrowing.
    Exception {
        exception: Value,
        stacktrace: Option<Value>,
    },
    /// A VM-level error (type error, stack overflow, compile failure).
    Error(VmError),
}

impl Unwind {
    /// The VM error being propagated, if this is the error arm.
    #[must_use]
    pub fn error(&self) -> Option<&VmError> {
        match self {
            Unwind::Error(err) => Some(err),
            Unwind::Exception { .. } => None,
        }
    }

    /// The managed exception, if any.
    #[must_use]
    pub fn exception(&self) -> Option<&Value> {
        match self {
            Unwind::Exception { exception, .. } => Some(exception),
            Unwind::Error(_) => None,
        }
    }
}

/// Result type of every runtime entry.
pub type EntryResult = Result<(), Unwind>;

/// Throw a managed exception.
#[must_use]
pub fn throw(exception: Value) -> Unwind {
    Unwind::Exception {
        exception,
        stacktrace: None,
    }
}

/// Rethrow a managed exception with its captured stack trace.
#[must_use]
pub fn rethrow(exception: Value, stacktrace: Value) -> Unwind {
    Unwind::Exception {
        exception,
        stacktrace: Some(stacktrace),
    }
}

/// Propagate a collaborator error without wrapping.
#[must_use]
pub fn propagate_error(error: VmError) -> Unwind {
    Unwind::Error(error)
}

/// Build and raise a dynamic type error at the caller's token position.
#[must_use]
pub fn create_and_throw_type_error(
    location: TokenPos,
    src_type_name: String,
    dst_type_name: String,
    dst_name: String,
    bound_error_message: Option<String>,
) -> Unwind {
    Unwind::Error(VmError::Type(TypeErrorInfo {
        location,
        src_type_name,
        dst_type_name,
        dst_name,
        bound_error_message,
    }))
}
