//! Error types for the runtime-entry core.
//!
//! Errors raised inside a runtime entry unwind to the nearest managed
//! handler; they never travel through an entry's normal return path. The
//! variants here are the *payloads* of that unwind: dynamic type errors,
//! the preallocated stack overflow, propagated compilation failures, and
//! internal invariant violations.

use crate::ids::TokenPos;
use std::fmt;
use thiserror::Error;

/// The unified result type for fallible VM operations.
pub type VmResult<T> = Result<T, VmError>;

/// Errors produced by the runtime-entry core and its collaborators.
#[derive(Error, Debug, Clone)]
pub enum VmError {
    /// Dynamic type error: failed assignment check, non-bool condition,
    /// malformed/malbounded destination type, or a bound violation during
    /// allocation.
    #[error("{0}")]
    Type(TypeErrorInfo),

    /// The stack pointer crossed the saved stack limit.
    #[error("Stack Overflow")]
    StackOverflow,

    /// A compilation failure propagated out of an entry, unwrapped.
    #[error("compilation failed for '{function}': {message}")]
    Compile {
        /// Fully qualified name of the function that failed to compile.
        function: String,
        /// Compiler-reported message.
        message: String,
    },

    /// Internal invariant violation. Should never occur.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmError {
    /// Create a compile error.
    #[must_use]
    pub fn compile(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compile {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Payload of a dynamic type error.
///
/// Carries everything the embedder needs to format the message the way the
/// language mandates: source and destination type names, the name of the
/// variable being assigned, an optional bound-error message, and the token
/// position of the managed caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeErrorInfo {
    /// Token position of the managed frame that faulted into the runtime.
    pub location: TokenPos,
    /// User-visible name of the value's runtime type.
    pub src_type_name: String,
    /// User-visible name of the type being assigned to / tested against.
    pub dst_type_name: String,
    /// Name of the destination variable, or empty.
    pub dst_name: String,
    /// Message of the bound error that triggered this, if any.
    pub bound_error_message: Option<String>,
}

impl fmt::Display for TypeErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.bound_error_message {
            write!(f, "type error: {msg}")
        } else if self.dst_name.is_empty() {
            write!(
                f,
                "type '{}' is not a subtype of type '{}'",
                self.src_type_name, self.dst_type_name
            )
        } else {
            write!(
                f,
                "type '{}' is not a subtype of type '{}' of '{}'",
                self.src_type_name, self.dst_type_name, self.dst_name
            )
        }
    }
}

/// A type-bound violation produced while instantiating a type or a
/// type-argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundError {
    /// Human-readable description of the violated bound.
    pub message: String,
}

impl BoundError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for BoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Classification of a language error carried on a destination type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LanguageErrorKind {
    /// The type failed to resolve or finalize.
    MalformedType,
    /// The type's arguments violate the declared bounds.
    MalboundedType,
}

impl LanguageErrorKind {
    /// The user-visible stand-in name for the faulty type.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::MalformedType => "malformed",
            Self::MalboundedType => "malbounded",
        }
    }
}

/// A language error attached to a type that could not be used as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageError {
    /// Whether the type is malformed or malbounded.
    pub kind: LanguageErrorKind,
    /// Description produced when the type was finalized.
    pub message: String,
}

impl LanguageError {
    #[must_use]
    pub fn new(kind: LanguageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_error_display_with_name() {
        let info = TypeErrorInfo {
            location: TokenPos(3),
            src_type_name: "String".into(),
            dst_type_name: "int".into(),
            dst_name: "x".into(),
            bound_error_message: None,
        };
        assert_eq!(
            info.to_string(),
            "type 'String' is not a subtype of type 'int' of 'x'"
        );
    }

    #[test]
    fn test_type_error_display_without_name() {
        let info = TypeErrorInfo {
            location: TokenPos::NONE,
            src_type_name: "String".into(),
            dst_type_name: "int".into(),
            dst_name: String::new(),
            bound_error_message: None,
        };
        assert_eq!(info.to_string(), "type 'String' is not a subtype of type 'int'");
    }

    #[test]
    fn test_type_error_display_bound_message() {
        let info = TypeErrorInfo {
            location: TokenPos::NONE,
            src_type_name: String::new(),
            dst_type_name: String::new(),
            dst_name: String::new(),
            bound_error_message: Some("type 'String' does not extend bound 'num'".into()),
        };
        assert!(info.to_string().contains("does not extend bound"));
    }

    #[test]
    fn test_compile_error() {
        let err = VmError::compile("A.foo", "parse failure");
        assert_eq!(
            err.to_string(),
            "compilation failed for 'A.foo': parse failure"
        );
    }

    #[test]
    fn test_language_error_kind_names() {
        assert_eq!(LanguageErrorKind::MalformedType.type_name(), "malformed");
        assert_eq!(LanguageErrorKind::MalboundedType.type_name(), "malbounded");
    }

    #[test]
    fn test_stack_overflow_display() {
        assert_eq!(VmError::StackOverflow.to_string(), "Stack Overflow");
    }
}
