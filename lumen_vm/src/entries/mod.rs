//! Runtime entries: the operations generated code calls back into.
//!
//! Every entry has the same shape: it runs on the faulting mutator thread,
//! reads its declared arguments positionally from a `NativeArguments`,
//! may allocate, compile, or throw, and writes at most one return value.
//! An unwind (managed exception or propagated error) is the `Err` arm of
//! the entry's result and never flows through the normal return path.

pub mod allocation;
pub mod fields;
pub mod ic_miss;
pub mod optimize;
pub mod patching;
pub mod typecheck;

use crate::isolate::Isolate;
use lumen_core::ids::TokenPos;

/// Token position of the managed caller, for error attribution.
#[must_use]
pub(crate) fn caller_token_pos(isolate: &Isolate) -> TokenPos {
    isolate
        .frames()
        .top_managed_frame()
        .map_or(TokenPos::NONE, |(_, frame)| frame.token_pos)
}

/// Log an entry invocation when `trace_runtime_calls` is set.
pub(crate) fn trace_runtime_call(isolate: &Isolate, name: &str) {
    if isolate.flags().trace_runtime_calls {
        eprintln!("runtime call: {name}");
    }
}

/// The modulo the managed language defines for doubles: the IEEE remainder
/// adjusted so the result is non-negative when the divisor is, and negative
/// zero is normalized to positive zero.
#[must_use]
pub fn float_modulo(left: f64, right: f64) -> f64 {
    let mut remainder = left % right;
    if remainder == 0.0 {
        // Fold -0.0 into +0.0.
        remainder = 0.0;
    } else if remainder < 0.0 {
        if right < 0.0 {
            remainder -= right;
        } else {
            remainder += right;
        }
    }
    remainder
}
