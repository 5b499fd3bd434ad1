//! Field feedback entry.

use super::trace_runtime_call;
use crate::arguments::NativeArguments;
use crate::exceptions::EntryResult;
use crate::isolate::Isolate;

/// Narrow a field's guarded class id and length after the inline store
/// fast path observed a guard mismatch.
/// - Arg0: the field.
/// - Arg1: the value being stored.
pub fn update_field_cid(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "UpdateFieldCid");
    arguments.expect_count(2);
    let field = arguments.arg_at(0).expect_field();
    let value = arguments.arg_at(1).expect_instance();
    field.update_guarded(&value);
    Ok(())
}
