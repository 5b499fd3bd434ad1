//! Dynamic method resolution.
//!
//! Resolution walks the receiver's class chain looking for a member with
//! the call's name whose signature accepts the call's argument shape. Only
//! arity and named-argument names are checked; argument values never
//! matter here.

use lumen_core::Symbol;
use lumen_runtime::{ArgsDescRef, ClassRef, ClassTable, FunctionRef, Value};

/// Resolve an instance call against the receiver's runtime class.
#[must_use]
pub fn resolve_dynamic(
    table: &ClassTable,
    receiver: &Value,
    name: &Symbol,
    desc: &ArgsDescRef,
) -> Option<FunctionRef> {
    let class = table.get(receiver.class_id());
    resolve_dynamic_for_receiver_class(table, &class, name, desc)
}

/// Resolve an instance call for a known receiver class.
#[must_use]
pub fn resolve_dynamic_for_receiver_class(
    table: &ClassTable,
    class: &ClassRef,
    name: &Symbol,
    desc: &ArgsDescRef,
) -> Option<FunctionRef> {
    let mut current = Some(class.clone());
    while let Some(cls) = current {
        if let Some(function) = cls.lookup_function(name) {
            if function.are_valid_arguments(desc) {
                return Some(function);
            }
            // A same-named member with an incompatible shape shadows
            // superclass members; the call goes to noSuchMethod.
            return None;
        }
        current = cls.super_class().map(|cid| table.get(cid));
    }
    None
}
