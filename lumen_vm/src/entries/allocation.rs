//! Allocation entries.
//!
//! Generated code allocates inline for the common cases; these entries
//! cover the rest: arrays with element types, generic objects whose
//! type-argument vectors need lazy instantiation, closures, and contexts.
//! The bounds-checked variant instantiates eagerly and raises a type error
//! on a bound violation.

use super::{caller_token_pos, trace_runtime_call};
use crate::arguments::NativeArguments;
use crate::exceptions::{self, EntryResult};
use crate::isolate::Isolate;
use lumen_runtime::types::{Type, TypeArgs};
use lumen_runtime::{FunctionKind, Value};

/// Allocate a fixed-length array of a given element type.
///
/// Never called for an array of a generic type: a prior runtime call has
/// already instantiated the element type.
/// - Arg0: array length.
/// - Arg1: element type-argument vector (one element), or null.
/// - Returns the new array.
pub fn allocate_array(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "AllocateArray");
    arguments.expect_count(2);
    let length = arguments.arg_at(0).expect_smi();
    debug_assert!(length >= 0);
    let array = isolate.heap().allocate_array(length as usize);
    let element_type = arguments.arg_at(1).expect_type_args();
    // An array takes one type argument, but its vector may be longer: a
    // type optimization may reuse the instantiator's vector wholesale.
    debug_assert!(element_type
        .as_ref()
        .map_or(true, |args| args.len() >= 1 && args.is_instantiated()));
    array.set_type_arguments(element_type);
    arguments.set_return(Value::Array(array));
    Ok(())
}

/// Allocate a new object.
/// - Arg0: class of the object.
/// - Arg1: type arguments of the object, or null.
/// - Arg2: type arguments of the instantiator, or the no-instantiator
///   sentinel.
/// - Returns the new instance.
pub fn allocate_object(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "AllocateObject");
    arguments.expect_count(3);
    let class = arguments.arg_at(0).expect_class();
    let instance = isolate.heap().allocate_instance(&class);
    if class.num_type_arguments() == 0 {
        // No vector for a non-parameterized class.
        debug_assert!(arguments.arg_at(1).is_null());
        arguments.set_return(Value::Instance(instance));
        return Ok(());
    }
    let type_arguments = arguments.arg_at(1).expect_type_args();
    if arguments.arg_at(2).is_no_instantiator_sentinel() {
        // Unless null (a raw type), the vector is already instantiated. It
        // may be longer than required when the instantiator's vector was
        // reused by a type optimization.
        debug_assert!(type_arguments.as_ref().map_or(true, |args| {
            args.is_instantiated() && args.len() >= class.num_type_arguments()
        }));
        instance.set_type_arguments(type_arguments);
        arguments.set_return(Value::Instance(instance));
        return Ok(());
    }
    let type_arguments =
        type_arguments.expect("uninstantiated allocation requires a type-argument vector");
    // A still-uninstantiated vector must have the declared length.
    debug_assert!(!type_arguments.is_instantiated());
    debug_assert_eq!(type_arguments.len(), class.num_type_arguments());
    let instantiator = arguments.arg_at(2).expect_type_args();
    debug_assert!(instantiator.as_ref().map_or(true, |i| i.is_instantiated()));
    // The caller's inlined fast path has already handled the case where
    // the instantiator can be reused as the vector itself.
    debug_assert!(instantiator.is_none() || !type_arguments.is_uninstantiated_identity());
    let lazy = TypeArgs::lazy(type_arguments, instantiator);
    instance.set_type_arguments(Some(lazy));
    arguments.set_return(Value::Instance(instance));
    Ok(())
}

/// Allocate a new object of a generic type, checking that the instantiated
/// type arguments satisfy the declared bounds.
///
/// Same arguments as `allocate_object`; a bound violation raises a type
/// error at the caller's token position.
pub fn allocate_object_with_bounds_check(
    isolate: &Isolate,
    arguments: &mut NativeArguments,
) -> EntryResult {
    trace_runtime_call(isolate, "AllocateObjectWithBoundsCheck");
    arguments.expect_count(3);
    debug_assert!(isolate.flags().enable_type_checks);
    let class = arguments.arg_at(0).expect_class();
    debug_assert!(class.num_type_arguments() > 0);
    let instance = isolate.heap().allocate_instance(&class);
    let mut type_arguments = arguments.arg_at(1).expect_type_args();
    if arguments.arg_at(2).is_no_instantiator_sentinel() {
        debug_assert!(type_arguments.as_ref().map_or(true, |args| {
            args.is_instantiated() && args.len() >= class.num_type_arguments()
        }));
    } else {
        let uninstantiated =
            type_arguments.expect("uninstantiated allocation requires a type-argument vector");
        debug_assert!(!uninstantiated.is_instantiated());
        debug_assert_eq!(uninstantiated.len(), class.num_type_arguments());
        let instantiator = arguments.arg_at(2).expect_type_args();
        debug_assert!(instantiator.as_ref().map_or(true, |i| i.is_instantiated()));
        debug_assert!(instantiator.is_none() || !uninstantiated.is_uninstantiated_identity());
        // Instantiate through the class type so the declared bounds are
        // checked against the resolved arguments.
        let class_type = Type::Class {
            cid: class.id(),
            type_args: Some(uninstantiated),
        };
        match class_type.instantiate_from(instantiator.as_ref(), isolate.class_table()) {
            Ok(Type::Class { type_args, .. }) => type_arguments = type_args,
            Ok(_) => unreachable!("class type instantiated to a non-class type"),
            Err(bound_error) => {
                let location = caller_token_pos(isolate);
                return Err(exceptions::create_and_throw_type_error(
                    location,
                    String::new(),
                    String::new(),
                    String::new(),
                    Some(bound_error.message),
                ));
            }
        }
    }
    debug_assert!(type_arguments.as_ref().map_or(true, |a| a.is_instantiated()));
    instance.set_type_arguments(type_arguments);
    arguments.set_return(Value::Instance(instance));
    Ok(())
}

/// Instantiate an uninstantiated type.
/// - Arg0: the type.
/// - Arg1: instantiator type arguments, or null.
/// - Returns the instantiated type, or raises a type error on a bound
///   violation.
pub fn instantiate_type(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "InstantiateType");
    arguments.expect_count(2);
    let tested = arguments.arg_at(0).expect_type();
    let instantiator = arguments.arg_at(1).expect_type_args();
    debug_assert!(!tested.is_instantiated());
    debug_assert!(instantiator.as_ref().map_or(true, |i| i.is_instantiated()));
    match tested.instantiate_from(instantiator.as_ref(), isolate.class_table()) {
        Ok(instantiated) => {
            debug_assert!(instantiated.is_instantiated());
            arguments.set_return(Value::Type(std::sync::Arc::new(instantiated)));
            Ok(())
        }
        Err(bound_error) => {
            let location = caller_token_pos(isolate);
            Err(exceptions::create_and_throw_type_error(
                location,
                String::new(),
                String::new(),
                String::new(),
                Some(bound_error.message),
            ))
        }
    }
}

/// Instantiate a type-argument vector lazily.
/// - Arg0: uninstantiated type-argument vector.
/// - Arg1: instantiator type arguments, or null.
/// - Returns the lazy instantiated vector.
pub fn instantiate_type_arguments(
    isolate: &Isolate,
    arguments: &mut NativeArguments,
) -> EntryResult {
    trace_runtime_call(isolate, "InstantiateTypeArguments");
    arguments.expect_count(2);
    let uninstantiated = arguments
        .arg_at(0)
        .expect_type_args()
        .expect("instantiation of a null vector");
    let instantiator = arguments.arg_at(1).expect_type_args();
    debug_assert!(!uninstantiated.is_instantiated());
    debug_assert!(instantiator.as_ref().map_or(true, |i| i.is_instantiated()));
    // The inlined fast path already handled instantiator reuse.
    debug_assert!(instantiator.is_none() || !uninstantiated.is_uninstantiated_identity());
    let lazy = TypeArgs::lazy(uninstantiated, instantiator);
    debug_assert!(lazy.is_instantiated());
    arguments.set_return(Value::TypeArgs(lazy));
    Ok(())
}

/// Allocate a closure over a local function.
///
/// A closure's own vector is the identity vector of its signature, so the
/// instantiator doubles as the instantiated closure type arguments.
/// - Arg0: the closure function.
/// - Arg1: type arguments of the closure.
/// - Returns the new closure.
pub fn allocate_closure(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "AllocateClosure");
    arguments.expect_count(2);
    let function = arguments.arg_at(0).expect_function();
    debug_assert_eq!(function.kind(), FunctionKind::Closure);
    let type_arguments = arguments.arg_at(1).expect_type_args();
    debug_assert!(type_arguments.as_ref().map_or(true, |a| a.is_instantiated()));
    // The current context was saved on the isolate when entering the
    // runtime.
    let context = isolate.top_context().expect("no saved top context");
    let closure = isolate.heap().allocate_closure(function, context);
    closure.set_type_arguments(type_arguments);
    arguments.set_return(Value::Instance(closure));
    Ok(())
}

/// Allocate the implicit closure wrapping an instance method.
/// - Arg0: the implicit closure function.
/// - Arg1: the receiver.
/// - Arg2: type arguments of the closure.
/// - Returns the new closure.
pub fn allocate_implicit_instance_closure(
    isolate: &Isolate,
    arguments: &mut NativeArguments,
) -> EntryResult {
    trace_runtime_call(isolate, "AllocateImplicitInstanceClosure");
    arguments.expect_count(3);
    let function = arguments.arg_at(0).expect_function();
    debug_assert_eq!(function.kind(), FunctionKind::ImplicitClosure);
    let receiver = arguments.arg_at(1).expect_instance();
    let type_arguments = arguments.arg_at(2).expect_type_args();
    debug_assert!(type_arguments.as_ref().map_or(true, |a| a.is_instantiated()));
    // The receiver rides in a synthesized one-slot context.
    let context = isolate.heap().allocate_context(1);
    context.set_at(0, receiver);
    let closure = isolate.heap().allocate_closure(function, context);
    closure.set_type_arguments(type_arguments);
    arguments.set_return(Value::Instance(closure));
    Ok(())
}

/// Allocate a context with room for the given number of variables.
/// - Arg0: number of variables.
/// - Returns the new context.
pub fn allocate_context(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "AllocateContext");
    arguments.expect_count(1);
    let num_variables = arguments.arg_at(0).expect_smi();
    debug_assert!(num_variables >= 0);
    let context = isolate.heap().allocate_context(num_variables as usize);
    arguments.set_return(Value::Context(context));
    Ok(())
}

/// Copy a context, including the captured values.
/// - Arg0: the context to clone.
/// - Returns the copy.
pub fn clone_context(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "CloneContext");
    arguments.expect_count(1);
    let context = arguments.arg_at(0).expect_context();
    let cloned = isolate.heap().allocate_context(context.num_variables());
    cloned.set_parent(context.parent());
    for i in 0..context.num_variables() {
        cloned.set_at(i, context.at(i));
    }
    arguments.set_return(Value::Context(cloned));
    Ok(())
}
