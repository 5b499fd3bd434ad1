//! Type-test entries and the subtype-test cache protocol.
//!
//! `instanceof` and the assignment check wrap the object model's
//! instance-of relation with a per-call-site cache. The protocol:
//! canonicalize the involved type-argument vectors first (swapping the
//! canonical forms into the instances), then scan the cache by identity,
//! then insert if the cache has room and the key is canonicalizable. A
//! duplicate hit after canonicalization replaced a vector is expected; a
//! duplicate without any replacement is logged as a bug.

use super::{caller_token_pos, trace_runtime_call};
use crate::arguments::NativeArguments;
use crate::exceptions::{self, EntryResult};
use crate::isolate::Isolate;
use lumen_runtime::types::{self, Type, TypeArgsRef};
use lumen_runtime::{StcRef, Value};

// =============================================================================
// Canonicalization
// =============================================================================

/// Replace a value's type-argument vector with its canonical form:
/// flatten a lazy pair, then intern. Returns whether the vector changed.
///
/// Lazy pairs that fail to flatten are malbounded; those are never cached,
/// and reaching here with one is a compiler bug.
pub fn optimize_type_arguments(isolate: &Isolate, instance: &Value) -> bool {
    let class = isolate.class_table().get(instance.class_id());
    if class.num_type_arguments() == 0 {
        return false;
    }
    let Some(args) = instance.type_arguments() else {
        return false;
    };
    let canonical = if args.is_lazy() {
        let flat = types::flatten(&args, isolate.class_table())
            .expect("malbounded type arguments reached canonicalization");
        isolate.type_args_interner().canonicalize(&flat)
    } else if !args.is_canonical() {
        isolate.type_args_interner().canonicalize(&args)
    } else {
        return false;
    };
    instance.set_type_arguments(Some(canonical));
    true
}

// =============================================================================
// Cache update
// =============================================================================

fn trace_type_check(isolate: &Isolate, message: &str, instance: &Value, tested: &Type, result: bool) {
    if isolate.flags().trace_type_checks {
        eprintln!(
            "{message}: '{}' {} '{}'",
            instance.type_name(isolate.class_table()),
            if result { "is" } else { "is !" },
            tested.user_visible_name(isolate.class_table()),
        );
    }
}

/// Record a subtype-test outcome in the call site's cache.
///
/// `instantiator` is the instantiator *instance* (or null); its vector is
/// canonicalized in place the same way the tested instance's is.
#[allow(clippy::too_many_arguments)]
fn update_type_test_cache(
    isolate: &Isolate,
    instance: &Value,
    tested: &Type,
    instantiator: &Value,
    incoming_instantiator_type_args: Option<TypeArgsRef>,
    result: bool,
    cache: Option<&StcRef>,
) {
    let Some(cache) = cache else {
        // The call site opted out; the test stays slow.
        return;
    };
    let instance_class = isolate.class_table().get(instance.class_id());
    let mut instantiator_type_args = incoming_instantiator_type_args;
    let mut instance_type_args = None;
    let mut type_arguments_replaced = false;

    if instance_class.num_type_arguments() > 0 {
        type_arguments_replaced = optimize_type_arguments(isolate, instance);
        instance_type_args = instance.type_arguments();
    }
    if !instantiator.is_null() {
        if optimize_type_arguments(isolate, instantiator) {
            type_arguments_replaced = true;
        }
        instantiator_type_args = instantiator.type_arguments();
    }

    if cache.number_of_checks() >= isolate.flags().max_subtype_cache_entries {
        return;
    }
    if cache
        .find(
            instance_class.id(),
            instance_type_args.as_ref(),
            instantiator_type_args.as_ref(),
        )
        .is_some()
    {
        // A duplicate is expected when canonicalization just replaced a
        // vector: the original key was inserted under the old identity.
        if isolate.flags().trace_type_checks {
            if type_arguments_replaced {
                trace_type_check(isolate, "Duplicate cache entry (canonical.)", instance, tested, result);
            } else {
                trace_type_check(isolate, "WARNING duplicate cache entry", instance, tested, result);
            }
        }
        return;
    }
    if instantiator_type_args.as_ref().map_or(false, |a| a.is_lazy()) {
        // Keys must be canonical; a still-lazy instantiator is not.
        return;
    }
    cache.add_check(
        instance_class.id(),
        instance_type_args,
        instantiator_type_args,
        result,
    );
    trace_type_check(isolate, "Updated test cache", instance, tested, result);
}

// =============================================================================
// Entries
// =============================================================================

/// Check that an instance is an instance of a type.
///
/// The null test is inlined, so the instance is never null here.
/// - Arg0: instance being checked.
/// - Arg1: the type.
/// - Arg2: instantiator (or null).
/// - Arg3: type arguments of the instantiator of the type (or null).
/// - Arg4: subtype-test cache (or null).
/// - Returns true or false; throws a type error on a bound violation.
pub fn instanceof(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "Instanceof");
    arguments.expect_count(5);
    let instance = arguments.arg_at(0).expect_instance();
    let tested = arguments.arg_at(1).expect_type();
    let instantiator = arguments.arg_at(2).expect_instance();
    let instantiator_type_args = arguments.arg_at(3).expect_type_args();
    let cache = arguments.arg_at(4).expect_subtype_cache();
    // Dynamic and malformed/malbounded tests never reach the runtime; the
    // code generator resolves them statically.
    debug_assert!(!matches!(&*tested, Type::Dynamic));
    debug_assert!(!matches!(&*tested, Type::Malformed(_)));

    let result = match instance.is_instance_of(
        &tested,
        instantiator_type_args.as_ref(),
        isolate.class_table(),
    ) {
        Ok(result) => result,
        Err(bound_error) => {
            // A bound error surfaces only when the test fails.
            let location = caller_token_pos(isolate);
            return Err(exceptions::create_and_throw_type_error(
                location,
                String::new(),
                String::new(),
                String::new(),
                Some(bound_error.message),
            ));
        }
    };
    trace_type_check(isolate, "InstanceOf", &instance, &tested, result);
    update_type_test_cache(
        isolate,
        &instance,
        &tested,
        &instantiator,
        instantiator_type_args,
        result,
        cache.as_ref(),
    );
    arguments.set_return(Value::Bool(result));
    Ok(())
}

/// Check that an instance can be assigned to a destination type.
///
/// On success the instance is returned and the positive result cached; on
/// failure a type error carrying source type, destination type, and the
/// destination variable name is thrown.
/// - Arg0: instance being assigned.
/// - Arg1: destination type.
/// - Arg2: instantiator (or null).
/// - Arg3: type arguments of the instantiator of the destination type.
/// - Arg4: name of the variable being assigned to.
/// - Arg5: subtype-test cache (or null).
pub fn type_check(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "TypeCheck");
    arguments.expect_count(6);
    let src_instance = arguments.arg_at(0).expect_instance();
    let dst_type = arguments.arg_at(1).expect_type();
    let dst_instantiator = arguments.arg_at(2).expect_instance();
    let instantiator_type_args = arguments.arg_at(3).expect_type_args();
    let dst_name = arguments.arg_at(4).expect_string();
    let cache = arguments.arg_at(5).expect_subtype_cache();
    debug_assert!(!matches!(&*dst_type, Type::Dynamic));
    debug_assert!(!matches!(&*dst_type, Type::Malformed(_)));
    // The null check is inlined at the assignment site.
    debug_assert!(!src_instance.is_null());

    let table = isolate.class_table();
    let checked = src_instance.is_instance_of(&dst_type, instantiator_type_args.as_ref(), table);
    let (is_instance_of, bound_error) = match checked {
        Ok(result) => (result, None),
        Err(err) => (false, Some(err)),
    };
    trace_type_check(isolate, "TypeCheck", &src_instance, &dst_type, is_instance_of);

    if !is_instance_of {
        let location = caller_token_pos(isolate);
        let src_type_name = src_instance.type_name(table);
        // Instantiate the destination before reporting, so the message
        // shows the concrete type the caller wrote.
        let dst_type_name = if dst_type.is_instantiated() {
            dst_type.user_visible_name(table)
        } else {
            dst_type
                .instantiate_from(instantiator_type_args.as_ref(), table)
                .map_or_else(|_| dst_type.user_visible_name(table), |t| t.user_visible_name(table))
        };
        return Err(exceptions::create_and_throw_type_error(
            location,
            src_type_name,
            dst_type_name,
            dst_name.as_str().to_string(),
            bound_error.map(|e| e.message),
        ));
    }
    update_type_test_cache(
        isolate,
        &src_instance,
        &dst_type,
        &dst_instantiator,
        instantiator_type_args,
        true,
        cache.as_ref(),
    );
    arguments.set_return(src_instance);
    Ok(())
}

/// Report that a value used in a conditional is not a bool.
/// - Arg0: the offending value.
/// - Never returns; throws a type error.
pub fn non_bool_type_error(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "NonBoolTypeError");
    arguments.expect_count(1);
    let src_instance = arguments.arg_at(0).expect_instance();
    debug_assert!(!matches!(src_instance, Value::Bool(_)));
    let location = caller_token_pos(isolate);
    let src_type_name = src_instance.type_name(isolate.class_table());
    Err(exceptions::create_and_throw_type_error(
        location,
        src_type_name,
        "bool".to_string(),
        "boolean expression".to_string(),
        None,
    ))
}

/// Report an assignment to a destination whose type is malformed or
/// malbounded.
/// - Arg0: source value.
/// - Arg1: name of the destination.
/// - Arg2: the faulty destination type.
/// - Never returns; throws a type error.
pub fn bad_type_error(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "BadTypeError");
    arguments.expect_count(3);
    let src_value = arguments.arg_at(0).expect_instance();
    let dst_name = arguments.arg_at(1).expect_string();
    let dst_type = arguments.arg_at(2).expect_type();
    let location = caller_token_pos(isolate);
    let src_type_name = src_value.type_name(isolate.class_table());

    let Type::Malformed(language_error) = &*dst_type else {
        panic!("bad-type error raised for a well-formed type");
    };
    Err(exceptions::create_and_throw_type_error(
        location,
        src_type_name,
        language_error.kind.type_name().to_string(),
        dst_name.as_str().to_string(),
        Some(language_error.message.clone()),
    ))
}

/// Throw a managed exception.
/// - Arg0: the exception object.
pub fn throw(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "Throw");
    arguments.expect_count(1);
    let exception = arguments.arg_at(0).expect_instance();
    Err(exceptions::throw(exception))
}

/// Rethrow a managed exception with its original stack trace.
/// - Arg0: the exception object.
/// - Arg1: the stack trace.
pub fn rethrow(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "ReThrow");
    arguments.expect_count(2);
    let exception = arguments.arg_at(0).expect_instance();
    let stacktrace = arguments.arg_at(1).expect_instance();
    Err(exceptions::rethrow(exception, stacktrace))
}
