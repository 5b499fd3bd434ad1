//! Inline-cache miss handling and polymorphic dispatch.
//!
//! A missed instance call resolves its target dynamically, compiles it if
//! needed, appends a check to the site's IC data, and returns the target
//! so the stub can tail-call it. Sites that have escalated to megamorphic
//! dispatch go through the shared cache instead. When nothing resolves,
//! the instance-function-lookup fallback installs an invocation
//! dispatcher: getter-then-call if a plain getter with the name exists,
//! noSuchMethod otherwise.

use super::trace_runtime_call;
use crate::arguments::NativeArguments;
use crate::exceptions::{self, EntryResult, Unwind};
use crate::isolate::Isolate;
use crate::resolver;
use lumen_core::symbol;
use lumen_runtime::ic_data::CidVector;
use lumen_runtime::{
    ArgsDescRef, ArgsDescriptor, ArrayRef, ClassRef, CodeRef, DispatcherKind, FunctionKind,
    FunctionRef, IcDataRef, Value,
};

// =============================================================================
// Resolution helpers
// =============================================================================

/// Resolve and compile the target of an instance call; null when the
/// megamorphic stub must run the instance-function-lookup fallback
/// (noSuchMethod, closure calls).
fn resolve_compile_instance_call_target(
    isolate: &Isolate,
    receiver: &Value,
    ic_data: &IcDataRef,
) -> Result<Option<CodeRef>, Unwind> {
    let name = ic_data.target_name();
    let desc = ic_data.args_descriptor();
    let function = resolver::resolve_dynamic(isolate.class_table(), receiver, name, desc);
    let Some(function) = function else {
        return Ok(None);
    };
    if !function.has_code() {
        isolate
            .compiler()
            .compile_function(isolate, &function)
            .map_err(exceptions::propagate_error)?;
    }
    Ok(function.current_code())
}

/// Shared miss path for the 1/2/3-argument entries: resolve, compile,
/// record the observed class-id vector, and hand back the target.
fn inline_cache_miss_handler(
    isolate: &Isolate,
    args: &[Value],
    ic_data: &IcDataRef,
) -> Result<Option<FunctionRef>, Unwind> {
    let receiver = &args[0];
    let target_code = resolve_compile_instance_call_target(isolate, receiver, ic_data)?;
    let Some(target_code) = target_code else {
        if isolate.flags().trace_ic {
            eprintln!(
                "InlineCacheMissHandler null code for {} receiver: {:?}",
                ic_data.target_name(),
                receiver
            );
        }
        return Ok(None);
    };
    let target_function = target_code.function();
    if args.len() == 1 {
        ic_data.add_receiver_check(receiver.class_id(), target_function.clone());
    } else {
        debug_assert_eq!(ic_data.num_args_tested(), args.len());
        let class_ids: CidVector = args.iter().map(Value::class_id).collect();
        ic_data.add_check(class_ids, target_function.clone());
    }
    if isolate.flags().trace_ic_miss_in_optimized {
        if let Some((_, frame)) = isolate.frames().top_managed_frame() {
            if frame.lookup_code().is_optimized() {
                eprintln!(
                    "IC miss in optimized code; call {} -> {}",
                    frame.lookup_code().function().name(),
                    target_function.name()
                );
            }
        }
    }
    if isolate.flags().trace_ic {
        eprintln!(
            "InlineCacheMissHandler {} call adding {} -> {}",
            args.len(),
            receiver.class_id(),
            target_function.name()
        );
    }
    Ok(Some(target_function))
}

fn set_function_return(arguments: &mut NativeArguments, result: Option<FunctionRef>) {
    match result {
        Some(function) => arguments.set_return(Value::Function(function)),
        None => arguments.set_return(Value::Null),
    }
}

// =============================================================================
// Miss entries
// =============================================================================

/// Inline-cache miss, one argument tested.
/// - Arg0: receiver.
/// - Arg1: IC data.
/// - Returns the target function with compiled code, or null.
pub fn inline_cache_miss_one_arg(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "InlineCacheMissHandlerOneArg");
    arguments.expect_count(2);
    let receiver = arguments.arg_at(0).expect_instance();
    let ic_data = arguments.arg_at(1).expect_ic_data();
    let result = inline_cache_miss_handler(isolate, &[receiver], &ic_data)?;
    set_function_return(arguments, result);
    Ok(())
}

/// Inline-cache miss, two arguments tested.
/// - Arg0: receiver.
/// - Arg1: argument after the receiver.
/// - Arg2: IC data.
pub fn inline_cache_miss_two_args(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "InlineCacheMissHandlerTwoArgs");
    arguments.expect_count(3);
    let receiver = arguments.arg_at(0).expect_instance();
    let other = arguments.arg_at(1).expect_instance();
    let ic_data = arguments.arg_at(2).expect_ic_data();
    let result = inline_cache_miss_handler(isolate, &[receiver, other], &ic_data)?;
    set_function_return(arguments, result);
    Ok(())
}

/// Inline-cache miss, three arguments tested.
/// - Arg0: receiver.
/// - Arg1: first argument after the receiver.
/// - Arg2: second argument after the receiver.
/// - Arg3: IC data.
pub fn inline_cache_miss_three_args(
    isolate: &Isolate,
    arguments: &mut NativeArguments,
) -> EntryResult {
    trace_runtime_call(isolate, "InlineCacheMissHandlerThreeArgs");
    arguments.expect_count(4);
    let receiver = arguments.arg_at(0).expect_instance();
    let arg1 = arguments.arg_at(1).expect_instance();
    let arg2 = arguments.arg_at(2).expect_instance();
    let ic_data = arguments.arg_at(3).expect_ic_data();
    let result = inline_cache_miss_handler(isolate, &[receiver, arg1, arg2], &ic_data)?;
    set_function_return(arguments, result);
    Ok(())
}

/// A static call in unoptimized code observed an argument-type pair it has
/// not seen. The target is statically known and pre-populated at check 0;
/// compile it if needed and record the pair.
/// - Arg0: argument 0.
/// - Arg1: argument 1.
/// - Arg2: IC data.
pub fn static_call_miss_two_args(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "StaticCallMissHandlerTwoArgs");
    arguments.expect_count(3);
    let arg0 = arguments.arg_at(0).expect_instance();
    let arg1 = arguments.arg_at(1).expect_instance();
    let ic_data = arguments.arg_at(2).expect_ic_data();
    debug_assert!(ic_data.number_of_checks() > 0);
    let target = ic_data
        .target_at(0)
        .expect("static IC data has no pre-populated target");
    if !target.has_code() {
        isolate
            .compiler()
            .compile_function(isolate, &target)
            .map_err(exceptions::propagate_error)?;
    }
    debug_assert!(target.has_code());
    let mut class_ids = CidVector::new();
    class_ids.push(arg0.class_id());
    class_ids.push(arg1.class_id());
    ic_data.add_check(class_ids, target.clone());
    if isolate.flags().trace_ic {
        eprintln!(
            "StaticCallMissHandler target {} ({}, {})",
            target.name(),
            arg0.class_id(),
            arg1.class_id()
        );
    }
    arguments.set_return(Value::Function(target));
    Ok(())
}

/// A megamorphic call site missed its cache.
/// - Arg0: receiver.
/// - Arg1: IC data.
/// - Arg2: arguments descriptor.
/// - Returns the target code to call, or null to make the caller run the
///   instance-function-lookup fallback.
pub fn megamorphic_cache_miss(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "MegamorphicCacheMissHandler");
    arguments.expect_count(3);
    let receiver = arguments.arg_at(0).expect_instance();
    let ic_data = arguments.arg_at(1).expect_ic_data();
    let descriptor = arguments.arg_at(2).expect_args_desc();
    let name = ic_data.target_name().clone();
    let cache = isolate.megamorphic_table().lookup(&name, &descriptor);
    let class = isolate.class_table().get(receiver.class_id());
    if isolate.flags().trace_ic || isolate.flags().trace_ic_miss_in_optimized {
        eprintln!("Megamorphic IC miss, class={}, function={}", class.name(), name);
    }

    let target =
        resolver::resolve_dynamic_for_receiver_class(isolate.class_table(), &class, &name, &descriptor);
    let Some(target) = target else {
        // noSuchMethod and closure calls are not inserted into the
        // megamorphic cache.
        arguments.set_return(Value::Null);
        return Ok(());
    };
    if !target.has_code() {
        isolate
            .compiler()
            .compile_function(isolate, &target)
            .map_err(exceptions::propagate_error)?;
    }
    debug_assert!(target.has_code());
    let code = target.current_code().expect("compiled target has no code");
    cache.ensure_capacity();
    cache.insert(class.id(), target);
    arguments.set_return(Value::Code(code));
    Ok(())
}

/// Record type feedback for an equality site whose control flow bypassed
/// the regular inline cache (null arguments).
/// - Arg0: receiver.
/// - Arg1: argument after the receiver.
/// - Arg2: target name.
/// - Arg3: IC data.
pub fn update_ic_data_two_args(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "UpdateICDataTwoArgs");
    arguments.expect_count(4);
    let receiver = arguments.arg_at(0).expect_instance();
    let arg1 = arguments.arg_at(1).expect_instance();
    let target_name = arguments.arg_at(2).expect_string();
    let ic_data = arguments.arg_at(3).expect_ic_data();
    let descriptor = ArgsDescriptor::positional(2);
    let target = resolver::resolve_dynamic(isolate.class_table(), &receiver, &target_name, &descriptor)
        .expect("equality target must resolve");
    debug_assert_eq!(ic_data.num_args_tested(), 2);
    let mut class_ids = CidVector::new();
    class_ids.push(receiver.class_id());
    class_ids.push(arg1.class_id());
    ic_data.add_check(class_ids, target);
    Ok(())
}

// =============================================================================
// Fallback: instance function lookup
// =============================================================================

/// Getter-then-call: if the receiver's class has a plain getter with the
/// call's name, install an invoke-field dispatcher and invoke it. A
/// method extractor does not count; extracting would closurize a method
/// that plainly does not accept these arguments.
fn resolve_call_through_getter(
    isolate: &Isolate,
    receiver: &Value,
    receiver_class: &ClassRef,
    target_name: &lumen_core::Symbol,
    args_descriptor: &ArgsDescRef,
    args: &ArrayRef,
    ic_data: &IcDataRef,
) -> Result<Option<Value>, Unwind> {
    let getter_name = symbol::getter_name(target_name);
    let getter_descriptor = ArgsDescriptor::positional(1);
    let getter = resolver::resolve_dynamic_for_receiver_class(
        isolate.class_table(),
        receiver_class,
        &getter_name,
        &getter_descriptor,
    );
    match getter {
        None => return Ok(None),
        Some(getter) if getter.kind() == FunctionKind::MethodExtractor => return Ok(None),
        Some(_) => {}
    }

    let dispatcher = receiver_class.get_invocation_dispatcher(
        target_name,
        args_descriptor,
        DispatcherKind::InvokeField,
    );
    ic_data.add_receiver_check(receiver.class_id(), dispatcher.clone());
    if isolate.flags().trace_ic {
        eprintln!(
            "InvokeField IC miss: adding {} -> {}",
            receiver.class_id(),
            dispatcher.name()
        );
    }
    let result = isolate
        .invoker()
        .invoke_function(isolate, &dispatcher, args, args_descriptor)?;
    Ok(Some(result))
}

/// The IC miss handler found no cacheable instance function. Either a
/// getter with the same name produces a callable value, or the call goes
/// to noSuchMethod; in both cases a dispatcher is installed in the IC
/// data so the next miss for this class dispatches directly.
/// - Arg0: receiver.
/// - Arg1: IC data.
/// - Arg2: arguments descriptor.
/// - Arg3: arguments array.
/// - Returns the invocation's result.
pub fn instance_function_lookup(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "InstanceFunctionLookup");
    arguments.expect_count(4);
    let receiver = arguments.arg_at(0).expect_instance();
    let ic_data = arguments.arg_at(1).expect_ic_data();
    let args_descriptor = arguments.arg_at(2).expect_args_desc();
    let args = arguments.arg_at(3).expect_array();

    let receiver_class = isolate.class_table().get(receiver.class_id());
    let target_name = ic_data.target_name().clone();

    if let Some(result) = resolve_call_through_getter(
        isolate,
        &receiver,
        &receiver_class,
        &target_name,
        &args_descriptor,
        &args,
        &ic_data,
    )? {
        arguments.set_return(result);
        return Ok(());
    }

    let dispatcher = receiver_class.get_invocation_dispatcher(
        &target_name,
        &args_descriptor,
        DispatcherKind::NoSuchMethod,
    );
    let receiver_cid = receiver.class_id();
    if ic_data.num_args_tested() == 1 {
        // Optimized code can reach here through the megamorphic miss
        // handler, which never caches noSuchMethod dispatchers, so the
        // same class may miss twice; guard against a duplicate check.
        if ic_data.target_for_receiver_class_id(receiver_cid).is_none() {
            ic_data.add_receiver_check(receiver_cid, dispatcher.clone());
        }
    } else {
        // Operator sites test two or three arguments ([], []=, ...).
        debug_assert!(ic_data.num_args_tested() > 1);
        let mut class_ids = CidVector::new();
        class_ids.push(receiver_cid);
        for i in 1..ic_data.num_args_tested() {
            class_ids.push(args.at(i).class_id());
        }
        ic_data.add_check(class_ids, dispatcher.clone());
    }
    if isolate.flags().trace_ic {
        eprintln!(
            "NoSuchMethod IC miss: adding {} -> {}",
            receiver_cid,
            dispatcher.name()
        );
    }
    let result = isolate
        .invoker()
        .invoke_function(isolate, &dispatcher, &args, &args_descriptor)?;
    arguments.set_return(result);
    Ok(())
}

// =============================================================================
// Dispatcher invocation entries
// =============================================================================

/// Invoke the appropriate noSuchMethod.
///
/// For a closure receiver the reported name is the closurized function's
/// qualified name rather than `call`, so the error names something the
/// user wrote.
/// - Arg0: receiver.
/// - Arg1: IC data.
/// - Arg2: arguments descriptor.
/// - Arg3: arguments array.
pub fn invoke_nosuchmethod_function(
    isolate: &Isolate,
    arguments: &mut NativeArguments,
) -> EntryResult {
    trace_runtime_call(isolate, "InvokeNoSuchMethodFunction");
    arguments.expect_count(4);
    let receiver = arguments.arg_at(0).expect_instance();
    let ic_data = arguments.arg_at(1).expect_ic_data();
    let orig_arguments_desc = arguments.arg_at(2).expect_args_desc();
    let orig_arguments = arguments.arg_at(3).expect_array();

    let mut original_function_name = ic_data.target_name().clone();
    if let Value::Instance(instance) = &receiver {
        if let Some(closure_function) = instance.closure_function() {
            original_function_name = symbol::intern(
                &closure_function.qualified_name(isolate.class_table()),
            );
        }
    }
    let result = isolate.invoker().invoke_nosuchmethod(
        isolate,
        &receiver,
        &original_function_name,
        &orig_arguments,
        &orig_arguments_desc,
    )?;
    arguments.set_return(result);
    Ok(())
}

/// A non-closure object was invoked as a closure; call its `call` member.
/// - Arg0: arguments descriptor.
/// - Arg1: arguments array, including the non-closure object.
pub fn invoke_nonclosure(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "InvokeNonClosure");
    arguments.expect_count(2);
    let args_descriptor = arguments.arg_at(0).expect_args_desc();
    let function_args = arguments.arg_at(1).expect_array();
    let result = isolate
        .invoker()
        .invoke_closure(isolate, &function_args, &args_descriptor)?;
    arguments.set_return(result);
    Ok(())
}

/// Trace one IC call: the site's state and its target function.
/// - Arg0: IC data.
/// - Arg1: the called function.
pub fn trace_ic_call(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    arguments.expect_count(2);
    let ic_data = arguments.arg_at(0).expect_ic_data();
    let function = arguments.arg_at(1).expect_function();
    let pc = isolate
        .frames()
        .top_managed_frame()
        .map_or(lumen_core::ids::Address::ZERO, |(_, frame)| frame.pc);
    eprintln!(
        "IC call @{pc}: cnt:{} nchecks: {} {}",
        function.usage_counter(),
        ic_data.number_of_checks(),
        function.qualified_name(isolate.class_table()),
    );
    Ok(())
}
