//! The adaptive optimizer's runtime entries.
//!
//! The stack-overflow entry is the single poll point for everything
//! asynchronous: a true overflow outranks all interrupts, interrupts
//! outrank OSR, and OSR runs only when nothing else claimed the check.
//! Counter-driven (re)optimization comes in through its own entry when a
//! function's usage counter crosses the threshold at a call.

use super::trace_runtime_call;
use crate::arguments::NativeArguments;
use crate::exceptions::{self, EntryResult};
use crate::isolate::{Isolate, InterruptBits};
use lumen_runtime::FunctionRef;
use lumen_runtime::Value;
use std::sync::Arc;

/// Usage-counter value that suppresses further optimization attempts.
const LOW_INVOCATION_COUNT: i64 = -100_000_000;

/// The optimizability predicate.
///
/// A failing check parks the usage counter so the counter-overflow path
/// stops firing for this function.
#[must_use]
pub fn can_optimize_function(isolate: &Isolate, function: &FunctionRef) -> bool {
    let flags = isolate.flags();
    if isolate.debugger().is_stepping() || isolate.debugger().has_breakpoint(function) {
        // Breakpoints and single-stepping cannot live in optimized code.
        function.set_usage_counter(0);
        return false;
    }
    if function.deoptimization_counter() >= flags.deoptimization_counter_threshold {
        if flags.trace_failed_optimization_attempts || flags.stop_on_excessive_deoptimization {
            eprintln!(
                "Too many deoptimizations: {}",
                function.qualified_name(isolate.class_table())
            );
            if flags.stop_on_excessive_deoptimization {
                panic!("stop on excessive deoptimization");
            }
        }
        function.set_usage_counter(LOW_INVOCATION_COUNT);
        return false;
    }
    if flags.optimization_filter.is_some()
        && !flags.matches_optimization_filter(&function.qualified_name(isolate.class_table()))
    {
        function.set_usage_counter(LOW_INVOCATION_COUNT);
        return false;
    }
    if !function.is_optimizable() {
        if flags.trace_failed_optimization_attempts {
            eprintln!(
                "Not optimizable: {}",
                function.qualified_name(isolate.class_table())
            );
        }
        function.set_usage_counter(LOW_INVOCATION_COUNT);
        return false;
    }
    true
}

/// On-stack replacement at the current loop position of the top frame.
fn attempt_osr(isolate: &Isolate) -> EntryResult {
    let Some((frame_id, frame)) = isolate.frames().top_managed_frame() else {
        return Ok(());
    };
    let function = frame.lookup_code().function();
    if !can_optimize_function(isolate, &function) {
        return Ok(());
    }
    let unoptimized = function
        .unoptimized_code()
        .expect("running function has no unoptimized code");
    let Some(osr_id) = unoptimized.deopt_id_for_osr(frame.pc) else {
        return Ok(());
    };
    if isolate.flags().trace_osr {
        eprintln!(
            "Attempting OSR for {} at id={}, count={}",
            function.qualified_name(isolate.class_table()),
            osr_id.0,
            function.usage_counter()
        );
    }

    let original_code = function.current_code().expect("running function has no code");
    isolate
        .compiler()
        .compile_optimized_function(isolate, &function, Some(osr_id))
        .map_err(exceptions::propagate_error)?;

    // The compiler may have bailed out, leaving the code unchanged.
    let optimized_code = function.current_code().expect("function lost its code");
    if !Arc::ptr_eq(&optimized_code, &original_code) {
        // The OSR variant is only valid entered at this loop position, so
        // regular calls must keep entering the unoptimized prologue: put
        // the old code back and redirect only this frame.
        let optimized_entry = optimized_code.entry_point();
        function.set_code(&original_code);
        isolate.frames().set_pc(frame_id, optimized_entry);
    }
    Ok(())
}

/// The stack-overflow check: overflow, then interrupts, then OSR.
/// - No arguments.
pub fn stack_overflow(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "StackOverflow");
    arguments.expect_count(0);
    let stack_pos = isolate
        .frames()
        .top_managed_frame()
        .map_or(u64::MAX, |(_, frame)| frame.sp);

    // An interrupt arriving together with a real overflow waits: the
    // overflow is processed first.
    if stack_pos < isolate.saved_stack_limit() {
        // Preallocated, so throwing does not re-enter managed code.
        return Err(exceptions::throw(isolate.stack_overflow_exception()));
    }

    let interrupt_bits = isolate.get_and_clear_interrupts();
    if interrupt_bits.contains(InterruptBits::STORE_BUFFER) {
        isolate.heap().collect_garbage(crate::heap::GcKind::New);
    }
    if interrupt_bits.contains(InterruptBits::MESSAGE) {
        isolate.message_handler().handle_oob_messages();
    }
    if interrupt_bits.contains(InterruptBits::API) {
        isolate.debugger().signal_isolate_interrupted();
        if let Some(resume) = isolate.run_interrupt_callback() {
            if resume {
                return Ok(());
            }
            // No unwind protocol exists for a refused interrupt; fail
            // loudly instead of guessing one.
            panic!("isolate unwind after refused interrupt is not implemented");
        }
    }
    if interrupt_bits.contains(InterruptBits::VM_STATUS) {
        isolate.run_vm_status_callback();
    }

    if isolate.flags().use_osr && interrupt_bits.is_empty() {
        attempt_osr(isolate)?;
    }
    Ok(())
}

/// Counter-driven (re)optimization of the invoked function.
/// - Arg0: the function, which may already be optimized.
/// - Returns the code to continue execution in.
pub fn optimize_invoked_function(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "OptimizeInvokedFunction");
    arguments.expect_count(1);
    let function = arguments.arg_at(0).expect_function();
    debug_assert!(function.has_code());

    if can_optimize_function(isolate, &function) {
        isolate
            .compiler()
            .compile_optimized_function(isolate, &function, None)
            .map_err(exceptions::propagate_error)?;
        debug_assert!(function.has_code());
        // Restart the count towards reoptimization.
        function.set_usage_counter(0);
    }
    let code = function.current_code().expect("optimized function has no code");
    arguments.set_return(Value::Code(code));
    Ok(())
}

// =============================================================================
// Trace entries
// =============================================================================

/// Print a banner when entering a traced function.
/// - Arg0: the function.
pub fn trace_function_entry(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    arguments.expect_count(1);
    let function = arguments.arg_at(0).expect_function();
    eprintln!("> Entering '{}'", function.qualified_name(isolate.class_table()));
    Ok(())
}

/// Print a banner when exiting a traced function.
/// - Arg0: the function.
pub fn trace_function_exit(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    arguments.expect_count(1);
    let function = arguments.arg_at(0).expect_function();
    eprintln!("< Exiting '{}'", function.qualified_name(isolate.class_table()));
    Ok(())
}
