//! Patcher front-end entries.
//!
//! Static call sites in optimized code are patched to their target's
//! current entry point the first time they run, and re-patched when the
//! target is recompiled or its code detached. The debugger entries route
//! breakpoint traffic: they signal the debugger collaborator and make
//! sure the displaced call still reaches compiled code.

use super::trace_runtime_call;
use crate::arguments::NativeArguments;
use crate::exceptions::{self, EntryResult};
use crate::isolate::Isolate;
use crate::patcher;
use crate::stack::FrameKind;
use lumen_runtime::Value;

/// Patch a static call in optimized code to its target's entry point,
/// compiling the target first if necessary.
/// - No arguments; the faulting call site is found through the caller
///   frame.
/// - Returns the target code.
pub fn patch_static_call(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "PatchStaticCall");
    arguments.expect_count(0);
    let (_, caller_frame) = isolate
        .frames()
        .top_managed_frame()
        .expect("no managed caller frame");
    let caller_code = caller_frame.lookup_code();
    assert!(caller_code.is_optimized());
    let target_function = caller_code
        .static_call_function_at(caller_frame.pc)
        .expect("no static call target recorded at caller pc");
    if !target_function.has_code() {
        isolate
            .compiler()
            .compile_function(isolate, &target_function)
            .map_err(exceptions::propagate_error)?;
    }
    let target_code = target_function
        .current_code()
        .expect("compiled target has no code");
    // Patching is monotone: never re-install the current target.
    assert_ne!(
        patcher::static_call_target_at(caller_frame.pc, &caller_code),
        Some(target_code.entry_point()),
        "patching a static call to its existing target"
    );
    patcher::patch_static_call_at(caller_frame.pc, &caller_code, target_code.entry_point());
    caller_code.set_static_call_code_at(caller_frame.pc, target_code.clone());
    if isolate.flags().trace_patching {
        eprintln!(
            "PatchStaticCall: patching from {} to '{}' {}",
            caller_frame.pc,
            target_function.qualified_name(isolate.class_table()),
            target_code.entry_point()
        );
    }
    arguments.set_return(Value::Code(target_code));
    Ok(())
}

/// First call through a stale static call site after its target's code was
/// detached: recover the target, reattach retained unoptimized code or
/// install the now-current code, and patch.
/// - No arguments; the stale site is found by walking past stub and exit
///   frames to the first managed frame.
/// - Returns the target code.
pub fn fix_callers_target(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "FixCallersTarget");
    arguments.expect_count(0);
    let (_, frame) = isolate
        .frames()
        .first_non_stub_frame()
        .expect("no frame below the patching stub");
    if frame.kind == FrameKind::Entry {
        // A function's current code is always unpatched; entry frames
        // cannot reach a stale site.
        unreachable!("entry frame at a stale static call");
    }
    assert!(frame.is_managed_frame());
    let caller_code = frame.lookup_code();
    assert!(caller_code.is_optimized());
    let target_function = caller_code
        .static_call_function_at(frame.pc)
        .expect("no static call target recorded at stale site");

    let target_code = if target_function.has_code() {
        let code = target_function.current_code().expect("has_code lied");
        patcher::patch_static_call_at(frame.pc, &caller_code, code.entry_point());
        caller_code.set_static_call_code_at(frame.pc, code.clone());
        code
    } else {
        // The code object was detached from the function; the caller's
        // static-call table retained it. Reattach.
        debug_assert!(target_function.unoptimized_code().is_none());
        let code = caller_code
            .static_call_code_at(frame.pc)
            .expect("stale static call retained no code");
        assert!(!code.is_optimized());
        target_function.reattach_code(&code);
        code
    };
    if isolate.flags().trace_patching {
        eprintln!(
            "FixCallersTarget: patching from {} to '{}' {}",
            frame.pc,
            target_function.qualified_name(isolate.class_table()),
            target_code.entry_point()
        );
    }
    debug_assert!(target_function.has_code());
    arguments.set_return(Value::Code(target_code));
    Ok(())
}

// =============================================================================
// Debugger entries
// =============================================================================

/// A breakpoint patched over a runtime-stub call was reached.
/// - Returns the displaced stub address for the caller to continue into.
pub fn breakpoint_runtime_handler(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "BreakpointRuntimeHandler");
    arguments.expect_count(0);
    let (_, caller_frame) = isolate
        .frames()
        .top_managed_frame()
        .expect("no managed caller frame");
    let orig_stub = isolate.debugger().patched_stub_address(caller_frame.pc);
    isolate.debugger().signal_bp_reached();
    arguments.set_return(Value::Smi(orig_stub.0 as i64));
    Ok(())
}

/// A breakpoint at a static call was reached. Make sure the callee is
/// compiled; the stub jumps to its entry without further tests.
/// - Returns the target code.
pub fn breakpoint_static_handler(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "BreakpointStaticHandler");
    arguments.expect_count(0);
    isolate.debugger().signal_bp_reached();
    let (_, caller_frame) = isolate
        .frames()
        .top_managed_frame()
        .expect("no managed caller frame");
    let code = caller_frame.lookup_code();
    assert!(!code.is_optimized());
    let function = patcher::unoptimized_static_call_at(caller_frame.pc, &code)
        .expect("no static call at breakpoint pc");
    if !function.has_code() {
        isolate
            .compiler()
            .compile_function(isolate, &function)
            .map_err(exceptions::propagate_error)?;
    }
    let target_code = function.current_code().expect("compiled target has no code");
    arguments.set_return(Value::Code(target_code));
    Ok(())
}

/// A breakpoint at a return site was reached.
pub fn breakpoint_return_handler(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "BreakpointReturnHandler");
    arguments.expect_count(0);
    isolate.debugger().signal_bp_reached();
    Ok(())
}

/// A breakpoint at a dynamic call was reached.
pub fn breakpoint_dynamic_handler(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "BreakpointDynamicHandler");
    arguments.expect_count(0);
    isolate.debugger().signal_bp_reached();
    Ok(())
}

/// A single step completed.
pub fn single_step_handler(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    trace_runtime_call(isolate, "SingleStepHandler");
    arguments.expect_count(0);
    isolate.debugger().single_step_callback();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Compiler, Debugger};
    use crate::stack::Frame;
    use lumen_core::error::VmResult;
    use lumen_core::ids::{Address, DeoptId};
    use lumen_core::{symbol, RuntimeFlags};
    use lumen_runtime::{cids, Code, DeoptDescriptor, Function, FunctionKind, FunctionRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MintingCompiler;

    impl Compiler for MintingCompiler {
        fn compile_function(&self, _isolate: &Isolate, function: &FunctionRef) -> VmResult<()> {
            function.attach_code(&Code::new_unoptimized(64));
            Ok(())
        }

        fn compile_optimized_function(
            &self,
            _isolate: &Isolate,
            _function: &FunctionRef,
            _osr_id: Option<DeoptId>,
        ) -> VmResult<()> {
            unreachable!()
        }
    }

    fn isolate() -> Isolate {
        let mut isolate = Isolate::new(RuntimeFlags::default());
        isolate.set_compiler(Box::new(MintingCompiler));
        isolate
    }

    /// An optimized caller with a static call site at `entry+16` targeting
    /// `callee`, pushed as the top frame.
    fn optimized_caller(isolate: &Isolate, callee: &FunctionRef) -> (lumen_runtime::CodeRef, Address) {
        let caller_fn = Function::new(
            symbol::intern("caller"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        let unopt = Code::new_unoptimized(64);
        caller_fn.attach_code(&unopt);
        let caller_code = Code::new_optimized(128);
        let call_pc = caller_code.entry_point().offset(16);
        caller_code.add_deopt_descriptor(
            call_pc,
            DeoptDescriptor::trivial(unopt.entry_point()),
        );
        caller_fn.attach_code(&caller_code);
        caller_code.set_static_call_target(call_pc, callee.clone());
        isolate
            .frames()
            .push(Frame::managed(&caller_code, call_pc, 0x1000));
        (caller_code, call_pc)
    }

    #[test]
    fn test_patch_static_call_compiles_and_patches() {
        let isolate = isolate();
        let callee = Function::new(
            symbol::intern("callee"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        let (caller_code, call_pc) = optimized_caller(&isolate, &callee);

        let mut arguments = NativeArguments::new(vec![]);
        patch_static_call(&isolate, &mut arguments).unwrap();

        let target_code = callee.current_code().unwrap();
        assert_eq!(
            patcher::static_call_target_at(call_pc, &caller_code),
            Some(target_code.entry_point())
        );
        assert!(Arc::ptr_eq(
            &caller_code.static_call_code_at(call_pc).unwrap(),
            &target_code
        ));
        assert_eq!(arguments.return_value(), Value::Code(target_code));
    }

    #[test]
    #[should_panic(expected = "existing target")]
    fn test_patch_static_call_never_repatches_same_target() {
        let isolate = isolate();
        let callee = Function::new(
            symbol::intern("callee"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        optimized_caller(&isolate, &callee);

        let mut arguments = NativeArguments::new(vec![]);
        patch_static_call(&isolate, &mut arguments).unwrap();
        // Nothing recompiled in between: patching again must trip the
        // monotonicity assert.
        let mut arguments = NativeArguments::new(vec![]);
        let _ = patch_static_call(&isolate, &mut arguments);
    }

    #[test]
    fn test_patch_static_call_follows_recompilation() {
        let isolate = isolate();
        let callee = Function::new(
            symbol::intern("callee"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        let (caller_code, call_pc) = optimized_caller(&isolate, &callee);

        let mut arguments = NativeArguments::new(vec![]);
        patch_static_call(&isolate, &mut arguments).unwrap();
        let first_entry = patcher::static_call_target_at(call_pc, &caller_code).unwrap();

        // The callee is recompiled (new code object, new entry).
        let recompiled = Code::new_unoptimized(64);
        callee.detach_code();
        callee.reattach_code(&recompiled);

        let mut arguments = NativeArguments::new(vec![]);
        patch_static_call(&isolate, &mut arguments).unwrap();
        let second_entry = patcher::static_call_target_at(call_pc, &caller_code).unwrap();
        assert_ne!(first_entry, second_entry);
        assert_eq!(second_entry, recompiled.entry_point());
    }

    #[test]
    fn test_fix_callers_target_reattaches_detached_code() {
        let isolate = isolate();
        let callee = Function::new(
            symbol::intern("callee"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        let retained = Code::new_unoptimized(64);
        callee.attach_code(&retained);

        let (caller_code, call_pc) = optimized_caller(&isolate, &callee);
        caller_code.set_static_call_code_at(call_pc, retained.clone());
        callee.detach_code();
        assert!(!callee.has_code());

        // The walk passes the patching stub and exit frame.
        isolate.frames().push(Frame::exit(0x900));
        isolate.frames().push(Frame::stub(0x800));

        let mut arguments = NativeArguments::new(vec![]);
        fix_callers_target(&isolate, &mut arguments).unwrap();

        assert!(callee.has_code());
        assert!(Arc::ptr_eq(&callee.current_code().unwrap(), &retained));
        assert_eq!(arguments.return_value(), Value::Code(retained));
    }

    #[test]
    fn test_fix_callers_target_installs_current_code() {
        let isolate = isolate();
        let callee = Function::new(
            symbol::intern("callee"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        let current = Code::new_unoptimized(64);
        callee.attach_code(&current);

        let (caller_code, call_pc) = optimized_caller(&isolate, &callee);
        isolate.frames().push(Frame::stub(0x800));

        let mut arguments = NativeArguments::new(vec![]);
        fix_callers_target(&isolate, &mut arguments).unwrap();

        assert_eq!(
            patcher::static_call_target_at(call_pc, &caller_code),
            Some(current.entry_point())
        );
    }

    #[test]
    fn test_breakpoint_handlers_signal_debugger() {
        struct CountingDebugger {
            reached: AtomicUsize,
            steps: AtomicUsize,
        }

        impl Debugger for CountingDebugger {
            fn signal_bp_reached(&self) {
                self.reached.fetch_add(1, Ordering::Relaxed);
            }
            fn single_step_callback(&self) {
                self.steps.fetch_add(1, Ordering::Relaxed);
            }
            fn patched_stub_address(&self, _pc: Address) -> Address {
                Address(0x7700)
            }
        }

        let debugger = Arc::new(CountingDebugger {
            reached: AtomicUsize::new(0),
            steps: AtomicUsize::new(0),
        });

        struct SharedDebugger(Arc<CountingDebugger>);
        impl Debugger for SharedDebugger {
            fn signal_bp_reached(&self) {
                self.0.signal_bp_reached();
            }
            fn single_step_callback(&self) {
                self.0.single_step_callback();
            }
            fn patched_stub_address(&self, pc: Address) -> Address {
                self.0.patched_stub_address(pc)
            }
        }

        let mut isolate = Isolate::new(RuntimeFlags::default());
        isolate.set_debugger(Box::new(SharedDebugger(debugger.clone())));
        let code = Code::new_unoptimized(64);
        let function = Function::new(
            symbol::intern("f"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        function.attach_code(&code);
        isolate
            .frames()
            .push(Frame::managed(&code, code.entry_point(), 0x1000));

        let mut arguments = NativeArguments::new(vec![]);
        breakpoint_runtime_handler(&isolate, &mut arguments).unwrap();
        assert_eq!(arguments.return_value(), Value::Smi(0x7700));

        let mut arguments = NativeArguments::new(vec![]);
        breakpoint_return_handler(&isolate, &mut arguments).unwrap();
        let mut arguments = NativeArguments::new(vec![]);
        breakpoint_dynamic_handler(&isolate, &mut arguments).unwrap();
        let mut arguments = NativeArguments::new(vec![]);
        single_step_handler(&isolate, &mut arguments).unwrap();

        assert_eq!(debugger.reached.load(Ordering::Relaxed), 3);
        assert_eq!(debugger.steps.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_breakpoint_static_handler_compiles_target() {
        let isolate = isolate();
        let caller_fn = Function::new(
            symbol::intern("caller"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        let caller_code = Code::new_unoptimized(128);
        caller_fn.attach_code(&caller_code);
        let call_pc = caller_code.entry_point().offset(8);
        let callee = Function::new(
            symbol::intern("callee"),
            cids::NULL,
            FunctionKind::Regular,
            0,
        );
        caller_code.set_static_call_target(call_pc, callee.clone());
        isolate
            .frames()
            .push(Frame::managed(&caller_code, call_pc, 0x1000));

        let mut arguments = NativeArguments::new(vec![]);
        breakpoint_static_handler(&isolate, &mut arguments).unwrap();

        assert!(callee.has_code());
        assert_eq!(
            arguments.return_value(),
            Value::Code(callee.current_code().unwrap())
        );
    }
}
