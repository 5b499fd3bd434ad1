//! Collaborator interfaces.
//!
//! The runtime-entry core treats the compiler, the debugger, message
//! handling, and managed-code invocation as external collaborators behind
//! narrow traits. The isolate owns one implementation of each; tests
//! install recording fakes.

use crate::exceptions::Unwind;
use crate::isolate::Isolate;
use lumen_core::error::VmResult;
use lumen_core::ids::{Address, DeoptId};
use lumen_core::{Symbol, VmError};
use lumen_runtime::{ArgsDescRef, ArrayRef, FunctionRef, Value};

// =============================================================================
// Compiler
// =============================================================================

/// The bytecode/IR compiler.
pub trait Compiler: Send + Sync {
    /// Produce unoptimized code for `function` and attach it.
    fn compile_function(&self, isolate: &Isolate, function: &FunctionRef) -> VmResult<()>;

    /// Produce optimized code for `function` and attach it. When `osr_id`
    /// is set, the code is specialized for entry at that deopt point; a
    /// compiler bailout leaves the function's current code unchanged.
    fn compile_optimized_function(
        &self,
        isolate: &Isolate,
        function: &FunctionRef,
        osr_id: Option<DeoptId>,
    ) -> VmResult<()>;
}

/// Placeholder compiler for isolates that never compile (pure dispatch
/// tests). Every request fails.
pub struct UnsupportedCompiler;

impl Compiler for UnsupportedCompiler {
    fn compile_function(&self, isolate: &Isolate, function: &FunctionRef) -> VmResult<()> {
        Err(VmError::compile(
            function.qualified_name(isolate.class_table()),
            "no compiler installed",
        ))
    }

    fn compile_optimized_function(
        &self,
        isolate: &Isolate,
        function: &FunctionRef,
        _osr_id: Option<DeoptId>,
    ) -> VmResult<()> {
        Err(VmError::compile(
            function.qualified_name(isolate.class_table()),
            "no compiler installed",
        ))
    }
}

// =============================================================================
// Debugger
// =============================================================================

/// The debugger front-end. All hooks default to "not debugging".
pub trait Debugger: Send + Sync {
    /// Whether single-stepping is active.
    fn is_stepping(&self) -> bool {
        false
    }

    /// Whether a breakpoint is set inside `function`.
    fn has_breakpoint(&self, _function: &FunctionRef) -> bool {
        false
    }

    /// The original stub address displaced by a breakpoint patch at `pc`.
    fn patched_stub_address(&self, _pc: Address) -> Address {
        Address::ZERO
    }

    /// A breakpoint was reached.
    fn signal_bp_reached(&self) {}

    /// A single step completed.
    fn single_step_callback(&self) {}

    /// The isolate was interrupted via the API.
    fn signal_isolate_interrupted(&self) {}
}

/// Debugger that is never attached.
pub struct NullDebugger;

impl Debugger for NullDebugger {}

// =============================================================================
// Message handling
// =============================================================================

/// Out-of-band message drain, polled from the interrupt path.
pub trait MessageHandler: Send + Sync {
    fn handle_oob_messages(&self) {}
}

/// Message handler for isolates without a message port.
pub struct NullMessageHandler;

impl MessageHandler for NullMessageHandler {}

// =============================================================================
// Managed-code invocation
// =============================================================================

/// Invocation of managed code from inside a runtime entry.
///
/// A managed error result surfaces as the unwind arm; entries propagate it
/// with `?` rather than returning it through the normal path.
pub trait EntryInvoker: Send + Sync {
    /// Invoke `function` with the given arguments array.
    fn invoke_function(
        &self,
        isolate: &Isolate,
        function: &FunctionRef,
        args: &ArrayRef,
        desc: &ArgsDescRef,
    ) -> Result<Value, Unwind>;

    /// Invoke the closure stored at argument 0 of `args`.
    fn invoke_closure(
        &self,
        isolate: &Isolate,
        args: &ArrayRef,
        desc: &ArgsDescRef,
    ) -> Result<Value, Unwind>;

    /// Invoke `receiver.noSuchMethod` with the reified invocation.
    fn invoke_nosuchmethod(
        &self,
        isolate: &Isolate,
        receiver: &Value,
        name: &Symbol,
        args: &ArrayRef,
        desc: &ArgsDescRef,
    ) -> Result<Value, Unwind>;
}

/// Placeholder invoker for isolates that never re-enter managed code.
pub struct UnsupportedInvoker;

impl EntryInvoker for UnsupportedInvoker {
    fn invoke_function(
        &self,
        _isolate: &Isolate,
        function: &FunctionRef,
        _args: &ArrayRef,
        _desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        panic!("no invoker installed (invoking {})", function.name());
    }

    fn invoke_closure(
        &self,
        _isolate: &Isolate,
        _args: &ArrayRef,
        _desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        panic!("no invoker installed (closure call)");
    }

    fn invoke_nosuchmethod(
        &self,
        _isolate: &Isolate,
        _receiver: &Value,
        name: &Symbol,
        _args: &ArrayRef,
        _desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        panic!("no invoker installed (noSuchMethod {name})");
    }
}
