//! Shared fixtures for the integration suites: an isolate wired with a
//! code-minting compiler and a scripted invoker.

// Each integration binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use lumen_core::error::VmResult;
use lumen_core::ids::DeoptId;
use lumen_core::{symbol, RuntimeFlags, Symbol};
use lumen_runtime::{
    ArgsDescRef, ArrayRef, ClassDecl, ClassRef, Code, DeoptDescriptor, Function, FunctionKind,
    FunctionRef, Value,
};
use lumen_vm::exceptions::Unwind;
use lumen_vm::hooks::{Compiler, EntryInvoker};
use lumen_vm::Isolate;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Compiler that mints code objects: plain unoptimized blobs, and
/// optimized blobs carrying one trivial deopt descriptor back into the
/// function's unoptimized code.
#[derive(Default)]
pub struct TestCompiler {
    pub unoptimized_compiles: AtomicUsize,
    pub optimized_compiles: AtomicUsize,
}

impl Compiler for TestCompiler {
    fn compile_function(&self, _isolate: &Isolate, function: &FunctionRef) -> VmResult<()> {
        self.unoptimized_compiles.fetch_add(1, Ordering::Relaxed);
        function.attach_code(&Code::new_unoptimized(128));
        Ok(())
    }

    fn compile_optimized_function(
        &self,
        _isolate: &Isolate,
        function: &FunctionRef,
        _osr_id: Option<DeoptId>,
    ) -> VmResult<()> {
        self.optimized_compiles.fetch_add(1, Ordering::Relaxed);
        let unoptimized = match function.unoptimized_code() {
            Some(code) => code,
            None => {
                let code = Code::new_unoptimized(128);
                function.attach_code(&code);
                code
            }
        };
        let optimized = Code::new_optimized(256);
        optimized.add_deopt_descriptor(
            optimized.entry_point().offset(8),
            DeoptDescriptor::trivial(unoptimized.entry_point()),
        );
        function.attach_code(&optimized);
        Ok(())
    }
}

/// Shared handle adapter: the isolate takes a box, the test keeps the Arc.
pub struct SharedCompiler(pub Arc<TestCompiler>);

impl Compiler for SharedCompiler {
    fn compile_function(&self, isolate: &Isolate, function: &FunctionRef) -> VmResult<()> {
        self.0.compile_function(isolate, function)
    }

    fn compile_optimized_function(
        &self,
        isolate: &Isolate,
        function: &FunctionRef,
        osr_id: Option<DeoptId>,
    ) -> VmResult<()> {
        self.0.compile_optimized_function(isolate, function, osr_id)
    }
}

/// Invoker that records every invocation and returns a canned value.
pub struct RecordingInvoker {
    pub result: Value,
    pub invoked: Mutex<Vec<(Symbol, usize)>>,
}

impl RecordingInvoker {
    pub fn new(result: Value) -> Arc<Self> {
        Arc::new(Self {
            result,
            invoked: Mutex::new(Vec::new()),
        })
    }
}

impl EntryInvoker for RecordingInvoker {
    fn invoke_function(
        &self,
        _isolate: &Isolate,
        function: &FunctionRef,
        args: &ArrayRef,
        _desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        self.invoked.lock().push((function.name().clone(), args.len()));
        Ok(self.result.clone())
    }

    fn invoke_closure(
        &self,
        _isolate: &Isolate,
        args: &ArrayRef,
        _desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        self.invoked
            .lock()
            .push((symbol::intern("call"), args.len()));
        Ok(self.result.clone())
    }

    fn invoke_nosuchmethod(
        &self,
        _isolate: &Isolate,
        _receiver: &Value,
        name: &Symbol,
        args: &ArrayRef,
        _desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        self.invoked.lock().push((name.clone(), args.len()));
        Ok(self.result.clone())
    }
}

pub struct SharedInvoker(pub Arc<RecordingInvoker>);

impl EntryInvoker for SharedInvoker {
    fn invoke_function(
        &self,
        isolate: &Isolate,
        function: &FunctionRef,
        args: &ArrayRef,
        desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        self.0.invoke_function(isolate, function, args, desc)
    }

    fn invoke_closure(
        &self,
        isolate: &Isolate,
        args: &ArrayRef,
        desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        self.0.invoke_closure(isolate, args, desc)
    }

    fn invoke_nosuchmethod(
        &self,
        isolate: &Isolate,
        receiver: &Value,
        name: &Symbol,
        args: &ArrayRef,
        desc: &ArgsDescRef,
    ) -> Result<Value, Unwind> {
        self.0.invoke_nosuchmethod(isolate, receiver, name, args, desc)
    }
}

/// An isolate wired with a fresh `TestCompiler`.
pub fn test_isolate() -> (Isolate, Arc<TestCompiler>) {
    test_isolate_with_flags(RuntimeFlags::default())
}

pub fn test_isolate_with_flags(flags: RuntimeFlags) -> (Isolate, Arc<TestCompiler>) {
    let mut isolate = Isolate::new(flags);
    let compiler = Arc::new(TestCompiler::default());
    isolate.set_compiler(Box::new(SharedCompiler(compiler.clone())));
    (isolate, compiler)
}

/// Register a class with no supertypes.
pub fn register_class(isolate: &Isolate, name: &str) -> ClassRef {
    isolate.class_table().register(ClassDecl {
        name: name.into(),
        ..Default::default()
    })
}

/// Add a method of the given arity to a class.
pub fn add_method(class: &ClassRef, name: &str, arity: usize) -> FunctionRef {
    let function = Function::new(symbol::intern(name), class.id(), FunctionKind::Regular, arity);
    class.add_function(function.clone());
    function
}
