//! The isolate: owner of all per-mutator execution state.
//!
//! One mutator thread runs per isolate; every runtime entry executes
//! synchronously on that thread with the isolate in hand. The isolate owns
//! the heap facade, the class table, the frame stack, the interrupt bits,
//! the megamorphic cache table, the deopt context slot, and the wired-in
//! collaborators.

use crate::deopt::DeoptContext;
use crate::heap::Heap;
use crate::hooks::{
    Compiler, Debugger, EntryInvoker, MessageHandler, NullDebugger, NullMessageHandler,
    UnsupportedCompiler, UnsupportedInvoker,
};
use crate::megamorphic::MegamorphicTable;
use crate::stack::FrameStack;
use bitflags::bitflags;
use lumen_core::RuntimeFlags;
use lumen_runtime::{ClassDecl, ClassTable, ContextRef, Instance, TypeArgsInterner, Value};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

bitflags! {
    /// Pending asynchronous events, drained at the stack-overflow check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptBits: u32 {
        /// The store buffer overflowed; schedule a scavenge.
        const STORE_BUFFER = 1 << 0;
        /// Out-of-band messages are waiting.
        const MESSAGE = 1 << 1;
        /// The embedder interrupted via the API.
        const API = 1 << 2;
        /// A VM-status report was requested.
        const VM_STATUS = 1 << 3;
    }
}

/// Embedder callback run on an API interrupt. Returning `false` asks the
/// VM to stop the isolate.
pub type InterruptCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// Embedder callback run on a VM-status interrupt.
pub type StatusCallback = Box<dyn Fn() + Send + Sync>;

/// Per-mutator execution state.
pub struct Isolate {
    flags: RuntimeFlags,
    heap: Heap,
    class_table: ClassTable,
    type_args_interner: TypeArgsInterner,
    frames: FrameStack,
    interrupts: AtomicU32,
    saved_stack_limit: AtomicU64,
    top_context: RwLock<Option<ContextRef>>,
    stack_overflow_exception: Value,
    megamorphic_table: MegamorphicTable,
    deopt_context: Mutex<Option<DeoptContext>>,
    compiler: Box<dyn Compiler>,
    debugger: Box<dyn Debugger>,
    invoker: Box<dyn EntryInvoker>,
    message_handler: Box<dyn MessageHandler>,
    interrupt_callback: RwLock<Option<InterruptCallback>>,
    vm_status_callback: RwLock<Option<StatusCallback>>,
}

impl Isolate {
    /// Create an isolate with a bootstrapped class table and placeholder
    /// collaborators. Install real ones with the `set_*` methods before
    /// running code that needs them.
    #[must_use]
    pub fn new(flags: RuntimeFlags) -> Self {
        let class_table = ClassTable::bootstrap();
        let overflow_class = class_table.register(ClassDecl {
            name: "StackOverflowError".into(),
            ..Default::default()
        });
        // Preallocated so that a true overflow never allocates.
        let stack_overflow_exception = Value::Instance(Instance::new(overflow_class.id(), 0));

        Self {
            flags,
            heap: Heap::new(),
            class_table,
            type_args_interner: TypeArgsInterner::new(),
            frames: FrameStack::new(),
            interrupts: AtomicU32::new(0),
            saved_stack_limit: AtomicU64::new(0),
            top_context: RwLock::new(None),
            stack_overflow_exception,
            megamorphic_table: MegamorphicTable::new(),
            deopt_context: Mutex::new(None),
            compiler: Box::new(UnsupportedCompiler),
            debugger: Box::new(NullDebugger),
            invoker: Box::new(UnsupportedInvoker),
            message_handler: Box::new(NullMessageHandler),
            interrupt_callback: RwLock::new(None),
            vm_status_callback: RwLock::new(None),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    #[must_use]
    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    #[inline]
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    #[must_use]
    pub fn class_table(&self) -> &ClassTable {
        &self.class_table
    }

    #[inline]
    #[must_use]
    pub fn type_args_interner(&self) -> &TypeArgsInterner {
        &self.type_args_interner
    }

    #[inline]
    #[must_use]
    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    #[inline]
    #[must_use]
    pub fn megamorphic_table(&self) -> &MegamorphicTable {
        &self.megamorphic_table
    }

    #[inline]
    #[must_use]
    pub fn compiler(&self) -> &dyn Compiler {
        &*self.compiler
    }

    #[inline]
    #[must_use]
    pub fn debugger(&self) -> &dyn Debugger {
        &*self.debugger
    }

    #[inline]
    #[must_use]
    pub fn invoker(&self) -> &dyn EntryInvoker {
        &*self.invoker
    }

    #[inline]
    #[must_use]
    pub fn message_handler(&self) -> &dyn MessageHandler {
        &*self.message_handler
    }

    /// The preallocated stack-overflow exception.
    #[must_use]
    pub fn stack_overflow_exception(&self) -> Value {
        self.stack_overflow_exception.clone()
    }

    // =========================================================================
    // Collaborator wiring
    // =========================================================================

    pub fn set_compiler(&mut self, compiler: Box<dyn Compiler>) {
        self.compiler = compiler;
    }

    pub fn set_debugger(&mut self, debugger: Box<dyn Debugger>) {
        self.debugger = debugger;
    }

    pub fn set_invoker(&mut self, invoker: Box<dyn EntryInvoker>) {
        self.invoker = invoker;
    }

    pub fn set_message_handler(&mut self, handler: Box<dyn MessageHandler>) {
        self.message_handler = handler;
    }

    pub fn set_interrupt_callback(&self, callback: Option<InterruptCallback>) {
        *self.interrupt_callback.write() = callback;
    }

    /// Run the API-interrupt callback, if installed.
    #[must_use]
    pub fn run_interrupt_callback(&self) -> Option<bool> {
        self.interrupt_callback.read().as_ref().map(|cb| cb())
    }

    pub fn set_vm_status_callback(&self, callback: Option<StatusCallback>) {
        *self.vm_status_callback.write() = callback;
    }

    /// Run the VM-status callback, if installed.
    pub fn run_vm_status_callback(&self) {
        if let Some(cb) = self.vm_status_callback.read().as_ref() {
            cb();
        }
    }

    // =========================================================================
    // Interrupts and the stack limit
    // =========================================================================

    /// Post interrupt bits; they are drained at the next poll point.
    pub fn schedule_interrupt(&self, bits: InterruptBits) {
        self.interrupts.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Atomically drain all pending interrupt bits.
    #[must_use]
    pub fn get_and_clear_interrupts(&self) -> InterruptBits {
        InterruptBits::from_bits_truncate(self.interrupts.swap(0, Ordering::AcqRel))
    }

    #[inline]
    #[must_use]
    pub fn saved_stack_limit(&self) -> u64 {
        self.saved_stack_limit.load(Ordering::Acquire)
    }

    pub fn set_saved_stack_limit(&self, limit: u64) {
        self.saved_stack_limit.store(limit, Ordering::Release);
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// The context captured when the mutator entered the runtime.
    #[must_use]
    pub fn top_context(&self) -> Option<ContextRef> {
        self.top_context.read().clone()
    }

    pub fn set_top_context(&self, context: Option<ContextRef>) {
        *self.top_context.write() = context;
    }

    // =========================================================================
    // Deopt context
    // =========================================================================

    /// Install the deopt context. Exactly one deoptimization may be in
    /// flight per isolate.
    pub fn install_deopt_context(&self, context: DeoptContext) {
        let mut slot = self.deopt_context.lock();
        assert!(slot.is_none(), "deoptimization already in progress");
        *slot = Some(context);
    }

    /// Take the deopt context out for the materialize phase.
    #[must_use]
    pub fn take_deopt_context(&self) -> Option<DeoptContext> {
        self.deopt_context.lock().take()
    }

    /// Run a closure against the installed deopt context (fill phase).
    pub fn with_deopt_context<R>(&self, f: impl FnOnce(&mut DeoptContext) -> R) -> R {
        let mut slot = self.deopt_context.lock();
        let context = slot.as_mut().expect("no deoptimization in progress");
        f(context)
    }

    /// Whether a deoptimization is between its copy and materialize phases.
    #[must_use]
    pub fn has_deopt_context(&self) -> bool {
        self.deopt_context.lock().is_some()
    }
}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("classes", &self.class_table.len())
            .field("frames", &self.frames.len())
            .field("deopt_in_progress", &self.has_deopt_context())
            .finish()
    }
}
