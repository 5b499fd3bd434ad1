//! The deoptimizer.
//!
//! Deoptimization is lazy. `deoptimize_at` only *schedules*: it marks the
//! optimized code dead and patches the call at the faulting pc to the
//! code's lazy-deopt trampoline. When the frame later returns, the
//! trampoline runs three runtime entries in order:
//!
//! 1. `deoptimize_copy_frame` (leaf) copies the registers the stub saved
//!    into fixed-size buffers, binds a `DeoptContext` to the isolate, and
//!    reports how many extra bytes the unoptimized frame needs.
//! 2. `deoptimize_fill_frame` (leaf) rebuilds the unoptimized frame's
//!    slots from the descriptor's layout program, recording (but not yet
//!    allocating) objects the optimizer had elided.
//! 3. `deoptimize_materialize` allocates the deferred objects, patches the
//!    frame slots that reference them, destroys the context, and reports
//!    how many synthetic argument bytes to strip.
//!
//! The leaf entries may not allocate through the heap facade and may not
//! safepoint; only the materialize phase is allocation-capable.

use crate::arguments::NativeArguments;
use crate::exceptions::EntryResult;
use crate::isolate::Isolate;
use crate::patcher;
use crate::stack::{ManagedFrameIterator, Frame, FrameId};
use lumen_core::ids::{Address, ClassId};
use lumen_runtime::{CodeRef, DeoptDescriptor, DeoptInstr, Value};

/// Number of general-purpose registers the lazy-deopt stub saves.
pub const NUM_CPU_REGISTERS: usize = 16;
/// Number of floating-point registers the lazy-deopt stub saves.
pub const NUM_FPU_REGISTERS: usize = 16;
/// Bytes per stack slot.
pub const WORD_SIZE: i64 = 8;

// =============================================================================
// Saved registers
// =============================================================================

/// The register file the lazy-deopt stub spilled below the frame.
#[derive(Debug, Clone)]
pub struct SavedRegisters {
    pub cpu: Vec<Value>,
    pub fpu: Vec<f64>,
}

impl SavedRegisters {
    #[must_use]
    pub fn new(cpu: Vec<Value>, fpu: Vec<f64>) -> Self {
        assert_eq!(cpu.len(), NUM_CPU_REGISTERS);
        assert_eq!(fpu.len(), NUM_FPU_REGISTERS);
        Self { cpu, fpu }
    }

    /// An all-null register file.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            cpu: vec![Value::Null; NUM_CPU_REGISTERS],
            fpu: vec![0.0; NUM_FPU_REGISTERS],
        }
    }

    /// Place `value` in general-purpose register `index`.
    #[must_use]
    pub fn with_cpu(mut self, index: usize, value: Value) -> Self {
        self.cpu[index] = value;
        self
    }

    /// Place `value` in floating-point register `index`.
    #[must_use]
    pub fn with_fpu(mut self, index: usize, value: f64) -> Self {
        self.fpu[index] = value;
        self
    }
}

// =============================================================================
// Deopt context
// =============================================================================

/// A deferred object: the frame slot awaiting it and the materialization
/// recipe to build it from.
#[derive(Debug, Clone, Copy)]
struct DeferredObject {
    slot_index: usize,
    spec_index: usize,
}

/// Transient state of one in-flight deoptimization. Installed on the
/// isolate by the copy phase and destroyed by the materialize phase.
pub struct DeoptContext {
    code: CodeRef,
    descriptor: DeoptDescriptor,
    cpu_registers: Vec<Value>,
    fpu_registers: Vec<f64>,
    /// The optimized frame's slots, copied while GC is disabled.
    source_slots: Vec<Value>,
    /// The frame being rebuilt.
    frame_id: FrameId,
    source_sp: u64,
    deferred: Vec<DeferredObject>,
}

impl DeoptContext {
    /// The optimized code being deoptimized.
    #[must_use]
    pub fn code(&self) -> &CodeRef {
        &self.code
    }

    /// Slot count of the unoptimized frame being rebuilt.
    #[must_use]
    pub fn dest_frame_size(&self) -> usize {
        self.descriptor.frame_layout.len()
    }

    /// Bytes by which the unoptimized frame exceeds the optimized one.
    #[must_use]
    pub fn dest_stack_adjustment(&self) -> i64 {
        let delta = self.dest_frame_size() as i64 - self.source_slots.len() as i64;
        delta.max(0) * WORD_SIZE
    }

    /// Resolve one non-materializing slot source.
    fn resolve_source(&self, instr: &DeoptInstr) -> Value {
        match instr {
            DeoptInstr::CpuRegister(index) => self.cpu_registers[*index as usize].clone(),
            DeoptInstr::FpuRegister(index) => Value::Double(self.fpu_registers[*index as usize]),
            DeoptInstr::StackSlot(index) => self.source_slots[*index as usize].clone(),
            DeoptInstr::Constant(value) => value.clone(),
            DeoptInstr::Materialized(_) => {
                panic!("materialized source resolved outside the materialize phase")
            }
        }
    }
}

impl std::fmt::Debug for DeoptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeoptContext")
            .field("frame_id", &self.frame_id)
            .field("dest_frame_size", &self.dest_frame_size())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

// =============================================================================
// Scheduling
// =============================================================================

/// Schedule lazy deoptimization of the frame running `optimized_code` at
/// `pc`: swap the function back to its unoptimized code, patch the call at
/// `pc` to the lazy-deopt trampoline, and mark the code dead. Idempotent.
pub fn deoptimize_at(isolate: &Isolate, optimized_code: &CodeRef, pc: Address) {
    assert!(optimized_code.is_optimized());
    let descriptor = optimized_code
        .deopt_descriptor_at(pc)
        .expect("no deopt descriptor at deoptimizing pc");
    let function = optimized_code.function();
    let unoptimized = function
        .unoptimized_code()
        .expect("deoptimizing function has no unoptimized code");
    debug_assert!(!unoptimized.is_optimized());
    // The switch to unoptimized code may have already occurred.
    if function.has_optimized_code() {
        function.switch_to_unoptimized_code();
        function.increment_deoptimization_counter();
    }
    // Lazy deoptimization is rare; patching the same site twice is fine.
    let lazy_deopt = optimized_code.lazy_deopt_return();
    assert!(lazy_deopt.is_set());
    patcher::insert_call_at(optimized_code, pc, lazy_deopt);
    optimized_code.set_alive(false);

    if isolate.flags().trace_deoptimization {
        eprintln!(
            "DeoptimizeAt: {} at {pc} ({})",
            function.qualified_name(isolate.class_table()),
            descriptor.reason.as_str()
        );
    }
}

/// Deoptimize every optimized frame on the stack.
pub fn deoptimize_all(isolate: &Isolate) {
    let mut frames = Vec::new();
    {
        let mut walker = ManagedFrameIterator::new(isolate.frames());
        while let Some((_, frame)) = walker.next_frame() {
            let code = frame.lookup_code();
            if code.is_optimized() {
                frames.push((code, frame.pc));
            }
        }
    }
    for (code, pc) in frames {
        deoptimize_at(isolate, &code, pc);
    }
}

/// Deoptimize optimized frames whose function's owning class is in
/// `classes` (class-hierarchy invalidation).
pub fn deoptimize_if_owner(isolate: &Isolate, classes: &[ClassId]) {
    let mut frames = Vec::new();
    {
        let mut walker = ManagedFrameIterator::new(isolate.frames());
        while let Some((_, frame)) = walker.next_frame() {
            let code = frame.lookup_code();
            if code.is_optimized() && classes.contains(&code.function().owner()) {
                frames.push((code, frame.pc));
            }
        }
    }
    for (code, pc) in frames {
        deoptimize_at(isolate, &code, pc);
    }
}

/// Debugging aid: when `deoptimize_alot` is set, native-exit sites call
/// this to deoptimize every live frame before returning to managed code.
pub fn maybe_deoptimize_alot(isolate: &Isolate) {
    if isolate.flags().deoptimize_alot {
        deoptimize_all(isolate);
    }
}

// =============================================================================
// Phase 1: copy
// =============================================================================

/// Leaf entry: copy the stub-saved registers, bind the deopt context, and
/// return the byte size by which the unoptimized frame will exceed the
/// optimized frame.
///
/// Runs with GC disabled; it must not allocate through the heap facade.
pub fn deoptimize_copy_frame(
    isolate: &Isolate,
    saved_registers: SavedRegisters,
    last_fp: FrameId,
) -> i64 {
    let (frame_id, frame) = {
        let mut walker = ManagedFrameIterator::starting_at(isolate.frames(), last_fp);
        walker.next_frame().expect("no frame to deoptimize")
    };
    let optimized_code = frame.lookup_code();
    assert!(optimized_code.is_optimized());
    let descriptor = optimized_code
        .deopt_descriptor_at(frame.pc)
        .expect("no deopt descriptor at frame pc");

    let context = DeoptContext {
        code: optimized_code,
        descriptor,
        cpu_registers: saved_registers.cpu,
        fpu_registers: saved_registers.fpu,
        source_slots: frame.slots.clone(),
        frame_id,
        source_sp: frame.sp,
        deferred: Vec::new(),
    };
    let adjustment = context.dest_stack_adjustment();
    isolate.install_deopt_context(context);

    if isolate.flags().trace_deoptimization_verbose {
        eprintln!("deopt copy frame: stack adjustment {adjustment} bytes");
    }
    adjustment
}

// =============================================================================
// Phase 2: fill
// =============================================================================

/// Leaf entry: rebuild the unoptimized frame's slots from the descriptor's
/// layout program. The stub has already widened the stack.
///
/// Deferred objects are recorded, not allocated; their slots hold null
/// until the materialize phase patches them.
pub fn deoptimize_fill_frame(isolate: &Isolate, last_fp: FrameId) {
    isolate.with_deopt_context(|context| {
        debug_assert_eq!(context.frame_id, last_fp);

        let function = context.code.function();
        let unoptimized = function
            .unoptimized_code()
            .expect("deoptimizing function lost its unoptimized code");
        debug_assert!(!unoptimized.is_optimized());

        let mut slots = Vec::with_capacity(context.descriptor.frame_layout.len());
        let mut deferred = Vec::new();
        for (slot_index, instr) in context.descriptor.frame_layout.iter().enumerate() {
            match instr {
                DeoptInstr::Materialized(spec_index) => {
                    deferred.push(DeferredObject {
                        slot_index,
                        spec_index: *spec_index as usize,
                    });
                    slots.push(Value::Null);
                }
                other => slots.push(context.resolve_source(other)),
            }
        }
        context.deferred = deferred;

        let rebuilt = Frame::managed(&unoptimized, context.descriptor.target_pc, context.source_sp)
            .with_slots(slots);
        isolate.frames().replace(context.frame_id, rebuilt);
    });
}

// =============================================================================
// Phase 3: materialize
// =============================================================================

/// Normal entry: allocate the deferred objects, patch the rebuilt frame,
/// tear the deopt context down, and return (as a smi) the number of bytes
/// of synthetic arguments the stub must strip from the expression stack.
pub fn deoptimize_materialize(isolate: &Isolate, arguments: &mut NativeArguments) -> EntryResult {
    arguments.expect_count(0);
    let context = isolate
        .take_deopt_context()
        .expect("materialize without a deopt context");

    for deferred in &context.deferred {
        let spec = &context.descriptor.materializations[deferred.spec_index];
        let class = isolate.class_table().get(spec.class_id);
        let instance = isolate.heap().allocate_instance(&class);
        for (field_index, source) in spec.field_sources.iter().enumerate() {
            instance.set_field(field_index, context.resolve_source(source));
        }
        isolate
            .frames()
            .set_slot(context.frame_id, deferred.slot_index, Value::Instance(instance));
    }

    if isolate.flags().trace_deoptimization {
        eprintln!(
            "deopt materialize: {} deferred object(s)",
            context.deferred.len()
        );
    }

    let deopt_arg_bytes = context.deferred.len() as i64 * WORD_SIZE;
    arguments.set_return(Value::Smi(deopt_arg_bytes));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::ids::DeoptId;
    use lumen_core::{symbol, RuntimeFlags};
    use lumen_runtime::{Code, DeoptReason, Function, FunctionKind, MaterializationSpec};
    use std::sync::Arc;

    fn isolate() -> Isolate {
        Isolate::new(RuntimeFlags::default())
    }

    /// A function with unoptimized code and an optimized variant carrying
    /// one deopt descriptor at `entry+16`.
    fn optimized_function(
        isolate: &Isolate,
        layout: Vec<DeoptInstr>,
        materializations: Vec<MaterializationSpec>,
    ) -> (lumen_runtime::FunctionRef, CodeRef, Address) {
        let class = isolate.class_table().register(lumen_runtime::ClassDecl {
            name: "Host".into(),
            ..Default::default()
        });
        let function = Function::new(
            symbol::intern("hot"),
            class.id(),
            FunctionKind::Regular,
            0,
        );
        let unopt = Code::new_unoptimized(128);
        function.attach_code(&unopt);

        let opt = Code::new_optimized(256);
        let deopt_pc = opt.entry_point().offset(16);
        opt.add_deopt_descriptor(
            deopt_pc,
            DeoptDescriptor {
                deopt_id: DeoptId(1),
                reason: DeoptReason::TypeGuard,
                target_pc: unopt.entry_point().offset(8),
                frame_layout: layout,
                materializations,
            },
        );
        function.attach_code(&opt);
        (function, opt, deopt_pc)
    }

    #[test]
    fn test_deoptimize_at_patches_and_kills() {
        let isolate = isolate();
        let (function, opt, pc) = optimized_function(&isolate, Vec::new(), Vec::new());

        deoptimize_at(&isolate, &opt, pc);

        assert!(!opt.is_alive());
        assert_eq!(
            opt.instructions().call_target_at(pc),
            Some(opt.lazy_deopt_return())
        );
        assert!(!function.has_optimized_code());
        assert_eq!(function.deoptimization_counter(), 1);
    }

    #[test]
    fn test_deoptimize_at_is_idempotent() {
        let isolate = isolate();
        let (function, opt, pc) = optimized_function(&isolate, Vec::new(), Vec::new());

        deoptimize_at(&isolate, &opt, pc);
        deoptimize_at(&isolate, &opt, pc);

        assert!(!opt.is_alive());
        // The counter moves only on the actual switch.
        assert_eq!(function.deoptimization_counter(), 1);
    }

    #[test]
    fn test_three_phase_roundtrip() {
        let isolate = isolate();
        let (_, opt, pc) = optimized_function(
            &isolate,
            vec![
                DeoptInstr::CpuRegister(0),
                DeoptInstr::StackSlot(0),
                DeoptInstr::Constant(Value::Smi(99)),
                DeoptInstr::FpuRegister(1),
            ],
            Vec::new(),
        );

        let frame_id = isolate.frames().push(
            Frame::managed(&opt, pc, 0x8000).with_slots(vec![Value::Smi(7)]),
        );

        let saved = SavedRegisters::empty()
            .with_cpu(0, Value::Smi(41))
            .with_fpu(1, 2.5);
        let adjustment = deoptimize_copy_frame(&isolate, saved, frame_id);
        assert!(isolate.has_deopt_context());
        // Four slots rebuilt from a one-slot frame.
        assert_eq!(adjustment, 3 * WORD_SIZE);

        deoptimize_fill_frame(&isolate, frame_id);
        let rebuilt = isolate.frames().frame(frame_id);
        assert!(!rebuilt.lookup_code().is_optimized());
        assert_eq!(rebuilt.slots[0], Value::Smi(41));
        assert_eq!(rebuilt.slots[1], Value::Smi(7));
        assert_eq!(rebuilt.slots[2], Value::Smi(99));
        assert_eq!(rebuilt.slots[3], Value::Double(2.5));

        let mut args = NativeArguments::new(vec![]);
        deoptimize_materialize(&isolate, &mut args).unwrap();
        assert!(!isolate.has_deopt_context());
        assert_eq!(args.return_value(), Value::Smi(0));
    }

    #[test]
    fn test_materialization_allocates_deferred_objects() {
        let isolate = isolate();
        let point = isolate.class_table().register(lumen_runtime::ClassDecl {
            name: "Point".into(),
            num_fields: 2,
            ..Default::default()
        });
        let (_, opt, pc) = optimized_function(
            &isolate,
            vec![DeoptInstr::Materialized(0), DeoptInstr::CpuRegister(2)],
            vec![MaterializationSpec {
                class_id: point.id(),
                field_sources: vec![
                    DeoptInstr::Constant(Value::Smi(3)),
                    DeoptInstr::CpuRegister(1),
                ],
            }],
        );

        let frame_id = isolate
            .frames()
            .push(Frame::managed(&opt, pc, 0x8000).with_slots(Vec::new()));

        let saved = SavedRegisters::empty()
            .with_cpu(1, Value::Smi(4))
            .with_cpu(2, Value::Bool(true));
        deoptimize_copy_frame(&isolate, saved, frame_id);
        deoptimize_fill_frame(&isolate, frame_id);

        // Before materialization the deferred slot is null.
        assert_eq!(isolate.frames().frame(frame_id).slots[0], Value::Null);

        let mut args = NativeArguments::new(vec![]);
        deoptimize_materialize(&isolate, &mut args).unwrap();

        let rebuilt = isolate.frames().frame(frame_id);
        match &rebuilt.slots[0] {
            Value::Instance(inst) => {
                assert_eq!(inst.cid(), point.id());
                assert_eq!(inst.field_at(0), Value::Smi(3));
                assert_eq!(inst.field_at(1), Value::Smi(4));
            }
            other => panic!("expected materialized instance, got {other:?}"),
        }
        assert_eq!(rebuilt.slots[1], Value::Bool(true));
        assert_eq!(args.return_value(), Value::Smi(WORD_SIZE));
        assert!(!isolate.has_deopt_context());
    }

    #[test]
    fn test_deoptimize_all_covers_every_optimized_frame() {
        let isolate = isolate();
        let (_, opt_a, pc_a) = optimized_function(&isolate, Vec::new(), Vec::new());
        let (_, opt_b, pc_b) = optimized_function(&isolate, Vec::new(), Vec::new());
        let unopt = Code::new_unoptimized(64);
        let plain = Function::new(
            symbol::intern("cold"),
            lumen_runtime::cids::NULL,
            FunctionKind::Regular,
            0,
        );
        plain.attach_code(&unopt);

        isolate.frames().push(Frame::managed(&opt_a, pc_a, 0x3000));
        isolate
            .frames()
            .push(Frame::managed(&unopt, unopt.entry_point(), 0x2000));
        isolate.frames().push(Frame::managed(&opt_b, pc_b, 0x1000));

        deoptimize_all(&isolate);
        assert!(!opt_a.is_alive());
        assert!(!opt_b.is_alive());
        assert!(unopt.is_alive());

        // Second application finds the same frames already patched.
        deoptimize_all(&isolate);
        assert_eq!(
            opt_a.instructions().call_target_at(pc_a),
            Some(opt_a.lazy_deopt_return())
        );
    }

    #[test]
    fn test_deoptimize_if_owner_filters_by_class() {
        let isolate = isolate();
        let (fn_a, opt_a, pc_a) = optimized_function(&isolate, Vec::new(), Vec::new());
        let (_, opt_b, pc_b) = optimized_function(&isolate, Vec::new(), Vec::new());

        isolate.frames().push(Frame::managed(&opt_a, pc_a, 0x2000));
        isolate.frames().push(Frame::managed(&opt_b, pc_b, 0x1000));

        deoptimize_if_owner(&isolate, &[fn_a.owner()]);
        assert!(!opt_a.is_alive());
        assert!(opt_b.is_alive());
    }

    #[test]
    fn test_saved_registers_shape() {
        let saved = SavedRegisters::empty();
        assert_eq!(saved.cpu.len(), NUM_CPU_REGISTERS);
        assert_eq!(saved.fpu.len(), NUM_FPU_REGISTERS);
    }

    #[test]
    #[should_panic(expected = "deoptimization already in progress")]
    fn test_single_deopt_context_per_isolate() {
        let isolate = isolate();
        let (_, opt, pc) = optimized_function(&isolate, Vec::new(), Vec::new());
        let frame_id = isolate.frames().push(Frame::managed(&opt, pc, 0x1000));

        deoptimize_copy_frame(&isolate, SavedRegisters::empty(), frame_id);
        deoptimize_copy_frame(&isolate, SavedRegisters::empty(), frame_id);
    }

    #[test]
    fn test_maybe_deoptimize_alot() {
        let mut flags = RuntimeFlags::default();
        flags.deoptimize_alot = true;
        let isolate = Isolate::new(flags);
        let (_, opt, pc) = optimized_function(&isolate, Vec::new(), Vec::new());
        isolate.frames().push(Frame::managed(&opt, pc, 0x1000));

        maybe_deoptimize_alot(&isolate);
        assert!(!opt.is_alive());
    }

    #[test]
    fn test_deopt_context_not_installed_for_unrelated_isolate() {
        let a = isolate();
        let b = isolate();
        let (_, opt, pc) = optimized_function(&a, Vec::new(), Vec::new());
        let frame_id = a.frames().push(Frame::managed(&opt, pc, 0x1000));

        deoptimize_copy_frame(&a, SavedRegisters::empty(), frame_id);
        assert!(a.has_deopt_context());
        assert!(!b.has_deopt_context());

        // Clean up so the context does not outlive the test.
        let _ = Arc::strong_count(&opt);
        let _ = a.take_deopt_context();
    }
}
