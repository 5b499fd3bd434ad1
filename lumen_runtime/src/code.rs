//! Compiled code objects.
//!
//! A `Code` ties an instruction blob to its function and carries the side
//! tables the runtime entries consult: the deopt-descriptor table (pc to
//! frame-rebuild program), the static-call-target table (pc to callee), and
//! the OSR table (pc to deopt id). Instructions are modeled as an address
//! range with a patchable call-site map; the code patcher rewrites entries
//! in that map the way a real patcher rewrites call immediates.

use crate::function::FunctionRef;
use crate::value::Value;
use lumen_core::ids::{Address, ClassId, DeoptId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Shared handle to a code object.
pub type CodeRef = Arc<Code>;

// =============================================================================
// Instructions
// =============================================================================

/// Bump allocator for the modeled code address space. Blobs never overlap.
static NEXT_CODE_ADDRESS: AtomicU64 = AtomicU64::new(0x0001_0000);

/// A compiled instruction blob: an address range plus the call sites inside
/// it, each mapping a call pc to its current target entry point.
pub struct Instructions {
    base: Address,
    size: u64,
    calls: RwLock<FxHashMap<Address, Address>>,
}

impl Instructions {
    fn allocate(size: u64) -> Self {
        debug_assert!(size > 0);
        let aligned = (size + 63) & !63;
        let base = NEXT_CODE_ADDRESS.fetch_add(aligned, Ordering::Relaxed);
        Self {
            base: Address(base),
            size,
            calls: RwLock::new(FxHashMap::default()),
        }
    }

    /// First address of the blob; also the entry point.
    #[inline]
    #[must_use]
    pub fn entry_point(&self) -> Address {
        self.base
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `pc` falls inside this blob.
    #[inline]
    #[must_use]
    pub fn contains(&self, pc: Address) -> bool {
        pc >= self.base && pc.0 < self.base.0 + self.size
    }

    /// Current target of the call instruction at `pc`.
    #[must_use]
    pub fn call_target_at(&self, pc: Address) -> Option<Address> {
        self.calls.read().get(&pc).copied()
    }

    /// Rewrite (or install) the call instruction at `pc`.
    pub fn set_call_target(&self, pc: Address, target: Address) {
        debug_assert!(self.contains(pc));
        self.calls.write().insert(pc, target);
    }
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instructions")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

// =============================================================================
// Deopt metadata
// =============================================================================

/// Why an optimized frame is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeoptReason {
    Unknown = 0,
    TypeGuard = 1,
    IntegerOverflow = 2,
    BoundsCheck = 3,
    PolymorphicCall = 4,
    Uncommon = 5,
}

impl DeoptReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DeoptReason::Unknown => "Unknown",
            DeoptReason::TypeGuard => "TypeGuard",
            DeoptReason::IntegerOverflow => "IntegerOverflow",
            DeoptReason::BoundsCheck => "BoundsCheck",
            DeoptReason::PolymorphicCall => "PolymorphicCall",
            DeoptReason::Uncommon => "Uncommon",
        }
    }
}

/// One slot-filling instruction of a deopt descriptor: where the value of
/// an unoptimized frame slot comes from.
#[derive(Debug, Clone)]
pub enum DeoptInstr {
    /// A saved general-purpose register, by index.
    CpuRegister(u8),
    /// A saved floating-point register, by index.
    FpuRegister(u8),
    /// A slot of the optimized frame.
    StackSlot(u16),
    /// A compile-time constant.
    Constant(Value),
    /// A sunken allocation; index into the descriptor's materializations.
    Materialized(u16),
}

/// Recipe for rebuilding an allocation the optimizer elided.
#[derive(Debug, Clone)]
pub struct MaterializationSpec {
    pub class_id: ClassId,
    /// One source per field. Nested materializations are not supported.
    pub field_sources: Vec<DeoptInstr>,
}

/// Compiler-emitted metadata mapping an optimized pc to the instructions
/// for rebuilding the corresponding unoptimized frame.
#[derive(Debug, Clone)]
pub struct DeoptDescriptor {
    pub deopt_id: DeoptId,
    pub reason: DeoptReason,
    /// Pc in the unoptimized code where execution resumes.
    pub target_pc: Address,
    /// One source per slot of the unoptimized frame, bottom to top.
    pub frame_layout: Vec<DeoptInstr>,
    pub materializations: Vec<MaterializationSpec>,
}

impl DeoptDescriptor {
    /// A descriptor that rebuilds an empty frame at `target_pc`. Enough for
    /// call sites that keep no live state.
    #[must_use]
    pub fn trivial(target_pc: Address) -> Self {
        Self {
            deopt_id: DeoptId(0),
            reason: DeoptReason::Unknown,
            target_pc,
            frame_layout: Vec::new(),
            materializations: Vec::new(),
        }
    }
}

// =============================================================================
// Static-call table
// =============================================================================

/// An entry of the static-call-target table: the callee function and, once
/// patched, the concrete code object the site points at.
#[derive(Debug, Clone)]
pub struct StaticCallEntry {
    pub function: FunctionRef,
    pub code: Option<CodeRef>,
}

// =============================================================================
// Code
// =============================================================================

/// Offset of the lazy-deopt trampoline from the end of an optimized blob.
const LAZY_DEOPT_TAIL: u64 = 8;

/// A compiled instruction blob tied to a function.
pub struct Code {
    function: RwLock<Weak<crate::function::Function>>,
    instructions: Instructions,
    is_optimized: bool,
    is_alive: AtomicBool,
    lazy_deopt_return: Address,
    deopt_table: RwLock<FxHashMap<Address, DeoptDescriptor>>,
    static_calls: RwLock<FxHashMap<Address, StaticCallEntry>>,
    osr_table: RwLock<FxHashMap<Address, DeoptId>>,
}

impl Code {
    /// Allocate an unoptimized code object of the given blob size.
    #[must_use]
    pub fn new_unoptimized(size: u64) -> CodeRef {
        Arc::new(Self::new(size, false))
    }

    /// Allocate an optimized code object. Its lazy-deopt trampoline sits at
    /// the end of the blob. At least one deopt descriptor must be added
    /// before the code is attached to a function.
    #[must_use]
    pub fn new_optimized(size: u64) -> CodeRef {
        Arc::new(Self::new(size, true))
    }

    fn new(size: u64, is_optimized: bool) -> Self {
        let instructions = Instructions::allocate(size);
        let lazy_deopt_return = if is_optimized {
            Address(instructions.entry_point().0 + size - LAZY_DEOPT_TAIL)
        } else {
            Address::ZERO
        };
        Self {
            function: RwLock::new(Weak::new()),
            instructions,
            is_optimized,
            is_alive: AtomicBool::new(true),
            lazy_deopt_return,
            deopt_table: RwLock::new(FxHashMap::default()),
            static_calls: RwLock::new(FxHashMap::default()),
            osr_table: RwLock::new(FxHashMap::default()),
        }
    }

    /// Set the function back-pointer. Called from `Function::attach_code`.
    pub(crate) fn bind_function(&self, function: &FunctionRef) {
        if self.is_optimized {
            // An optimized code object must be deoptimizable from the start.
            debug_assert!(self.lazy_deopt_return.is_set());
            debug_assert!(
                !self.deopt_table.read().is_empty(),
                "optimized code attached without deopt descriptors"
            );
        }
        *self.function.write() = Arc::downgrade(function);
    }

    /// The function this code belongs to.
    #[must_use]
    pub fn function(&self) -> FunctionRef {
        self.function
            .read()
            .upgrade()
            .expect("code object outlived its function")
    }

    #[inline]
    #[must_use]
    pub fn entry_point(&self) -> Address {
        self.instructions.entry_point()
    }

    #[inline]
    #[must_use]
    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    #[inline]
    #[must_use]
    pub fn is_optimized(&self) -> bool {
        self.is_optimized
    }

    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// Mark dead code; the GC may skip its embedded objects.
    #[inline]
    pub fn set_alive(&self, alive: bool) {
        self.is_alive.store(alive, Ordering::Release);
    }

    /// Address of the lazy-deopt trampoline; zero for unoptimized code.
    #[inline]
    #[must_use]
    pub fn lazy_deopt_return(&self) -> Address {
        self.lazy_deopt_return
    }

    // =========================================================================
    // Deopt descriptors
    // =========================================================================

    pub fn add_deopt_descriptor(&self, pc: Address, descriptor: DeoptDescriptor) {
        debug_assert!(self.is_optimized);
        debug_assert!(self.instructions.contains(pc));
        self.deopt_table.write().insert(pc, descriptor);
    }

    #[must_use]
    pub fn deopt_descriptor_at(&self, pc: Address) -> Option<DeoptDescriptor> {
        self.deopt_table.read().get(&pc).cloned()
    }

    #[must_use]
    pub fn has_deopt_descriptors(&self) -> bool {
        !self.deopt_table.read().is_empty()
    }

    // =========================================================================
    // Static-call targets
    // =========================================================================

    /// Record the statically known callee of the call site at `pc`.
    pub fn set_static_call_target(&self, pc: Address, function: FunctionRef) {
        debug_assert!(self.instructions.contains(pc));
        self.static_calls
            .write()
            .insert(pc, StaticCallEntry { function, code: None });
    }

    #[must_use]
    pub fn static_call_function_at(&self, pc: Address) -> Option<FunctionRef> {
        self.static_calls.read().get(&pc).map(|e| e.function.clone())
    }

    /// Record the code object a patched static call now points at.
    pub fn set_static_call_code_at(&self, pc: Address, code: CodeRef) {
        let mut calls = self.static_calls.write();
        let entry = calls
            .get_mut(&pc)
            .expect("static-call code recorded for unknown call site");
        entry.code = Some(code);
    }

    #[must_use]
    pub fn static_call_code_at(&self, pc: Address) -> Option<CodeRef> {
        self.static_calls.read().get(&pc).and_then(|e| e.code.clone())
    }

    // =========================================================================
    // OSR table
    // =========================================================================

    /// Record that the loop header at `pc` can be entered via OSR with the
    /// given deopt id.
    pub fn add_osr_entry(&self, pc: Address, deopt_id: DeoptId) {
        debug_assert!(!self.is_optimized);
        debug_assert!(self.instructions.contains(pc));
        self.osr_table.write().insert(pc, deopt_id);
    }

    #[must_use]
    pub fn deopt_id_for_osr(&self, pc: Address) -> Option<DeoptId> {
        self.osr_table.read().get(&pc).copied()
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Code")
            .field("entry_point", &self.entry_point())
            .field("is_optimized", &self.is_optimized)
            .field("is_alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Function, FunctionKind};
    use lumen_core::symbol;

    #[test]
    fn test_instruction_blobs_are_disjoint() {
        let a = Code::new_unoptimized(128);
        let b = Code::new_unoptimized(128);
        assert_ne!(a.entry_point(), b.entry_point());
        assert!(!a.instructions().contains(b.entry_point()));
    }

    #[test]
    fn test_unoptimized_has_no_lazy_deopt() {
        let code = Code::new_unoptimized(64);
        assert!(!code.lazy_deopt_return().is_set());
        assert!(code.is_alive());
    }

    #[test]
    fn test_optimized_lazy_deopt_inside_blob() {
        let code = Code::new_optimized(256);
        let lazy = code.lazy_deopt_return();
        assert!(lazy.is_set());
        assert!(code.instructions().contains(lazy));
    }

    #[test]
    fn test_call_patching() {
        let code = Code::new_unoptimized(128);
        let pc = code.entry_point().offset(16);
        assert!(code.instructions().call_target_at(pc).is_none());

        code.instructions().set_call_target(pc, Address(0xdead0));
        assert_eq!(code.instructions().call_target_at(pc), Some(Address(0xdead0)));

        code.instructions().set_call_target(pc, Address(0xbeef0));
        assert_eq!(code.instructions().call_target_at(pc), Some(Address(0xbeef0)));
    }

    #[test]
    fn test_deopt_descriptor_roundtrip() {
        let code = Code::new_optimized(128);
        let pc = code.entry_point().offset(32);
        code.add_deopt_descriptor(pc, DeoptDescriptor::trivial(Address(0x111)));

        let desc = code.deopt_descriptor_at(pc).unwrap();
        assert_eq!(desc.target_pc, Address(0x111));
        assert!(code.deopt_descriptor_at(pc.offset(8)).is_none());
    }

    #[test]
    fn test_static_call_table() {
        let code = Code::new_unoptimized(128);
        let callee = Function::new(symbol::intern("callee"), ClassId(20), FunctionKind::Regular, 0);
        let pc = code.entry_point().offset(24);

        code.set_static_call_target(pc, callee.clone());
        assert!(Arc::ptr_eq(
            &code.static_call_function_at(pc).unwrap(),
            &callee
        ));
        assert!(code.static_call_code_at(pc).is_none());

        let target_code = Code::new_unoptimized(64);
        code.set_static_call_code_at(pc, target_code.clone());
        assert!(Arc::ptr_eq(
            &code.static_call_code_at(pc).unwrap(),
            &target_code
        ));
    }

    #[test]
    fn test_osr_table() {
        let code = Code::new_unoptimized(128);
        let loop_pc = code.entry_point().offset(40);
        code.add_osr_entry(loop_pc, DeoptId(7));
        assert_eq!(code.deopt_id_for_osr(loop_pc), Some(DeoptId(7)));
        assert!(code.deopt_id_for_osr(loop_pc.offset(4)).is_none());
    }

    #[test]
    #[should_panic(expected = "outlived its function")]
    fn test_function_backpointer_requires_owner() {
        let code = Code::new_unoptimized(64);
        let f = Function::new(symbol::intern("gone"), ClassId(20), FunctionKind::Regular, 0);
        f.attach_code(&code);
        drop(f);
        code.function();
    }

    #[test]
    fn test_deopt_reason_names() {
        assert_eq!(DeoptReason::TypeGuard.as_str(), "TypeGuard");
        assert_eq!(DeoptReason::Unknown.as_str(), "Unknown");
    }
}
