//! Functions: units of managed code.
//!
//! A function carries adaptive-optimization state (usage counter,
//! deoptimization counter, optimizability flag) and two code slots: the
//! retained unoptimized code and the current code, which may temporarily be
//! an optimized variant. The invariant maintained here is that current code
//! is either the unoptimized code or an optimized code whose back-pointer
//! names this function.

use crate::args_desc::ArgsDescRef;
use crate::class::ClassTable;
use crate::code::CodeRef;
use lumen_core::ids::{ClassId, FunctionId};
use lumen_core::Symbol;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

/// Shared handle to a function.
pub type FunctionRef = Arc<Function>;

static NEXT_FUNCTION_ID: AtomicU32 = AtomicU32::new(1);

/// What kind of function this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Regular,
    Getter,
    /// A local closure function.
    Closure,
    /// The implicit closure wrapping an instance method (`o.m` without a
    /// call).
    ImplicitClosure,
    /// A synthesized getter that closurizes a method; never treated as a
    /// plain getter by the IC fallback.
    MethodExtractor,
    /// Synthesized dispatcher that reifies the invocation and calls
    /// `noSuchMethod`.
    NoSuchMethodDispatcher,
    /// Synthesized dispatcher that reads the same-named field and invokes
    /// the result.
    InvokeFieldDispatcher,
}

impl FunctionKind {
    #[inline]
    #[must_use]
    pub const fn is_dispatcher(self) -> bool {
        matches!(
            self,
            Self::NoSuchMethodDispatcher | Self::InvokeFieldDispatcher
        )
    }
}

/// A unit of managed code.
pub struct Function {
    id: FunctionId,
    name: Symbol,
    owner: ClassId,
    kind: FunctionKind,
    num_fixed_params: usize,
    num_optional_positional: usize,
    optional_named: Vec<Symbol>,
    is_optimizable: AtomicBool,
    usage_counter: AtomicI64,
    deoptimization_counter: AtomicU32,
    current_code: RwLock<Option<CodeRef>>,
    unoptimized_code: RwLock<Option<CodeRef>>,
}

impl Function {
    /// Create a function taking exactly `num_fixed_params` arguments
    /// (receiver included for instance methods).
    #[must_use]
    pub fn new(name: Symbol, owner: ClassId, kind: FunctionKind, num_fixed_params: usize) -> FunctionRef {
        Self::with_signature(name, owner, kind, num_fixed_params, 0, Vec::new())
    }

    /// Create a function with optional positional and named parameters.
    #[must_use]
    pub fn with_signature(
        name: Symbol,
        owner: ClassId,
        kind: FunctionKind,
        num_fixed_params: usize,
        num_optional_positional: usize,
        optional_named: Vec<Symbol>,
    ) -> FunctionRef {
        debug_assert!(num_optional_positional == 0 || optional_named.is_empty());
        Arc::new(Self {
            id: FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            owner,
            kind,
            num_fixed_params,
            num_optional_positional,
            optional_named,
            is_optimizable: AtomicBool::new(true),
            usage_counter: AtomicI64::new(0),
            deoptimization_counter: AtomicU32::new(0),
            current_code: RwLock::new(None),
            unoptimized_code: RwLock::new(None),
        })
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> FunctionId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn owner(&self) -> ClassId {
        self.owner
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// `Owner.name`, used by the optimization filter and diagnostics.
    #[must_use]
    pub fn qualified_name(&self, table: &ClassTable) -> String {
        format!("{}.{}", table.get(self.owner).name(), self.name)
    }

    // =========================================================================
    // Signature checks
    // =========================================================================

    /// Whether a call with the given argument shape can invoke this
    /// function. Only arity and named-argument names are checked.
    #[must_use]
    pub fn are_valid_arguments(&self, desc: &ArgsDescRef) -> bool {
        let positional = desc.positional_count();
        if positional < self.num_fixed_params {
            return false;
        }
        if positional > self.num_fixed_params + self.num_optional_positional {
            return false;
        }
        desc.named()
            .iter()
            .all(|name| self.optional_named.contains(name))
    }

    // =========================================================================
    // Adaptive-optimization state
    // =========================================================================

    #[inline]
    #[must_use]
    pub fn usage_counter(&self) -> i64 {
        self.usage_counter.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_usage_counter(&self, value: i64) {
        self.usage_counter.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_usage_counter(&self) -> i64 {
        self.usage_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    #[must_use]
    pub fn deoptimization_counter(&self) -> u32 {
        self.deoptimization_counter.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn increment_deoptimization_counter(&self) -> u32 {
        self.deoptimization_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    #[must_use]
    pub fn is_optimizable(&self) -> bool {
        self.is_optimizable.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_is_optimizable(&self, value: bool) {
        self.is_optimizable.store(value, Ordering::Relaxed);
    }

    // =========================================================================
    // Code slots
    // =========================================================================

    #[inline]
    #[must_use]
    pub fn has_code(&self) -> bool {
        self.current_code.read().is_some()
    }

    #[must_use]
    pub fn current_code(&self) -> Option<CodeRef> {
        self.current_code.read().clone()
    }

    #[must_use]
    pub fn unoptimized_code(&self) -> Option<CodeRef> {
        self.unoptimized_code.read().clone()
    }

    #[must_use]
    pub fn has_optimized_code(&self) -> bool {
        self.current_code
            .read()
            .as_ref()
            .map_or(false, |c| c.is_optimized())
    }

    /// Install freshly compiled code. Unoptimized code is also retained in
    /// the unoptimized slot so deoptimization can fall back to it.
    pub fn attach_code(self: &Arc<Self>, code: &CodeRef) {
        code.bind_function(self);
        if !code.is_optimized() {
            *self.unoptimized_code.write() = Some(code.clone());
        }
        *self.current_code.write() = Some(code.clone());
    }

    /// Point current code back at the retained unoptimized code.
    pub fn switch_to_unoptimized_code(&self) {
        let unoptimized = self
            .unoptimized_code
            .read()
            .clone()
            .expect("switch_to_unoptimized_code without unoptimized code");
        *self.current_code.write() = Some(unoptimized);
    }

    /// Set the current code slot directly. Used by OSR to restore the
    /// unoptimized code after installing the OSR variant's entry in the
    /// frame.
    pub fn set_code(&self, code: &CodeRef) {
        *self.current_code.write() = Some(code.clone());
    }

    /// Reattach a previously detached unoptimized code object.
    pub fn reattach_code(self: &Arc<Self>, code: &CodeRef) {
        debug_assert!(!code.is_optimized());
        debug_assert!(self.unoptimized_code.read().is_none());
        code.bind_function(self);
        *self.unoptimized_code.write() = Some(code.clone());
        *self.current_code.write() = Some(code.clone());
    }

    /// Drop both code slots (code detachment under memory pressure; the
    /// caller's static-call table retains the unoptimized code).
    pub fn detach_code(&self) {
        *self.current_code.write() = None;
        *self.unoptimized_code.write() = None;
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("usage_counter", &self.usage_counter())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args_desc::ArgsDescriptor;
    use crate::code::Code;
    use lumen_core::symbol;

    fn new_fn(name: &str) -> FunctionRef {
        Function::new(symbol::intern(name), ClassId(20), FunctionKind::Regular, 1)
    }

    #[test]
    fn test_fresh_function_state() {
        let f = new_fn("m");
        assert_eq!(f.usage_counter(), 0);
        assert_eq!(f.deoptimization_counter(), 0);
        assert!(f.is_optimizable());
        assert!(!f.has_code());
        assert!(f.unoptimized_code().is_none());
    }

    #[test]
    fn test_attach_unoptimized_fills_both_slots() {
        let f = new_fn("m");
        let code = Code::new_unoptimized(64);
        f.attach_code(&code);

        assert!(f.has_code());
        assert!(!f.has_optimized_code());
        assert!(Arc::ptr_eq(&f.current_code().unwrap(), &code));
        assert!(Arc::ptr_eq(&f.unoptimized_code().unwrap(), &code));
        assert!(Arc::ptr_eq(&code.function(), &f));
    }

    #[test]
    fn test_attach_optimized_keeps_unoptimized_slot() {
        let f = new_fn("m");
        let unopt = Code::new_unoptimized(64);
        f.attach_code(&unopt);

        let opt = Code::new_optimized(128);
        opt.add_deopt_descriptor(
            opt.entry_point().offset(8),
            crate::code::DeoptDescriptor::trivial(unopt.entry_point()),
        );
        f.attach_code(&opt);

        assert!(f.has_optimized_code());
        assert!(Arc::ptr_eq(&f.unoptimized_code().unwrap(), &unopt));

        f.switch_to_unoptimized_code();
        assert!(!f.has_optimized_code());
        assert!(Arc::ptr_eq(&f.current_code().unwrap(), &unopt));
    }

    #[test]
    fn test_reattach_after_detach() {
        let f = new_fn("m");
        let code = Code::new_unoptimized(64);
        f.attach_code(&code);
        f.detach_code();
        assert!(!f.has_code());

        f.reattach_code(&code);
        assert!(f.has_code());
        assert!(Arc::ptr_eq(&f.unoptimized_code().unwrap(), &code));
    }

    #[test]
    fn test_are_valid_arguments_arity() {
        let f = Function::with_signature(
            symbol::intern("m"),
            ClassId(20),
            FunctionKind::Regular,
            2,
            1,
            Vec::new(),
        );
        assert!(!f.are_valid_arguments(&ArgsDescriptor::positional(1)));
        assert!(f.are_valid_arguments(&ArgsDescriptor::positional(2)));
        assert!(f.are_valid_arguments(&ArgsDescriptor::positional(3)));
        assert!(!f.are_valid_arguments(&ArgsDescriptor::positional(4)));
    }

    #[test]
    fn test_are_valid_arguments_named() {
        let f = Function::with_signature(
            symbol::intern("m"),
            ClassId(20),
            FunctionKind::Regular,
            1,
            0,
            vec![symbol::intern("radix")],
        );
        let ok = ArgsDescriptor::with_named(2, vec![symbol::intern("radix")]);
        let bad = ArgsDescriptor::with_named(2, vec![symbol::intern("base")]);
        assert!(f.are_valid_arguments(&ok));
        assert!(!f.are_valid_arguments(&bad));
    }

    #[test]
    fn test_counters() {
        let f = new_fn("m");
        f.increment_usage_counter();
        f.increment_usage_counter();
        assert_eq!(f.usage_counter(), 2);
        f.set_usage_counter(-100_000_000);
        assert_eq!(f.usage_counter(), -100_000_000);

        assert_eq!(f.increment_deoptimization_counter(), 1);
        assert_eq!(f.deoptimization_counter(), 1);
    }

    #[test]
    fn test_dispatcher_kinds() {
        assert!(FunctionKind::NoSuchMethodDispatcher.is_dispatcher());
        assert!(FunctionKind::InvokeFieldDispatcher.is_dispatcher());
        assert!(!FunctionKind::Regular.is_dispatcher());
        assert!(!FunctionKind::MethodExtractor.is_dispatcher());
    }
}
