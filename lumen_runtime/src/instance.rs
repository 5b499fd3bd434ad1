//! Instances, arrays, and contexts.
//!
//! An instance's type-argument vector is swappable: the type engine
//! replaces a lazy or non-canonical vector with its canonical form in
//! place. Closures are instances of the closure class carrying their
//! function and captured context.

use crate::class::cids;
use crate::function::FunctionRef;
use crate::types::TypeArgsRef;
use crate::value::Value;
use lumen_core::ids::ClassId;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

pub type InstanceRef = Arc<Instance>;
pub type ArrayRef = Arc<Array>;
pub type ContextRef = Arc<Context>;

// =============================================================================
// Instance
// =============================================================================

/// Captured state of a closure instance.
#[derive(Debug, Clone)]
pub struct ClosurePayload {
    pub function: FunctionRef,
    pub context: ContextRef,
}

/// A plain managed object.
pub struct Instance {
    cid: ClassId,
    type_arguments: RwLock<Option<TypeArgsRef>>,
    fields: RwLock<Vec<Value>>,
    closure: Option<ClosurePayload>,
}

impl Instance {
    /// Allocate an instance of class `cid` with `num_fields` null fields.
    #[must_use]
    pub fn new(cid: ClassId, num_fields: usize) -> InstanceRef {
        Arc::new(Self {
            cid,
            type_arguments: RwLock::new(None),
            fields: RwLock::new(vec![Value::Null; num_fields]),
            closure: None,
        })
    }

    /// Allocate a closure over `function` capturing `context`.
    #[must_use]
    pub fn new_closure(function: FunctionRef, context: ContextRef) -> InstanceRef {
        Arc::new(Self {
            cid: cids::CLOSURE,
            type_arguments: RwLock::new(None),
            fields: RwLock::new(Vec::new()),
            closure: Some(ClosurePayload { function, context }),
        })
    }

    #[inline]
    #[must_use]
    pub fn cid(&self) -> ClassId {
        self.cid
    }

    #[must_use]
    pub fn type_arguments(&self) -> Option<TypeArgsRef> {
        self.type_arguments.read().clone()
    }

    pub fn set_type_arguments(&self, args: Option<TypeArgsRef>) {
        *self.type_arguments.write() = args;
    }

    #[inline]
    #[must_use]
    pub fn is_closure(&self) -> bool {
        self.closure.is_some()
    }

    #[must_use]
    pub fn closure_function(&self) -> Option<FunctionRef> {
        self.closure.as_ref().map(|c| c.function.clone())
    }

    #[must_use]
    pub fn closure_context(&self) -> Option<ContextRef> {
        self.closure.as_ref().map(|c| c.context.clone())
    }

    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.fields.read().len()
    }

    #[must_use]
    pub fn field_at(&self, index: usize) -> Value {
        self.fields.read()[index].clone()
    }

    pub fn set_field(&self, index: usize, value: Value) {
        self.fields.write()[index] = value;
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("cid", &self.cid)
            .field("is_closure", &self.is_closure())
            .finish()
    }
}

// =============================================================================
// Array
// =============================================================================

/// A fixed-length managed array. Its single type argument is the element
/// type.
pub struct Array {
    type_arguments: RwLock<Option<TypeArgsRef>>,
    elements: RwLock<Vec<Value>>,
}

impl Array {
    /// Allocate an array of `len` null elements.
    #[must_use]
    pub fn new(len: usize) -> ArrayRef {
        Arc::new(Self {
            type_arguments: RwLock::new(None),
            elements: RwLock::new(vec![Value::Null; len]),
        })
    }

    /// Build an array from the given elements.
    #[must_use]
    pub fn from_values(values: Vec<Value>) -> ArrayRef {
        Arc::new(Self {
            type_arguments: RwLock::new(None),
            elements: RwLock::new(values),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn at(&self, index: usize) -> Value {
        self.elements.read()[index].clone()
    }

    pub fn set_at(&self, index: usize, value: Value) {
        self.elements.write()[index] = value;
    }

    #[must_use]
    pub fn type_arguments(&self) -> Option<TypeArgsRef> {
        self.type_arguments.read().clone()
    }

    pub fn set_type_arguments(&self, args: Option<TypeArgsRef>) {
        *self.type_arguments.write() = args;
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array").field("len", &self.len()).finish()
    }
}

// =============================================================================
// Context
// =============================================================================

/// A chain-linked context holding captured variables.
pub struct Context {
    parent: RwLock<Option<ContextRef>>,
    slots: RwLock<Vec<Value>>,
}

impl Context {
    /// Allocate a context with `num_variables` null slots.
    #[must_use]
    pub fn new(num_variables: usize) -> ContextRef {
        Arc::new(Self {
            parent: RwLock::new(None),
            slots: RwLock::new(vec![Value::Null; num_variables]),
        })
    }

    #[must_use]
    pub fn num_variables(&self) -> usize {
        self.slots.read().len()
    }

    #[must_use]
    pub fn at(&self, index: usize) -> Value {
        self.slots.read()[index].clone()
    }

    pub fn set_at(&self, index: usize, value: Value) {
        self.slots.write()[index] = value;
    }

    #[must_use]
    pub fn parent(&self) -> Option<ContextRef> {
        self.parent.read().clone()
    }

    pub fn set_parent(&self, parent: Option<ContextRef>) {
        *self.parent.write() = parent;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("num_variables", &self.num_variables())
            .field("has_parent", &self.parent().is_some())
            .finish()
    }
}
