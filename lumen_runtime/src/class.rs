//! Classes and the class table.
//!
//! The class table assigns dense class ids and answers the supertype
//! relation. Classes own their method tables and synthesize invocation
//! dispatchers (noSuchMethod / invoke-field) on demand, caching them per
//! (name, descriptor, kind) so repeated misses reuse one dispatcher.

use crate::args_desc::ArgsDescRef;
use crate::function::{Function, FunctionKind, FunctionRef};
use crate::types::Type;
use lumen_core::ids::ClassId;
use lumen_core::{symbol, Symbol};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a class.
pub type ClassRef = Arc<Class>;

// =============================================================================
// Well-known class ids
// =============================================================================

/// Class ids assigned by `ClassTable::bootstrap`. Ids below `FIRST_USER`
/// are reserved for the VM.
pub mod cids {
    use lumen_core::ids::ClassId;

    pub const NULL: ClassId = ClassId(1);
    pub const BOOL: ClassId = ClassId(2);
    pub const SMI: ClassId = ClassId(3);
    pub const DOUBLE: ClassId = ClassId(4);
    pub const STRING: ClassId = ClassId(5);
    pub const ARRAY: ClassId = ClassId(6);
    pub const CONTEXT: ClassId = ClassId(7);
    pub const CLOSURE: ClassId = ClassId(8);
    pub const TYPE: ClassId = ClassId(9);
    pub const TYPE_ARGUMENTS: ClassId = ClassId(10);
    pub const FUNCTION: ClassId = ClassId(11);
    pub const CODE: ClassId = ClassId(12);
    pub const IC_DATA: ClassId = ClassId(13);
    pub const SUBTYPE_TEST_CACHE: ClassId = ClassId(14);
    pub const FIELD: ClassId = ClassId(15);
    pub const ARGS_DESCRIPTOR: ClassId = ClassId(16);
    pub const CLASS: ClassId = ClassId(17);

    /// First id handed to embedder-registered classes.
    pub const FIRST_USER: u32 = 18;
}

// =============================================================================
// Dispatchers
// =============================================================================

/// Which kind of invocation dispatcher to synthesize for a failed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherKind {
    /// Calls `noSuchMethod` with the original invocation reified.
    NoSuchMethod,
    /// Reads the same-named field/getter and invokes the result.
    InvokeField,
}

impl DispatcherKind {
    #[must_use]
    pub const fn function_kind(self) -> FunctionKind {
        match self {
            DispatcherKind::NoSuchMethod => FunctionKind::NoSuchMethodDispatcher,
            DispatcherKind::InvokeField => FunctionKind::InvokeFieldDispatcher,
        }
    }
}

#[derive(PartialEq, Eq, Hash)]
struct DispatcherKey {
    name: Symbol,
    desc: ArgsDescRef,
    kind: DispatcherKind,
}

// =============================================================================
// Class
// =============================================================================

/// Declaration data for registering a class.
pub struct ClassDecl {
    pub name: String,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub num_type_arguments: usize,
    /// Declared bounds, one slot per type parameter (`None` = unbounded).
    pub type_parameter_bounds: Vec<Option<Type>>,
    pub num_fields: usize,
}

impl Default for ClassDecl {
    fn default() -> Self {
        Self {
            name: String::new(),
            super_class: None,
            interfaces: Vec::new(),
            num_type_arguments: 0,
            type_parameter_bounds: Vec::new(),
            num_fields: 0,
        }
    }
}

/// A managed class.
pub struct Class {
    id: ClassId,
    name: Symbol,
    super_class: Option<ClassId>,
    interfaces: Vec<ClassId>,
    num_type_arguments: usize,
    type_parameter_bounds: Vec<Option<Type>>,
    num_fields: usize,
    functions: RwLock<Vec<FunctionRef>>,
    dispatchers: RwLock<FxHashMap<DispatcherKey, FunctionRef>>,
}

impl Class {
    #[inline]
    #[must_use]
    pub fn id(&self) -> ClassId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn super_class(&self) -> Option<ClassId> {
        self.super_class
    }

    #[inline]
    #[must_use]
    pub fn interfaces(&self) -> &[ClassId] {
        &self.interfaces
    }

    /// Number of type arguments a finalized instance carries. Zero for
    /// non-generic classes.
    #[inline]
    #[must_use]
    pub fn num_type_arguments(&self) -> usize {
        self.num_type_arguments
    }

    #[inline]
    #[must_use]
    pub fn type_parameter_bounds(&self) -> &[Option<Type>] {
        &self.type_parameter_bounds
    }

    #[inline]
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    /// Add a method to this class's own table.
    pub fn add_function(&self, function: FunctionRef) {
        self.functions.write().push(function);
    }

    /// Look up a method by name in this class's own table (supers are the
    /// resolver's job).
    #[must_use]
    pub fn lookup_function(&self, name: &Symbol) -> Option<FunctionRef> {
        self.functions
            .read()
            .iter()
            .find(|f| f.name() == name)
            .cloned()
    }

    /// Get or synthesize the invocation dispatcher for a failed lookup of
    /// `name` with the given argument shape.
    pub fn get_invocation_dispatcher(
        &self,
        name: &Symbol,
        desc: &ArgsDescRef,
        kind: DispatcherKind,
    ) -> FunctionRef {
        let key = DispatcherKey {
            name: name.clone(),
            desc: desc.clone(),
            kind,
        };
        {
            let dispatchers = self.dispatchers.read();
            if let Some(f) = dispatchers.get(&key) {
                return f.clone();
            }
        }
        let mut dispatchers = self.dispatchers.write();
        if let Some(f) = dispatchers.get(&key) {
            return f.clone();
        }
        let dispatcher = Function::new(
            name.clone(),
            self.id,
            kind.function_kind(),
            desc.count(),
        );
        dispatchers.insert(key, dispatcher.clone());
        dispatcher
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("num_type_arguments", &self.num_type_arguments)
            .finish()
    }
}

// =============================================================================
// Class table
// =============================================================================

/// Id-indexed class registry, one per isolate.
pub struct ClassTable {
    // Index 0 is the reserved illegal id and stays empty.
    classes: RwLock<Vec<Option<ClassRef>>>,
}

impl ClassTable {
    /// An empty table with only the illegal slot. Use `bootstrap` for a
    /// usable table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(vec![None]),
        }
    }

    /// A table pre-populated with the well-known VM classes.
    #[must_use]
    pub fn bootstrap() -> Self {
        let table = Self::new();
        let builtin = [
            ("Null", 0usize),
            ("bool", 0),
            ("int", 0),
            ("double", 0),
            ("String", 0),
            ("Array", 1),
            ("Context", 0),
            ("Closure", 0),
            ("Type", 0),
            ("TypeArguments", 0),
            ("Function", 0),
            ("Code", 0),
            ("ICData", 0),
            ("SubtypeTestCache", 0),
            ("Field", 0),
            ("ArgumentsDescriptor", 0),
            ("Class", 0),
        ];
        for (name, num_type_arguments) in builtin {
            table.register(ClassDecl {
                name: name.into(),
                num_type_arguments,
                ..Default::default()
            });
        }
        debug_assert_eq!(table.len() as u32 + 1, cids::FIRST_USER);
        table
    }

    /// Register a class, assigning the next id.
    pub fn register(&self, decl: ClassDecl) -> ClassRef {
        let mut classes = self.classes.write();
        let id = ClassId(classes.len() as u32);
        let class = Arc::new(Class {
            id,
            name: symbol::intern(&decl.name),
            super_class: decl.super_class,
            interfaces: decl.interfaces,
            num_type_arguments: decl.num_type_arguments,
            type_parameter_bounds: decl.type_parameter_bounds,
            num_fields: decl.num_fields,
            functions: RwLock::new(Vec::new()),
            dispatchers: RwLock::new(FxHashMap::default()),
        });
        classes.push(Some(class.clone()));
        class
    }

    /// Fetch a class by id. Panics on an unregistered id; ids come from
    /// values, which always carry valid ones.
    #[must_use]
    pub fn get(&self, cid: ClassId) -> ClassRef {
        self.classes
            .read()
            .get(cid.0 as usize)
            .and_then(Clone::clone)
            .unwrap_or_else(|| panic!("unregistered class id {cid}"))
    }

    /// Number of registered classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.read().len() - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The supertype relation: walks superclasses and interfaces
    /// transitively.
    #[must_use]
    pub fn is_subtype_class(&self, sub: ClassId, sup: ClassId) -> bool {
        if sub == sup {
            return true;
        }
        let class = self.get(sub);
        if let Some(parent) = class.super_class() {
            if self.is_subtype_class(parent, sup) {
                return true;
            }
        }
        class
            .interfaces()
            .iter()
            .any(|&iface| self.is_subtype_class(iface, sup))
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::bootstrap()
    }
}

impl fmt::Debug for ClassTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassTable")
            .field("count", &self.len())
            .finish()
    }
}
