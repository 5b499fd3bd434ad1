//! Types and type-argument vectors.
//!
//! A type-argument vector is either *flat* (a concrete list of types) or
//! *lazy*: a pair of an uninstantiated vector and the instantiator it will
//! eventually be resolved against. Lazy vectors are semantically
//! instantiated; they are flattened and canonicalized on demand by the type
//! engine so that caches can compare vectors by identity.
//!
//! Canonicalization is a hash-consed intern operation: the interner hands
//! out the unique representative of each structural equivalence class, and
//! all cache equality afterwards is `Arc` pointer identity.

use crate::class::ClassTable;
use lumen_core::error::{BoundError, LanguageError};
use lumen_core::ids::ClassId;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared handle to a type-argument vector.
pub type TypeArgsRef = Arc<TypeArgs>;

// =============================================================================
// Type
// =============================================================================

/// A type of the managed language's type sub-language.
#[derive(Debug, Clone)]
pub enum Type {
    /// The top type; every value is an instance of it.
    Dynamic,
    /// A free type parameter, resolved positionally from an instantiator.
    Parameter { index: u16 },
    /// A (possibly generic) class type.
    Class {
        cid: ClassId,
        type_args: Option<TypeArgsRef>,
    },
    /// A type that failed to resolve or finalize, carrying the language
    /// error recorded when it was seen.
    Malformed(LanguageError),
}

impl Type {
    /// A non-generic class type.
    #[must_use]
    pub fn class(cid: ClassId) -> Type {
        Type::Class {
            cid,
            type_args: None,
        }
    }

    /// A generic class type with the given argument vector.
    #[must_use]
    pub fn generic(cid: ClassId, args: TypeArgsRef) -> Type {
        Type::Class {
            cid,
            type_args: Some(args),
        }
    }

    /// Whether this type contains no free type parameters.
    #[must_use]
    pub fn is_instantiated(&self) -> bool {
        match self {
            Type::Dynamic | Type::Malformed(_) => true,
            Type::Parameter { .. } => false,
            Type::Class { type_args, .. } => {
                type_args.as_ref().map_or(true, |args| args.is_instantiated())
            }
        }
    }

    /// The class this type names, if any.
    #[must_use]
    pub fn type_class_id(&self) -> Option<ClassId> {
        match self {
            Type::Class { cid, .. } => Some(*cid),
            _ => None,
        }
    }

    /// Resolve free parameters from `instantiator`, checking declared bounds.
    ///
    /// A missing instantiator resolves parameters to `Dynamic`. Bound checks
    /// run only when both the argument and the bound come out instantiated.
    pub fn instantiate_from(
        &self,
        instantiator: Option<&TypeArgsRef>,
        table: &ClassTable,
    ) -> Result<Type, BoundError> {
        match self {
            Type::Dynamic => Ok(Type::Dynamic),
            Type::Malformed(err) => Ok(Type::Malformed(err.clone())),
            Type::Parameter { index } => match instantiator {
                None => Ok(Type::Dynamic),
                Some(args) => {
                    // The instantiator may itself be a lazy pair.
                    let flat = if args.is_lazy() {
                        flatten(args, table)?
                    } else {
                        args.clone()
                    };
                    Ok(flat
                        .flat_types()
                        .get(*index as usize)
                        .cloned()
                        .unwrap_or(Type::Dynamic))
                }
            },
            Type::Class { cid, type_args } => {
                let inst_args = match type_args {
                    None => None,
                    Some(args) => Some(args.instantiate_from(instantiator, table)?),
                };
                if let Some(args) = &inst_args {
                    check_bounds(*cid, args, instantiator, table)?;
                }
                Ok(Type::Class {
                    cid: *cid,
                    type_args: inst_args,
                })
            }
        }
    }

    /// Structural subtype test over instantiated types.
    ///
    /// `Dynamic` is assignable in both directions. Class types compare by
    /// the class table's supertype relation, then covariantly over the
    /// shared prefix of their argument vectors; a missing vector reads as
    /// all-dynamic.
    #[must_use]
    pub fn is_subtype_of(&self, other: &Type, table: &ClassTable) -> bool {
        if matches!(self, Type::Dynamic) || matches!(other, Type::Dynamic) {
            return true;
        }
        match (self, other) {
            (
                Type::Class {
                    cid: sub_cid,
                    type_args: sub_args,
                },
                Type::Class {
                    cid: super_cid,
                    type_args: super_args,
                },
            ) => {
                if !table.is_subtype_class(*sub_cid, *super_cid) {
                    return false;
                }
                let super_args = match super_args {
                    None => return true,
                    Some(args) => args,
                };
                if super_args.is_lazy() || sub_args.as_ref().map_or(false, |a| a.is_lazy()) {
                    // Unresolved vectors only compare by identity.
                    return sub_args.as_ref().map_or(false, |a| Arc::ptr_eq(a, super_args));
                }
                let sub_args = match sub_args {
                    None => return super_args.flat_types().iter().all(|t| matches!(t, Type::Dynamic)),
                    Some(args) => args,
                };
                let sub_types = sub_args.flat_types();
                let super_types = super_args.flat_types();
                sub_types
                    .iter()
                    .zip(super_types.iter())
                    .all(|(s, o)| s.is_subtype_of(o, table))
            }
            _ => false,
        }
    }

    /// The user-visible name, e.g. `List<int>`.
    #[must_use]
    pub fn user_visible_name(&self, table: &ClassTable) -> String {
        match self {
            Type::Dynamic => "dynamic".into(),
            Type::Parameter { index } => format!("T{index}"),
            Type::Malformed(err) => err.kind.type_name().into(),
            Type::Class { cid, type_args } => {
                let name = table.get(*cid).name().to_string();
                match type_args {
                    None => name,
                    Some(args) if args.is_lazy() => format!("{name}<...>"),
                    Some(args) => {
                        let inner: Vec<String> = args
                            .flat_types()
                            .iter()
                            .map(|t| t.user_visible_name(table))
                            .collect();
                        format!("{}<{}>", name, inner.join(", "))
                    }
                }
            }
        }
    }
}

fn check_bounds(
    cid: ClassId,
    args: &TypeArgsRef,
    instantiator: Option<&TypeArgsRef>,
    table: &ClassTable,
) -> Result<(), BoundError> {
    let class = table.get(cid);
    let bounds = class.type_parameter_bounds();
    if bounds.is_empty() {
        return Ok(());
    }
    let types = args.flat_types();
    for (i, bound) in bounds.iter().enumerate() {
        let Some(bound) = bound else { continue };
        let Some(arg) = types.get(i) else { continue };
        let bound = bound.instantiate_from(instantiator, table)?;
        if arg.is_instantiated() && bound.is_instantiated() && !arg.is_subtype_of(&bound, table) {
            return Err(BoundError::new(format!(
                "type '{}' does not extend bound '{}' of '{}'",
                arg.user_visible_name(table),
                bound.user_visible_name(table),
                class.name()
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Type-argument vectors
// =============================================================================

/// A type-argument vector: flat, or a lazy (uninstantiated, instantiator)
/// pair awaiting resolution.
#[derive(Debug)]
pub enum TypeArgs {
    Flat {
        types: Vec<Type>,
        /// Set by the interner on the unique representative only.
        canonical: AtomicBool,
    },
    Lazy {
        uninstantiated: TypeArgsRef,
        instantiator: Option<TypeArgsRef>,
    },
}

impl TypeArgs {
    /// A flat vector of the given types.
    #[must_use]
    pub fn flat(types: Vec<Type>) -> TypeArgsRef {
        Arc::new(TypeArgs::Flat {
            types,
            canonical: AtomicBool::new(false),
        })
    }

    /// A lazy pair. The uninstantiated vector must actually be
    /// uninstantiated, and the instantiator (when present) instantiated.
    #[must_use]
    pub fn lazy(uninstantiated: TypeArgsRef, instantiator: Option<TypeArgsRef>) -> TypeArgsRef {
        debug_assert!(!uninstantiated.is_instantiated());
        debug_assert!(instantiator.as_ref().map_or(true, |i| i.is_instantiated()));
        Arc::new(TypeArgs::Lazy {
            uninstantiated,
            instantiator,
        })
    }

    /// Vector length. For lazy pairs, the length of the vector being
    /// instantiated.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            TypeArgs::Flat { types, .. } => types.len(),
            TypeArgs::Lazy { uninstantiated, .. } => uninstantiated.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        matches!(self, TypeArgs::Lazy { .. })
    }

    /// Whether the vector is (semantically) instantiated. Lazy pairs are:
    /// their resolution is deferred, not pending on a caller.
    #[must_use]
    pub fn is_instantiated(&self) -> bool {
        match self {
            TypeArgs::Flat { types, .. } => types.iter().all(Type::is_instantiated),
            TypeArgs::Lazy { .. } => true,
        }
    }

    /// Whether this is the canonical representative of its equivalence
    /// class. Only flat vectors can be canonical.
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        match self {
            TypeArgs::Flat { canonical, .. } => canonical.load(Ordering::Acquire),
            TypeArgs::Lazy { .. } => false,
        }
    }

    /// The flat types. Panics on a lazy vector; flatten first.
    #[must_use]
    pub fn flat_types(&self) -> &[Type] {
        match self {
            TypeArgs::Flat { types, .. } => types,
            TypeArgs::Lazy { .. } => panic!("flat_types on a lazy type-argument vector"),
        }
    }

    /// Whether this vector is exactly `<T0, T1, ..., Tn-1>`: reusing the
    /// instantiator as the instantiated vector would be the identity. The
    /// caller's inlined fast path handles that case; runtime entries assert
    /// the non-identity case.
    #[must_use]
    pub fn is_uninstantiated_identity(&self) -> bool {
        match self {
            TypeArgs::Lazy { .. } => false,
            TypeArgs::Flat { types, .. } => types.iter().enumerate().all(|(i, t)| match t {
                Type::Parameter { index } => *index as usize == i,
                _ => false,
            }),
        }
    }

    /// Instantiate a flat vector's free parameters from `instantiator`.
    ///
    /// Lazy pairs resolve their own stored instantiator first and ignore
    /// the incoming one (they were captured with their environment).
    pub fn instantiate_from(
        self: &Arc<Self>,
        instantiator: Option<&TypeArgsRef>,
        table: &ClassTable,
    ) -> Result<TypeArgsRef, BoundError> {
        match &**self {
            TypeArgs::Flat { types, .. } => {
                let mut resolved = Vec::with_capacity(types.len());
                for t in types {
                    resolved.push(t.instantiate_from(instantiator, table)?);
                }
                Ok(TypeArgs::flat(resolved))
            }
            TypeArgs::Lazy { .. } => flatten(self, table),
        }
    }
}

/// Resolve a vector to flat form, unwrapping nested lazy pairs.
pub fn flatten(args: &TypeArgsRef, table: &ClassTable) -> Result<TypeArgsRef, BoundError> {
    let mut current = args.clone();
    loop {
        match &*current {
            TypeArgs::Flat { .. } => return Ok(current),
            TypeArgs::Lazy {
                uninstantiated,
                instantiator,
            } => {
                let uninst = flatten(uninstantiated, table)?;
                current = uninst.instantiate_from(instantiator.as_ref(), table)?;
            }
        }
    }
}

/// Identity comparison of optional vectors.
#[inline]
#[must_use]
pub fn opt_args_identical(a: Option<&TypeArgsRef>, b: Option<&TypeArgsRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

// =============================================================================
// Canonicalization
// =============================================================================

/// Hash-consing interner for flat, instantiated type-argument vectors.
///
/// `canonicalize` returns the unique representative for a vector's
/// structural equivalence class; afterwards cache lookups compare vectors
/// by pointer identity only.
pub struct TypeArgsInterner {
    table: RwLock<FxHashMap<u64, Vec<TypeArgsRef>>>,
}

impl TypeArgsInterner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: RwLock::new(FxHashMap::default()),
        }
    }

    /// Intern a flat vector, returning the canonical representative.
    pub fn canonicalize(&self, args: &TypeArgsRef) -> TypeArgsRef {
        assert!(!args.is_lazy(), "canonicalize requires a flat vector");
        if args.is_canonical() {
            return args.clone();
        }
        let hash = structural_hash(args.flat_types());
        {
            let table = self.table.read();
            if let Some(bucket) = table.get(&hash) {
                for candidate in bucket {
                    if structural_eq(candidate.flat_types(), args.flat_types()) {
                        return candidate.clone();
                    }
                }
            }
        }

        let mut table = self.table.write();
        let bucket = table.entry(hash).or_default();
        for candidate in bucket.iter() {
            if structural_eq(candidate.flat_types(), args.flat_types()) {
                return candidate.clone();
            }
        }
        if let TypeArgs::Flat { canonical, .. } = &**args {
            canonical.store(true, Ordering::Release);
        }
        bucket.push(args.clone());
        args.clone()
    }

    /// Number of canonical vectors interned so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeArgsInterner {
    fn default() -> Self {
        Self::new()
    }
}

fn structural_hash(types: &[Type]) -> u64 {
    let mut hasher = FxHasher::default();
    hash_types(types, &mut hasher);
    hasher.finish()
}

fn hash_types(types: &[Type], hasher: &mut FxHasher) {
    types.len().hash(hasher);
    for t in types {
        match t {
            Type::Dynamic => 0u8.hash(hasher),
            Type::Parameter { index } => {
                1u8.hash(hasher);
                index.hash(hasher);
            }
            Type::Class { cid, type_args } => {
                2u8.hash(hasher);
                cid.hash(hasher);
                match type_args {
                    None => 0usize.hash(hasher),
                    Some(args) if args.is_lazy() => {
                        // Lazy vectors key by identity; they never reach the
                        // interner as top-level inputs.
                        (Arc::as_ptr(args) as usize).hash(hasher);
                    }
                    Some(args) => hash_types(args.flat_types(), hasher),
                }
            }
            Type::Malformed(err) => {
                3u8.hash(hasher);
                err.message.hash(hasher);
            }
        }
    }
}

fn structural_eq(a: &[Type], b: &[Type]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| type_eq(x, y))
}

fn type_eq(a: &Type, b: &Type) -> bool {
    match (a, b) {
        (Type::Dynamic, Type::Dynamic) => true,
        (Type::Parameter { index: i }, Type::Parameter { index: j }) => i == j,
        (
            Type::Class {
                cid: ca,
                type_args: aa,
            },
            Type::Class {
                cid: cb,
                type_args: ab,
            },
        ) => {
            ca == cb
                && match (aa, ab) {
                    (None, None) => true,
                    (Some(x), Some(y)) => {
                        Arc::ptr_eq(x, y)
                            || (!x.is_lazy()
                                && !y.is_lazy()
                                && structural_eq(x.flat_types(), y.flat_types()))
                    }
                    _ => false,
                }
        }
        (Type::Malformed(x), Type::Malformed(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{cids, ClassDecl, ClassTable};

    fn table_with_point() -> (ClassTable, ClassId) {
        let table = ClassTable::bootstrap();
        let point = table.register(ClassDecl {
            name: "Point".into(),
            ..Default::default()
        });
        (table, point.id())
    }

    #[test]
    fn test_dynamic_is_instantiated() {
        assert!(Type::Dynamic.is_instantiated());
        assert!(!Type::Parameter { index: 0 }.is_instantiated());
    }

    #[test]
    fn test_class_type_instantiated_iff_args_are() {
        let (_, point) = table_with_point();
        assert!(Type::class(point).is_instantiated());

        let args = TypeArgs::flat(vec![Type::Parameter { index: 0 }]);
        assert!(!Type::generic(cids::ARRAY, args).is_instantiated());
    }

    #[test]
    fn test_parameter_resolution() {
        let (table, point) = table_with_point();
        let instantiator = TypeArgs::flat(vec![Type::class(point)]);
        let resolved = Type::Parameter { index: 0 }
            .instantiate_from(Some(&instantiator), &table)
            .unwrap();
        assert_eq!(resolved.type_class_id(), Some(point));
    }

    #[test]
    fn test_parameter_without_instantiator_is_dynamic() {
        let (table, _) = table_with_point();
        let resolved = Type::Parameter { index: 0 }
            .instantiate_from(None, &table)
            .unwrap();
        assert!(matches!(resolved, Type::Dynamic));
    }

    #[test]
    fn test_uninstantiated_identity() {
        let identity = TypeArgs::flat(vec![
            Type::Parameter { index: 0 },
            Type::Parameter { index: 1 },
        ]);
        assert!(identity.is_uninstantiated_identity());

        let shuffled = TypeArgs::flat(vec![
            Type::Parameter { index: 1 },
            Type::Parameter { index: 0 },
        ]);
        assert!(!shuffled.is_uninstantiated_identity());
    }

    #[test]
    fn test_lazy_is_instantiated_but_not_canonical() {
        let (table, point) = table_with_point();
        let uninst = TypeArgs::flat(vec![Type::Parameter { index: 0 }]);
        let instantiator = TypeArgs::flat(vec![Type::class(point)]);
        let lazy = TypeArgs::lazy(uninst, Some(instantiator));

        assert!(lazy.is_lazy());
        assert!(lazy.is_instantiated());
        assert!(!lazy.is_canonical());

        let flat = flatten(&lazy, &table).unwrap();
        assert!(!flat.is_lazy());
        assert_eq!(flat.flat_types().len(), 1);
    }

    #[test]
    fn test_flatten_nested_lazy() {
        let (table, point) = table_with_point();
        let uninst = TypeArgs::flat(vec![Type::Parameter { index: 0 }]);
        let instantiator = TypeArgs::flat(vec![Type::class(point)]);
        let inner = TypeArgs::lazy(uninst.clone(), Some(instantiator));
        // The inner pair resolves to <Point>, which then instantiates the
        // outer parameter vector.
        let outer = Arc::new(TypeArgs::Lazy {
            uninstantiated: uninst,
            instantiator: Some(inner),
        });

        let flat = flatten(&outer, &table).unwrap();
        assert_eq!(flat.flat_types()[0].type_class_id(), Some(point));
    }

    #[test]
    fn test_canonicalize_dedups() {
        let (_, point) = table_with_point();
        let interner = TypeArgsInterner::new();

        let a = TypeArgs::flat(vec![Type::class(point)]);
        let b = TypeArgs::flat(vec![Type::class(point)]);
        assert!(!Arc::ptr_eq(&a, &b));

        let ca = interner.canonicalize(&a);
        let cb = interner.canonicalize(&b);
        assert!(Arc::ptr_eq(&ca, &cb));
        assert!(ca.is_canonical());
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let (_, point) = table_with_point();
        let interner = TypeArgsInterner::new();
        let args = TypeArgs::flat(vec![Type::class(point)]);

        let c1 = interner.canonicalize(&args);
        let c2 = interner.canonicalize(&c1);
        assert!(Arc::ptr_eq(&c1, &c2));
    }

    #[test]
    fn test_canonicalize_distinguishes_vectors() {
        let (_, point) = table_with_point();
        let interner = TypeArgsInterner::new();

        let a = interner.canonicalize(&TypeArgs::flat(vec![Type::class(point)]));
        let b = interner.canonicalize(&TypeArgs::flat(vec![Type::Dynamic]));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_subtype_dynamic_top() {
        let (table, point) = table_with_point();
        assert!(Type::class(point).is_subtype_of(&Type::Dynamic, &table));
        assert!(Type::Dynamic.is_subtype_of(&Type::class(point), &table));
    }

    #[test]
    fn test_subtype_covariant_args() {
        let table = ClassTable::bootstrap();
        let animal = table.register(ClassDecl {
            name: "Animal".into(),
            ..Default::default()
        });
        let cat = table.register(ClassDecl {
            name: "Cat".into(),
            super_class: Some(animal.id()),
            ..Default::default()
        });

        let list_of_cat = Type::generic(
            cids::ARRAY,
            TypeArgs::flat(vec![Type::class(cat.id())]),
        );
        let list_of_animal = Type::generic(
            cids::ARRAY,
            TypeArgs::flat(vec![Type::class(animal.id())]),
        );
        assert!(list_of_cat.is_subtype_of(&list_of_animal, &table));
        assert!(!list_of_animal.is_subtype_of(&list_of_cat, &table));
    }

    #[test]
    fn test_bound_violation() {
        let table = ClassTable::bootstrap();
        let num = table.register(ClassDecl {
            name: "num".into(),
            ..Default::default()
        });
        let boxy = table.register(ClassDecl {
            name: "NumBox".into(),
            num_type_arguments: 1,
            type_parameter_bounds: vec![Some(Type::class(num.id()))],
            ..Default::default()
        });
        let str_cls = table.register(ClassDecl {
            name: "String2".into(),
            ..Default::default()
        });

        let bad = Type::generic(
            boxy.id(),
            TypeArgs::flat(vec![Type::class(str_cls.id())]),
        );
        let err = bad.instantiate_from(None, &table).unwrap_err();
        assert!(err.message.contains("does not extend bound"));

        let good = Type::generic(boxy.id(), TypeArgs::flat(vec![Type::class(num.id())]));
        assert!(good.instantiate_from(None, &table).is_ok());
    }

    #[test]
    fn test_user_visible_name() {
        let (table, point) = table_with_point();
        let list = Type::generic(cids::ARRAY, TypeArgs::flat(vec![Type::class(point)]));
        assert_eq!(list.user_visible_name(&table), "Array<Point>");
        assert_eq!(Type::Dynamic.user_visible_name(&table), "dynamic");
    }
}
