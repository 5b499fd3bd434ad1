//! Tagged values.
//!
//! Runtime entries receive their arguments as tagged values and read each
//! one through a single `expect_*` accessor for the variant they declare;
//! a mismatch is a marshalling bug in the generated code and panics. The
//! accessors subsume the per-type checked reads a handle-based runtime
//! would use.

use crate::args_desc::ArgsDescRef;
use crate::class::{cids, ClassTable};
use crate::code::CodeRef;
use crate::field::{FieldRef, GUARD_LENGTH_NONE};
use crate::function::FunctionRef;
use crate::ic_data::IcDataRef;
use crate::instance::{ArrayRef, ContextRef, InstanceRef};
use crate::stc::StcRef;
use crate::types::{flatten, Type, TypeArgsRef};
use lumen_core::error::BoundError;
use lumen_core::ids::ClassId;
use lumen_core::Symbol;
use std::fmt;
use std::sync::Arc;

/// The argument-position sentinel meaning "no instantiator was passed";
/// the type-argument vector is to be stored as-is.
pub const NO_INSTANTIATOR: i64 = -1;

/// A tagged managed value or VM-internal object reference.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Smi(i64),
    Double(f64),
    Str(Symbol),
    Type(Arc<Type>),
    TypeArgs(TypeArgsRef),
    Instance(InstanceRef),
    Array(ArrayRef),
    Context(ContextRef),
    Class(crate::class::ClassRef),
    Function(FunctionRef),
    Code(CodeRef),
    Field(FieldRef),
    IcData(IcDataRef),
    SubtypeCache(StcRef),
    ArgsDesc(ArgsDescRef),
}

impl Value {
    /// Short name of the variant, for marshalling panics and diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Smi(_) => "smi",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Type(_) => "type",
            Value::TypeArgs(_) => "type-arguments",
            Value::Instance(_) => "instance",
            Value::Array(_) => "array",
            Value::Context(_) => "context",
            Value::Class(_) => "class",
            Value::Function(_) => "function",
            Value::Code(_) => "code",
            Value::Field(_) => "field",
            Value::IcData(_) => "ic-data",
            Value::SubtypeCache(_) => "subtype-test-cache",
            Value::ArgsDesc(_) => "arguments-descriptor",
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this is the "no instantiator" sentinel.
    #[inline]
    #[must_use]
    pub const fn is_no_instantiator_sentinel(&self) -> bool {
        matches!(self, Value::Smi(NO_INSTANTIATOR))
    }

    /// The class id of this value's runtime class.
    #[must_use]
    pub fn class_id(&self) -> ClassId {
        match self {
            Value::Null => cids::NULL,
            Value::Bool(_) => cids::BOOL,
            Value::Smi(_) => cids::SMI,
            Value::Double(_) => cids::DOUBLE,
            Value::Str(_) => cids::STRING,
            Value::Type(_) => cids::TYPE,
            Value::TypeArgs(_) => cids::TYPE_ARGUMENTS,
            Value::Instance(inst) => inst.cid(),
            Value::Array(_) => cids::ARRAY,
            Value::Context(_) => cids::CONTEXT,
            Value::Class(_) => cids::CLASS,
            Value::Function(_) => cids::FUNCTION,
            Value::Code(_) => cids::CODE,
            Value::Field(_) => cids::FIELD,
            Value::IcData(_) => cids::IC_DATA,
            Value::SubtypeCache(_) => cids::SUBTYPE_TEST_CACHE,
            Value::ArgsDesc(_) => cids::ARGS_DESCRIPTOR,
        }
    }

    // =========================================================================
    // Checked accessors
    // =========================================================================

    #[track_caller]
    fn mismatch(&self, expected: &'static str) -> ! {
        panic!("expected {expected} argument, found {}", self.kind_name())
    }

    #[track_caller]
    #[must_use]
    pub fn expect_smi(&self) -> i64 {
        match self {
            Value::Smi(v) => *v,
            other => other.mismatch("smi"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_string(&self) -> Symbol {
        match self {
            Value::Str(s) => s.clone(),
            other => other.mismatch("string"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_class(&self) -> crate::class::ClassRef {
        match self {
            Value::Class(c) => c.clone(),
            other => other.mismatch("class"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_function(&self) -> FunctionRef {
        match self {
            Value::Function(f) => f.clone(),
            other => other.mismatch("function"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_code(&self) -> CodeRef {
        match self {
            Value::Code(c) => c.clone(),
            other => other.mismatch("code"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_context(&self) -> ContextRef {
        match self {
            Value::Context(c) => c.clone(),
            other => other.mismatch("context"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_array(&self) -> ArrayRef {
        match self {
            Value::Array(a) => a.clone(),
            other => other.mismatch("array"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_field(&self) -> FieldRef {
        match self {
            Value::Field(f) => f.clone(),
            other => other.mismatch("field"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_ic_data(&self) -> IcDataRef {
        match self {
            Value::IcData(ic) => ic.clone(),
            other => other.mismatch("ic-data"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_args_desc(&self) -> ArgsDescRef {
        match self {
            Value::ArgsDesc(d) => d.clone(),
            other => other.mismatch("arguments-descriptor"),
        }
    }

    #[track_caller]
    #[must_use]
    pub fn expect_type(&self) -> Arc<Type> {
        match self {
            Value::Type(t) => t.clone(),
            other => other.mismatch("type"),
        }
    }

    /// A type-argument vector argument, where null means "none".
    #[track_caller]
    #[must_use]
    pub fn expect_type_args(&self) -> Option<TypeArgsRef> {
        match self {
            Value::Null => None,
            Value::TypeArgs(args) => Some(args.clone()),
            other => other.mismatch("type-arguments"),
        }
    }

    /// A subtype-test cache argument, where null means "no cache".
    #[track_caller]
    #[must_use]
    pub fn expect_subtype_cache(&self) -> Option<StcRef> {
        match self {
            Value::Null => None,
            Value::SubtypeCache(c) => Some(c.clone()),
            other => other.mismatch("subtype-test-cache"),
        }
    }

    /// A managed instance argument: any language-level value, as opposed
    /// to a VM-internal object such as code or IC data.
    #[track_caller]
    #[must_use]
    pub fn expect_instance(&self) -> Value {
        match self {
            Value::Null
            | Value::Bool(_)
            | Value::Smi(_)
            | Value::Double(_)
            | Value::Str(_)
            | Value::Instance(_)
            | Value::Array(_) => self.clone(),
            other => other.mismatch("instance"),
        }
    }

    // =========================================================================
    // Type-argument plumbing
    // =========================================================================

    /// The value's type-argument vector, for values that carry one.
    #[must_use]
    pub fn type_arguments(&self) -> Option<TypeArgsRef> {
        match self {
            Value::Instance(inst) => inst.type_arguments(),
            Value::Array(arr) => arr.type_arguments(),
            _ => None,
        }
    }

    /// Swap the value's type-argument vector. Panics for values that carry
    /// none; the engine only calls this after observing a vector.
    pub fn set_type_arguments(&self, args: Option<TypeArgsRef>) {
        match self {
            Value::Instance(inst) => inst.set_type_arguments(args),
            Value::Array(arr) => arr.set_type_arguments(args),
            other => panic!("value of kind {} has no type arguments", other.kind_name()),
        }
    }

    /// The length the field guard tracks for this value, or
    /// `GUARD_LENGTH_NONE` for classes without a usable length.
    #[must_use]
    pub fn guard_length(&self) -> i64 {
        match self {
            Value::Array(arr) => arr.len() as i64,
            Value::Str(s) => s.as_str().len() as i64,
            _ => GUARD_LENGTH_NONE,
        }
    }

    // =========================================================================
    // Runtime type
    // =========================================================================

    /// The value's runtime type, with its vector flattened when possible.
    #[must_use]
    pub fn get_type(&self, table: &ClassTable) -> Type {
        let args = self
            .type_arguments()
            .map(|args| flatten(&args, table).unwrap_or(args));
        Type::Class {
            cid: self.class_id(),
            type_args: args,
        }
    }

    /// User-visible name of the runtime type, for error messages.
    #[must_use]
    pub fn type_name(&self, table: &ClassTable) -> String {
        self.get_type(table).user_visible_name(table)
    }

    /// The `instance-of` relation, as supplied by the object model.
    ///
    /// An uninstantiated `tested` type resolves against the instantiator
    /// vector first; resolution may surface a bound error. Null is only an
    /// instance of Null and dynamic.
    pub fn is_instance_of(
        &self,
        tested: &Type,
        instantiator_type_args: Option<&TypeArgsRef>,
        table: &ClassTable,
    ) -> Result<bool, BoundError> {
        let tested = if tested.is_instantiated() {
            tested.clone()
        } else {
            tested.instantiate_from(instantiator_type_args, table)?
        };
        match &tested {
            Type::Dynamic => Ok(true),
            Type::Parameter { .. } | Type::Malformed(_) => Ok(false),
            Type::Class {
                cid: target_cid,
                type_args: target_args,
            } => {
                let self_cid = self.class_id();
                if self_cid == cids::NULL {
                    return Ok(*target_cid == cids::NULL);
                }
                if !table.is_subtype_class(self_cid, *target_cid) {
                    return Ok(false);
                }
                let Some(target_args) = target_args else {
                    return Ok(true);
                };
                let target_flat = flatten(target_args, table)?;
                let own = match self.type_arguments() {
                    None => {
                        // A raw instance reads as all-dynamic arguments.
                        return Ok(target_flat
                            .flat_types()
                            .iter()
                            .all(|t| matches!(t, Type::Dynamic)));
                    }
                    Some(args) => flatten(&args, table)?,
                };
                Ok(own
                    .flat_types()
                    .iter()
                    .zip(target_flat.flat_types().iter())
                    .all(|(s, o)| s.is_subtype_of(o, table)))
            }
        }
    }
}

impl PartialEq for Value {
    /// Identity semantics: primitives compare by value, heap objects by
    /// pointer.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Smi(a), Value::Smi(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => Arc::ptr_eq(a, b),
            (Value::TypeArgs(a), Value::TypeArgs(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Context(a), Value::Context(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Field(a), Value::Field(b)) => Arc::ptr_eq(a, b),
            (Value::IcData(a), Value::IcData(b)) => Arc::ptr_eq(a, b),
            (Value::SubtypeCache(a), Value::SubtypeCache(b)) => Arc::ptr_eq(a, b),
            (Value::ArgsDesc(a), Value::ArgsDesc(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Smi(v) => write!(f, "smi({v})"),
            Value::Double(v) => write!(f, "double({v})"),
            Value::Str(s) => write!(f, "str({:?})", s.as_str()),
            Value::Instance(inst) => write!(f, "instance({})", inst.cid()),
            Value::Array(arr) => write!(f, "array(len={})", arr.len()),
            other => f.write_str(other.kind_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassDecl, ClassTable};
    use crate::instance::{Array, Instance};
    use crate::types::TypeArgs;
    use lumen_core::symbol;

    #[test]
    fn test_class_ids_of_primitives() {
        assert_eq!(Value::Null.class_id(), cids::NULL);
        assert_eq!(Value::Bool(true).class_id(), cids::BOOL);
        assert_eq!(Value::Smi(0).class_id(), cids::SMI);
        assert_eq!(Value::Double(1.5).class_id(), cids::DOUBLE);
        assert_eq!(Value::Str(symbol::intern("s")).class_id(), cids::STRING);
    }

    #[test]
    fn test_expect_smi() {
        assert_eq!(Value::Smi(42).expect_smi(), 42);
    }

    #[test]
    #[should_panic(expected = "expected smi argument, found bool")]
    fn test_expect_smi_mismatch() {
        Value::Bool(false).expect_smi();
    }

    #[test]
    fn test_expect_type_args_null_is_none() {
        assert!(Value::Null.expect_type_args().is_none());
        let args = TypeArgs::flat(vec![Type::Dynamic]);
        assert!(Value::TypeArgs(args).expect_type_args().is_some());
    }

    #[test]
    #[should_panic(expected = "expected instance argument, found code")]
    fn test_expect_instance_rejects_vm_objects() {
        let code = crate::code::Code::new_unoptimized(64);
        Value::Code(code).expect_instance();
    }

    #[test]
    fn test_no_instantiator_sentinel() {
        assert!(Value::Smi(NO_INSTANTIATOR).is_no_instantiator_sentinel());
        assert!(!Value::Smi(0).is_no_instantiator_sentinel());
        assert!(!Value::Null.is_no_instantiator_sentinel());
    }

    #[test]
    fn test_guard_length() {
        assert_eq!(Value::Array(Array::new(5)).guard_length(), 5);
        assert_eq!(Value::Smi(1).guard_length(), GUARD_LENGTH_NONE);
    }

    #[test]
    fn test_identity_equality() {
        let inst = Instance::new(ClassId(20), 0);
        let a = Value::Instance(inst.clone());
        let b = Value::Instance(inst);
        let c = Value::Instance(Instance::new(ClassId(20), 0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(Value::Smi(1), Value::Smi(1));
    }

    #[test]
    fn test_is_instance_of_class_chain() {
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

        let pet = Value::Instance(Instance::new(cat.id(), 0));
        assert!(pet
            .is_instance_of(&Type::class(animal.id()), None, &table)
            .unwrap());
        assert!(!pet
            .is_instance_of(&Type::class(cids::STRING), None, &table)
            .unwrap());
        assert!(pet.is_instance_of(&Type::Dynamic, None, &table).unwrap());
    }

    #[test]
    fn test_null_is_only_instance_of_null() {
        let table = ClassTable::bootstrap();
        assert!(Value::Null
            .is_instance_of(&Type::class(cids::NULL), None, &table)
            .unwrap());
        assert!(!Value::Null
            .is_instance_of(&Type::class(cids::SMI), None, &table)
            .unwrap());
    }

    #[test]
    fn test_is_instance_of_generic() {
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

        let arr = Array::new(0);
        arr.set_type_arguments(Some(TypeArgs::flat(vec![Type::class(cat.id())])));
        let list = Value::Array(arr);

        let list_of_animal = Type::generic(
            cids::ARRAY,
            TypeArgs::flat(vec![Type::class(animal.id())]),
        );
        let list_of_cat = Type::generic(cids::ARRAY, TypeArgs::flat(vec![Type::class(cat.id())]));
        assert!(list.is_instance_of(&list_of_animal, None, &table).unwrap());
        assert!(list.is_instance_of(&list_of_cat, None, &table).unwrap());
    }

    #[test]
    fn test_is_instance_of_uninstantiated_resolves_from_instantiator() {
        let table = ClassTable::bootstrap();
        let point = table.register(ClassDecl {
            name: "Point".into(),
            ..Default::default()
        });

        // Testing against type parameter T0 with instantiator <Point>.
        let tested = Type::Parameter { index: 0 };
        let instantiator = TypeArgs::flat(vec![Type::class(point.id())]);

        let yes = Value::Instance(Instance::new(point.id(), 0));
        assert!(yes
            .is_instance_of(&tested, Some(&instantiator), &table)
            .unwrap());

        let no = Value::Smi(3);
        assert!(!no
            .is_instance_of(&tested, Some(&instantiator), &table)
            .unwrap());
    }

    #[test]
    fn test_type_name() {
        let table = ClassTable::bootstrap();
        assert_eq!(Value::Smi(1).type_name(&table), "int");
        let arr = Array::new(0);
        arr.set_type_arguments(Some(TypeArgs::flat(vec![Type::class(cids::SMI)])));
        assert_eq!(Value::Array(arr).type_name(&table), "Array<int>");
    }
}
